//! Wire DTOs that are not simply `swapmux_core` types reused verbatim: the
//! OpenAI-style catalog listing and the management API's own shapes.
//! Request bodies for the forwarded OpenAI routes (chat/completions,
//! completions, embeddings, audio, rerank, images) are deliberately *not*
//! modeled as typed structs here — their shape varies per route and per
//! upstream, and the Proxy Handler only ever needs the `model`/`stream`
//! fields, read straight off a `serde_json::Value` in `server.rs`.

use serde::{Deserialize, Serialize};

use swapmux_core::ModelInstanceState;

/// One entry in `GET /v1/models`, matching the OpenAI catalog shape
/// (section 6: "id, object=model, created, owned_by").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
}

impl ModelInfo {
    #[must_use]
    pub fn new(id: String, created: u64) -> Self {
        Self {
            id,
            object: "model",
            created,
            owned_by: "swapmux",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

impl ModelsResponse {
    #[must_use]
    pub const fn new(data: Vec<ModelInfo>) -> Self {
        Self { object: "list", data }
    }
}

/// One entry in `GET /api/models/`'s management listing (section 6:
/// "management listing with state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementModelInfo {
    pub id: String,
    pub state: ModelInstanceState,
    pub port: Option<u16>,
    pub group: String,
    pub persistent: bool,
    pub unlisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementModelsResponse {
    pub models: Vec<ManagementModelInfo>,
}

/// `GET /api/version` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: &'static str,
}

impl Default for VersionResponse {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// `POST /api/models/unload[/<id>]` acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadResponse {
    pub unloaded: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_info_is_owned_by_swapmux() {
        let info = ModelInfo::new("llama-3".to_string(), 0);
        assert_eq!(info.object, "model");
        assert_eq!(info.owned_by, "swapmux");
    }
}
