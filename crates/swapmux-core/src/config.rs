use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{FilterRules, GroupConfig, ModelConfig, DEFAULT_GROUP};

/// Default health-check timeout, in seconds, applied to every model that
/// does not override it.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 120;
/// Default first port handed out by the Port Allocator.
pub const DEFAULT_START_PORT: u16 = 5800;
/// Default Metrics Store capacity.
pub const DEFAULT_METRICS_MAX_IN_MEMORY: usize = 1_000;
/// Default per-side capture size cap, in bytes. Not specified by the
/// reference behavior this was distilled from; picked to comfortably hold a
/// single large chat request/response pair. See `DESIGN.md`.
pub const DEFAULT_CAPTURE_MAX_BYTES: usize = 1024 * 1024;
/// Grace period the Process Runner waits after a polite stop signal before
/// escalating to a forced kill.
pub const DEFAULT_WAIT_DELAY_MS: u64 = 500;

/// The as-written-in-YAML document shape. Kept separate from [`Config`] so
/// the wire format can gain optional fields without disturbing the
/// validated, normalized runtime representation everything else consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub health_check_timeout: Option<u64>,
    #[serde(default)]
    pub start_port: Option<u16>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub metrics_max_in_memory: Option<usize>,
    #[serde(default)]
    pub capture_max_bytes: Option<usize>,
    #[serde(default)]
    pub macros: HashMap<String, String>,
    #[serde(default)]
    pub hooks: RawHooks,
    #[serde(default)]
    pub models: HashMap<String, RawModelConfig>,
    #[serde(default)]
    pub profiles: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub groups: HashMap<String, RawGroupConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawHooks {
    #[serde(default)]
    pub on_startup: RawOnStartupHook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawOnStartupHook {
    #[serde(default)]
    pub preload: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawModelConfig {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub cmd_stop: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub health_endpoint: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub unload_after: Option<u64>,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    #[serde(default)]
    pub unlisted: bool,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub filters: Option<FilterRules>,
    #[serde(default)]
    pub capture: Option<bool>,
    #[serde(default)]
    pub use_model_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawGroupConfig {
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub swap: Option<bool>,
    #[serde(default)]
    pub exclusive: Option<bool>,
    #[serde(default)]
    pub persistent: Option<bool>,
}

/// The validated, normalized configuration snapshot every other component
/// consumes. Immutable once built; a config reload builds a fresh one and
/// atomically swaps it in rather than mutating this one in place.
#[derive(Debug, Clone)]
pub struct Config {
    pub health_check_timeout_secs: u64,
    pub start_port: u16,
    pub log_level: Option<String>,
    pub metrics_max_in_memory: usize,
    pub capture_max_bytes: usize,
    pub macros: HashMap<String, String>,
    pub preload: Vec<String>,
    pub models: HashMap<String, ModelConfig>,
    pub profiles: HashMap<String, Vec<String>>,
    pub groups: HashMap<String, GroupConfig>,
    /// alias (or profile-stripped name) -> canonical model id
    pub aliases: HashMap<String, String>,
}

impl Config {
    /// Parses and validates a config file from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text, &path.display().to_string())
    }

    /// Parses and validates a config document already read into memory.
    /// `source_label` is only used in error messages.
    pub fn from_yaml(text: &str, source_label: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: source_label.to_string(),
            source,
        })?;
        Self::normalize(raw)
    }

    fn normalize(raw: RawConfig) -> Result<Self, ConfigError> {
        let health_check_timeout_secs = raw
            .health_check_timeout
            .unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS);
        let start_port = raw.start_port.unwrap_or(DEFAULT_START_PORT);
        let metrics_max_in_memory = raw
            .metrics_max_in_memory
            .unwrap_or(DEFAULT_METRICS_MAX_IN_MEMORY);
        let capture_max_bytes = raw.capture_max_bytes.unwrap_or(DEFAULT_CAPTURE_MAX_BYTES);

        let mut models = HashMap::new();
        let mut ungrouped = Vec::new();
        for (id, raw_model) in raw.models {
            if raw_model.cmd.is_none() && raw_model.proxy.is_none() {
                return Err(ConfigError::ModelHasNoTarget(id));
            }
            let group = raw_model.group.clone().unwrap_or_default();
            if group.is_empty() {
                ungrouped.push(id.clone());
            }
            let model = ModelConfig {
                id: id.clone(),
                cmd: raw_model.cmd,
                cmd_stop: raw_model.cmd_stop,
                proxy_url: raw_model.proxy,
                health_endpoint: raw_model
                    .health_endpoint
                    .unwrap_or_else(|| "/health".to_string()),
                aliases: raw_model.aliases,
                env: raw_model.env,
                unload_after_secs: raw_model.unload_after.unwrap_or(0),
                concurrency_limit: raw_model.concurrency_limit.unwrap_or(0),
                unlisted: raw_model.unlisted,
                group: if group.is_empty() {
                    DEFAULT_GROUP.to_string()
                } else {
                    group
                },
                filters: raw_model.filters.unwrap_or_default(),
                capture: raw_model.capture.unwrap_or(false),
                use_model_name: raw_model.use_model_name,
            };
            models.insert(id, model);
        }

        let mut groups = HashMap::new();
        for (name, raw_group) in raw.groups {
            for member in &raw_group.members {
                if !models.contains_key(member) {
                    return Err(ConfigError::UnknownProfileMember {
                        profile: name.clone(),
                        model: member.clone(),
                    });
                }
            }
            groups.insert(
                name.clone(),
                GroupConfig {
                    name: name.clone(),
                    members: raw_group.members,
                    swap: raw_group.swap.unwrap_or(true),
                    exclusive: raw_group.exclusive.unwrap_or(false),
                    persistent: raw_group.persistent.unwrap_or(false),
                },
            );
        }
        if !ungrouped.is_empty() {
            groups.insert(
                DEFAULT_GROUP.to_string(),
                GroupConfig::default_group(ungrouped),
            );
        }

        for model in models.values() {
            if !groups.contains_key(&model.group) {
                return Err(ConfigError::UnknownGroup(
                    model.id.clone(),
                    model.group.clone(),
                ));
            }
        }

        for (profile, members) in &raw.profiles {
            for member in members {
                let resolved = member.strip_prefix("profile:").unwrap_or(member);
                if !models.contains_key(resolved) {
                    return Err(ConfigError::UnknownProfileMember {
                        profile: profile.clone(),
                        model: resolved.to_string(),
                    });
                }
            }
        }

        let aliases = build_alias_table(&models)?;

        Ok(Self {
            health_check_timeout_secs,
            start_port,
            log_level: raw.log_level,
            metrics_max_in_memory,
            capture_max_bytes,
            macros: raw.macros,
            preload: raw.hooks.on_startup.preload,
            models,
            profiles: raw.profiles,
            groups,
            aliases,
        })
    }

    /// Resolves a client-supplied name (alias, `profile:`-prefixed name, or
    /// a bare model id) to the canonical model id, stripping and returning
    /// the profile slug when one was present so the caller can decide
    /// whether to rewrite the outbound `model` JSON field.
    #[must_use]
    pub fn resolve_name<'a>(&self, name: &'a str) -> (Option<&'a str>, Option<&str>) {
        if let Some(rest) = name.strip_prefix("profile:") {
            let canonical = self.aliases.get(rest).map(String::as_str);
            return (Some(name), canonical.or(Some(rest)));
        }
        let canonical = self
            .aliases
            .get(name)
            .map(String::as_str)
            .or(if self.models.contains_key(name) {
                Some(name)
            } else {
                None
            });
        (None, canonical)
    }
}

/// Builds the alias -> canonical-id lookup table, rejecting any collision
/// between two distinct models' aliases (and between an alias and another
/// model's own id) at load time rather than at request time.
fn build_alias_table(
    models: &HashMap<String, ModelConfig>,
) -> Result<HashMap<String, String>, ConfigError> {
    let mut aliases = HashMap::new();
    for model in models.values() {
        aliases.insert(model.id.clone(), model.id.clone());
    }
    for model in models.values() {
        for alias in &model.aliases {
            if let Some(existing) = aliases.get(alias) {
                if existing != &model.id {
                    return Err(ConfigError::AliasCollision {
                        alias: alias.clone(),
                        first: existing.clone(),
                        second: model.id.clone(),
                    });
                }
            }
            aliases.insert(alias.clone(), model.id.clone());
        }
    }
    Ok(aliases)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
models:
  llama-3:
    cmd: "llama-server --port ${PORT}"
    aliases: ["llama"]
  qwen:
    cmd: "llama-server --port ${PORT} -m qwen.gguf"
    group: swap-group
groups:
  swap-group:
    members: ["qwen"]
    swap: true
"#
    }

    #[test]
    fn default_group_materializes_for_ungrouped_models() {
        let config = Config::from_yaml(minimal_yaml(), "test").unwrap();
        let default_group = &config.groups[DEFAULT_GROUP];
        assert!(default_group.swap);
        assert!(default_group.exclusive);
        assert!(!default_group.persistent);
        assert_eq!(default_group.members, vec!["llama-3".to_string()]);
    }

    #[test]
    fn alias_resolves_to_canonical_id() {
        let config = Config::from_yaml(minimal_yaml(), "test").unwrap();
        let (profile, canonical) = config.resolve_name("llama");
        assert_eq!(profile, None);
        assert_eq!(canonical, Some("llama-3"));
    }

    #[test]
    fn profile_prefix_is_stripped_and_remembered() {
        let config = Config::from_yaml(minimal_yaml(), "test").unwrap();
        let (profile, canonical) = config.resolve_name("profile:llama-3");
        assert_eq!(profile, Some("profile:llama-3"));
        assert_eq!(canonical, Some("llama-3"));
    }

    #[test]
    fn colliding_aliases_are_rejected_at_load() {
        let yaml = r#"
models:
  a:
    cmd: "x --port ${PORT}"
    aliases: ["shared"]
  b:
    cmd: "y --port ${PORT}"
    aliases: ["shared"]
"#;
        let err = Config::from_yaml(yaml, "test").unwrap_err();
        assert!(matches!(err, ConfigError::AliasCollision { .. }));
    }

    #[test]
    fn model_without_cmd_or_proxy_is_rejected() {
        let yaml = r#"
models:
  broken: {}
"#;
        let err = Config::from_yaml(yaml, "test").unwrap_err();
        assert!(matches!(err, ConfigError::ModelHasNoTarget(_)));
    }
}
