//! CLI-specific error types and exit-code mapping.

use thiserror::Error;

use swapmux_core::ConfigError;

/// Top-level CLI error. Distinct from [`swapmux_core::SwapmuxError`]
/// because a config load/parse failure has to happen before any registry
/// (and therefore any `SwapmuxError`) exists.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Exit code reported by `main`. Section 6: "exit codes 0 on clean
    /// shutdown, non-zero on configuration error".
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 78, // EX_CONFIG
            Self::Bind { .. } => 69, // EX_UNAVAILABLE
            Self::Other(_) => 1,
        }
    }
}
