use thiserror::Error;

/// Every failure mode the process lifecycle, swap scheduler, and proxy can
/// surface to a caller. Variants map 1:1 onto an HTTP status via
/// [`SwapmuxError::suggested_status_code`].
#[derive(Debug, Error)]
pub enum SwapmuxError {
    #[error("unknown model \"{0}\"")]
    UnknownModel(String),

    #[error("no port available in configured range")]
    NoPortAvailable,

    #[error("health check for \"{model}\" timed out after {timeout_secs}s")]
    HealthCheckTimeout { model: String, timeout_secs: u64 },

    #[error("failed to exec command for \"{model}\": {reason}")]
    ExecFailure { model: String, reason: String },

    #[error("upstream for \"{model}\" exited with status {code}")]
    NonZeroExit { model: String, code: i32 },

    #[error("request canceled")]
    Canceled,

    #[error("instance is shutting down")]
    Shutdown,

    #[error("concurrency limit reached for \"{0}\"")]
    ConcurrencyLimit(String),

    #[error("upstream disconnected")]
    UpstreamDisconnect,

    #[error("bad request body: {0}")]
    BadRequestBody(String),

    #[error("capture exceeded size cap and was dropped")]
    CaptureOverflow,

    #[error("admitting \"{instance}\" would require stopping persistent member \"{blocked_by}\"")]
    BlockedByPersistent { instance: String, blocked_by: String },

    #[error("alias \"{alias}\" is claimed by both \"{first}\" and \"{second}\"")]
    AliasCollision {
        alias: String,
        first: String,
        second: String,
    },

    #[error("capture not found for id \"{0}\"")]
    CaptureNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SwapmuxError {
    /// Whether the Swap Scheduler should retry this failure once after a
    /// short backoff rather than surfacing it to the client immediately.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NoPortAvailable)
    }

    /// The HTTP status a proxy handler should answer with when this error
    /// escapes to the edge.
    #[must_use]
    pub const fn suggested_status_code(&self) -> u16 {
        match self {
            Self::UnknownModel(_) => 404,
            Self::NoPortAvailable
            | Self::ExecFailure { .. }
            | Self::NonZeroExit { .. }
            | Self::BlockedByPersistent { .. } => 503,
            Self::HealthCheckTimeout { .. } => 504,
            Self::Canceled => 499,
            Self::Shutdown => 503,
            Self::ConcurrencyLimit(_) => 429,
            Self::UpstreamDisconnect => 502,
            Self::BadRequestBody(_) => 400,
            Self::CaptureOverflow => 200,
            Self::AliasCollision { .. } | Self::Config(_) => 500,
            Self::CaptureNotFound(_) => 404,
        }
    }

    /// Stable machine-readable error type, used in the `"type"` field of the
    /// JSON error body clients receive.
    #[must_use]
    pub const fn type_tag(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) => "unknown_model",
            Self::NoPortAvailable => "no_port_available",
            Self::HealthCheckTimeout { .. } => "health_check_timeout",
            Self::ExecFailure { .. } => "exec_failure",
            Self::NonZeroExit { .. } => "non_zero_exit",
            Self::Canceled => "canceled",
            Self::Shutdown => "shutdown",
            Self::ConcurrencyLimit(_) => "concurrency_limit",
            Self::UpstreamDisconnect => "upstream_disconnect",
            Self::BadRequestBody(_) => "bad_request_body",
            Self::CaptureOverflow => "capture_overflow",
            Self::BlockedByPersistent { .. } => "blocked_by_persistent",
            Self::AliasCollision { .. } => "alias_collision",
            Self::CaptureNotFound(_) => "capture_not_found",
            Self::Config(_) => "config_error",
        }
    }
}

/// Failures raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("alias \"{alias}\" is claimed by both \"{first}\" and \"{second}\"")]
    AliasCollision {
        alias: String,
        first: String,
        second: String,
    },

    #[error("model \"{0}\" is a member of unknown group \"{1}\"")]
    UnknownGroup(String, String),

    #[error("profile \"{profile}\" references unknown model \"{model}\"")]
    UnknownProfileMember { profile: String, model: String },

    #[error("model \"{0}\" has no cmd and no explicit proxy URL")]
    ModelHasNoTarget(String),
}
