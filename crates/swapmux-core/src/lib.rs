//! Domain types and port traits shared by the runtime and proxy crates.
//!
//! Nothing in this crate touches a socket, a child process, or a
//! filesystem beyond reading the config file. Everything here is plain
//! data and trait seams so `swapmux-runtime` and `swapmux-proxy` can be
//! tested against fakes instead of real upstream processes.

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod ports;

pub use config::Config;
pub use error::{ConfigError, SwapmuxError};
pub use events::{Event, EventKind, LogDataEvent, LogSource, MetricsEvent, ModelStatusEvent};
pub use model::{
    CapturePayload, FilterRules, GroupConfig, ModelConfig, ModelInstanceState, RequestRecord,
    DEFAULT_GROUP,
};
pub use ports::{EventPublisher, EventSubscription, NoopPublisher};
