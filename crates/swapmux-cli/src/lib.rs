//! Composition root for the `swapmux` binary: argument parsing, config
//! loading and wiring, and signal-driven serve/reload/shutdown.

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod error;
pub mod parser;

pub use bootstrap::{bootstrap, reload, run_preload, shutdown_all_instances, AppContext};
pub use error::CliError;
pub use parser::Cli;
