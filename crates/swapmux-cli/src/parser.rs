//! Top-level CLI argument parsing (section 10.4).

use std::path::PathBuf;

use clap::Parser;

/// `swapmux` — a reverse proxy that swaps local inference server processes
/// in and out of a small pool of GPU/CPU slots on demand.
#[derive(Parser, Debug)]
#[command(name = "swapmux")]
#[command(about = "Process-swapping reverse proxy for local inference servers")]
#[command(version)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short = 'c', default_value = "./config.yaml", env = "SWAPMUX_CONFIG")]
    pub config: PathBuf,

    /// Override the listen address (host:port) from the config file.
    #[arg(long, env = "SWAPMUX_LISTEN")]
    pub listen: Option<String>,

    /// Override the `logLevel` config key / `RUST_LOG` default.
    #[arg(long, env = "SWAPMUX_LOG_LEVEL")]
    pub log_level: Option<String>,
}
