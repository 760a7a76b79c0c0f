//! Process Runner: forks/execs one upstream's command template, tails its
//! stdout/stderr onto the Event Bus, polls its health endpoint, and drives
//! the stop escalation (polite signal or `cmdStop`, a grace window, then a
//! hard kill).
//!
//! Grounded on `gglib-runtime/src/process/core.rs`'s
//! `build_and_spawn_command`/`spawn_log_readers` (generalized from a fixed
//! llama-server argv builder to an arbitrary shell command template, since
//! the spec's `cmd` is an opaque string rather than a structured arg list),
//! `process/stream.rs`'s byte-safe `read_until` log tailing (kept verbatim
//! rather than `BufReader::lines()`, since upstream output is not
//! guaranteed to be valid UTF-8), and `process/shutdown/child.rs`'s
//! SIGTERM-then-SIGKILL escalation (generalized to accept an operator
//! `cmdStop` in place of the signal, and a configurable grace window
//! instead of the teacher's fixed 5s).

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use std::sync::Arc;

use reqwest::Client;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use swapmux_core::events::{Event, LogDataEvent, LogSource};
use swapmux_core::ports::EventPublisher;
use swapmux_core::{ModelConfig, SwapmuxError};

/// Substitutes `${PORT}` and every `${name}` macro key in a command
/// template. Macros are a flat string table (section 6: "`macros`: string
/// substitution within cmd templates"); `${PORT}` is always available and
/// takes precedence over a same-named macro.
#[must_use]
pub fn substitute_template(template: &str, port: u16, macros: &HashMap<String, String>) -> String {
    let mut out = template.replace("${PORT}", &port.to_string());
    for (key, value) in macros {
        out = out.replace(&format!("${{{key}}}"), value);
    }
    out
}

/// Drives exactly one upstream child process for one [`ModelConfig`].
pub struct ProcessRunner {
    model: ModelConfig,
    macros: HashMap<String, String>,
    events: Arc<dyn EventPublisher>,
    health_check_timeout_secs: u64,
    wait_delay: Duration,
}

impl ProcessRunner {
    #[must_use]
    pub fn new(
        model: ModelConfig,
        macros: HashMap<String, String>,
        events: Arc<dyn EventPublisher>,
        health_check_timeout_secs: u64,
        wait_delay: Duration,
    ) -> Self {
        Self {
            model,
            macros,
            events,
            health_check_timeout_secs,
            wait_delay,
        }
    }

    #[must_use]
    pub const fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// Spawns the templated command on `port`, with the parent's
    /// environment plus this model's `env` overrides, and starts the
    /// stdout/stderr tail tasks. Does not wait for health.
    pub fn spawn(&self, port: u16) -> Result<Child, SwapmuxError> {
        let template = self
            .model
            .cmd
            .as_deref()
            .expect("spawn is only called for managed models (cmd is Some)");
        let command_line = substitute_template(template, port, &self.macros);

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&command_line)
            .envs(&self.model.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SwapmuxError::ExecFailure {
            model: self.model.id.clone(),
            reason: source.to_string(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_log_reader(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_log_reader(stderr, "stderr");
        }

        Ok(child)
    }

    fn spawn_log_reader(&self, stream: impl AsyncRead + Unpin + Send + 'static, stream_name: &'static str) {
        let events = self.events.clone();
        let model_id = self.model.id.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf: Vec<u8> = Vec::with_capacity(256);
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if buf.last() == Some(&b'\n') {
                            buf.pop();
                            if buf.last() == Some(&b'\r') {
                                buf.pop();
                            }
                        }
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        events
                            .publish(Event::LogData(LogDataEvent {
                                source: LogSource::Upstream,
                                model_id: Some(model_id.clone()),
                                line,
                                timestamp_ms: now_ms(),
                            }))
                            .await;
                    }
                    Err(error) => {
                        debug!(model_id = %model_id, %stream_name, %error, "log stream reader exiting");
                        break;
                    }
                }
            }
        });
    }

    /// Polls the configured health endpoint until it returns a 2xx status
    /// or `healthCheckTimeout` elapses.
    pub async fn wait_healthy(&self, port: u16) -> Result<(), SwapmuxError> {
        let url = format!("http://127.0.0.1:{port}{}", self.model.health_endpoint);
        let client = Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("reqwest client build is infallible with default settings");
        let deadline = Instant::now() + Duration::from_secs(self.health_check_timeout_secs);

        loop {
            if let Ok(response) = client.get(&url).send().await {
                if response.status().is_success() {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(SwapmuxError::HealthCheckTimeout {
                    model: self.model.id.clone(),
                    timeout_secs: self.health_check_timeout_secs,
                });
            }
            sleep(Duration::from_millis(300)).await;
        }
    }

    /// Escalation: a polite stop (`cmdStop` if configured, otherwise a
    /// termination signal), a grace window, then an unconditional kill.
    /// The child is always reaped; a `wait` error is surfaced to the
    /// caller only when this was *not* a requested stop (the crash-watch
    /// path calls `wait` directly instead of this method).
    pub async fn stop(&self, mut child: Child) {
        if let Some(stop_cmd) = &self.model.cmd_stop {
            let _ = Command::new("sh").arg("-c").arg(stop_cmd).status().await;
        } else {
            Self::signal_terminate(&child);
        }

        match timeout(self.wait_delay, child.wait()).await {
            Ok(_status) => {}
            Err(_elapsed) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(child: &Child) {
        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(_child: &Child) {
        // No portable graceful-stop signal; the wait_delay timeout below
        // falls straight through to an unconditional kill.
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_port_and_macros() {
        let mut macros = HashMap::new();
        macros.insert("MODEL_PATH".to_string(), "/models/llama.gguf".to_string());
        let rendered = substitute_template(
            "llama-server --port ${PORT} -m ${MODEL_PATH}",
            5801,
            &macros,
        );
        assert_eq!(rendered, "llama-server --port 5801 -m /models/llama.gguf");
    }

    #[test]
    fn port_wins_over_a_macro_named_port() {
        let mut macros = HashMap::new();
        macros.insert("PORT".to_string(), "9999".to_string());
        let rendered = substitute_template("x --port ${PORT}", 5801, &macros);
        assert_eq!(rendered, "x --port 5801");
    }
}
