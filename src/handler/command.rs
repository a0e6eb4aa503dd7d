//! Handlers that run an external command per job.
//!
//! The job is written as JSON to the command's stdin. The exit status is the
//! outcome: 0 is success, 75 (`EX_TEMPFAIL`) asks for a retry, anything else
//! is a terminal failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::JobHandler;
use crate::error::{Error, Result};
use crate::model::{Job, Outcome};

pub const EXIT_TEMPFAIL: i32 = 75;

/// Keep this much of stderr in failure reasons.
const STDERR_TAIL: usize = 512;

#[derive(Debug, Deserialize)]
struct HandlerFile {
    handler: CommandConfig,
}

/// A `[handler]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    pub kind: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill the command after this long. Unset means the pool's job timeout
    /// is the only limit.
    pub timeout_secs: Option<u64>,
}

impl CommandConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: HandlerFile = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("bad handler config {}: {e}", path.display()))
        })?;
        Ok(file.handler)
    }
}

pub struct CommandHandler {
    config: CommandConfig,
}

impl CommandHandler {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    async fn run(&self, job: &Job) -> Result<std::process::Output> {
        // Relative commands resolve against the process cwd.
        let command = if self.config.command.is_relative() {
            std::env::current_dir()?.join(&self.config.command)
        } else {
            self.config.command.clone()
        };
        debug!(job_id = %job.id, command = %command.display(), "running handler command");

        let mut child = Command::new(&command)
            .args(&self.config.args)
            .env("WORKVAULT_JOB_ID", job.id.to_string())
            .env("WORKVAULT_JOB_KIND", &job.kind)
            .env("WORKVAULT_JOB_ATTEMPT", job.attempts.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = serde_json::to_vec(job)?;
            // A command that exits without reading stdin is not an error.
            if let Err(e) = stdin.write_all(&input).await
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(e.into());
            }
        }

        Ok(child.wait_with_output().await?)
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn process(&self, job: &Job) -> Outcome {
        let start = Instant::now();
        let run = self.run(job);
        let result = match self.config.timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(job_id = %job.id, timeout_secs = secs, "handler command timed out");
                    return Outcome::retryable(format!("command timed out after {secs}s"));
                }
            },
            None => run.await,
        };

        let output = match result {
            Ok(output) => output,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Outcome::terminal(format!(
                    "command {} not found",
                    self.config.command.display()
                ));
            }
            Err(e) => return Outcome::retryable(format!("cannot run command: {e}")),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let code = output.status.code();
        debug!(job_id = %job.id, ?code, duration_ms, "handler command exited");
        outcome_for(code, &output.stderr)
    }
}

/// Map an exit status to an outcome. `None` means killed by a signal.
fn outcome_for(code: Option<i32>, stderr: &[u8]) -> Outcome {
    let detail = || {
        let text = String::from_utf8_lossy(stderr);
        let text = text.trim();
        let start = text
            .char_indices()
            .rev()
            .nth(STDERR_TAIL.saturating_sub(1))
            .map_or(0, |(i, _)| i);
        text[start..].to_string()
    };
    match code {
        Some(0) => Outcome::Success,
        Some(EXIT_TEMPFAIL) => Outcome::retryable(format!("exit {EXIT_TEMPFAIL}: {}", detail())),
        Some(code) => Outcome::terminal(format!("exit {code}: {}", detail())),
        None => Outcome::retryable(format!("killed by signal: {}", detail())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_to_outcomes() {
        assert_eq!(outcome_for(Some(0), b""), Outcome::Success);
        assert!(matches!(
            outcome_for(Some(75), b"busy"),
            Outcome::RetryableFailure(r) if r.contains("busy")
        ));
        assert!(matches!(outcome_for(Some(1), b""), Outcome::TerminalFailure(_)));
        assert!(matches!(outcome_for(None, b""), Outcome::RetryableFailure(_)));
    }

    #[test]
    fn long_stderr_is_cut_to_its_tail() {
        let noise = "x".repeat(2000) + "the actual error";
        let Outcome::TerminalFailure(reason) = outcome_for(Some(2), noise.as_bytes()) else {
            panic!("expected terminal failure");
        };
        assert!(reason.ends_with("the actual error"));
        assert!(reason.len() < 600);
    }

    #[test]
    fn handler_table_parses_from_toml() {
        let file: HandlerFile = toml::from_str(
            r#"
            [handler]
            kind = "render"
            command = "hooks/render.sh"
            args = ["--fast"]
            timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(file.handler.kind, "render");
        assert_eq!(file.handler.args, ["--fast"]);
        assert_eq!(file.handler.timeout_secs, Some(5));
    }
}
