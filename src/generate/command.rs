//! Generator backed by an external command.
//!
//! The prompt is written to the command's stdin and the reply is read from
//! stdout, which suits agent CLIs run in print mode.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{GenerationReply, GenerationRequest, Generator, parse_reply};
use crate::config::GeneratorSection;
use crate::errors::GenerationError;

/// Runs a command once per generation call.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
            working_dir: None,
        }
    }

    /// Build from the `[generator]` config section.
    pub fn from_config(section: &GeneratorSection) -> Self {
        Self::new(
            section.command(),
            section.args.clone(),
            Duration::from_secs(section.timeout_secs),
        )
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn run(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("CREWFORGE_ROLE", request.role.slug())
            .env("CREWFORGE_PHASE", request.phase.to_string())
            .env("CREWFORGE_AGENT_ID", request.agent_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                GenerationError::Unavailable(format!("cannot run '{}': {}", self.command, e))
            }
            _ => GenerationError::Transient(format!("failed to spawn '{}': {}", self.command, e)),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| GenerationError::Transient(format!("failed to write prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| GenerationError::Transient(format!("failed to close stdin: {}", e)))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                GenerationError::Transient(format!(
                    "'{}' timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| GenerationError::Transient(format!("failed to read output: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GenerationError::Transient(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| GenerationError::Malformed(format!("output is not UTF-8: {}", e)))
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationReply, GenerationError> {
        let start = Instant::now();
        let raw = self.run(&request).await?;
        debug!(
            phase = %request.phase,
            role = %request.role,
            bytes = raw.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generation command finished"
        );
        parse_reply(&raw)
    }
}
