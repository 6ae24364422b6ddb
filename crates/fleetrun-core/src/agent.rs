//! Agent capability.
//!
//! Orchestration code talks to an AI agent only through [`Agent`]. The one
//! provided backend, [`CommandAgent`], runs an agent CLI once per prompt and
//! reads its answer from stdout. Cancelling a send means dropping its future;
//! the child process is killed on drop.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::error::{Error, Result};

/// A prompt-in, text-out agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Send a prompt and wait for the complete response.
    async fn send(&self, prompt: &str) -> Result<String>;

    /// Send a prompt, passing each chunk of output to `on_chunk` as it
    /// arrives. Returns the full response.
    async fn send_stream(
        &self,
        prompt: &str,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<String>;
}

/// Runs `<program> <args..> <prompt>` for every request.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }

    /// Run the agent inside `dir` instead of the current directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn_error(&self, e: &std::io::Error) -> Error {
        Error::Agent(format!("failed to run {}: {e}", self.program))
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn send(&self, prompt: &str) -> Result<String> {
        debug!(program = %self.program, prompt_len = prompt.len(), "Sending prompt");
        let output = self
            .command(prompt)
            .output()
            .await
            .map_err(|e| self.spawn_error(&e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Agent(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn send_stream(
        &self,
        prompt: &str,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<String> {
        let mut child = self
            .command(prompt)
            .spawn()
            .map_err(|e| self.spawn_error(&e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Agent("failed to capture agent stdout".to_string()))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut text = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            on_chunk(&line);
            text.push_str(&line);
            text.push('\n');
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(Error::Agent(format!(
                "{} exited with {status}: {}",
                self.program,
                stderr.trim()
            )));
        }
        info!(program = %self.program, response_len = text.len(), "Agent stream finished");
        Ok(text)
    }
}

/// Model and token accounting written by an agent subprocess.
///
/// The file belongs to the subprocess; fleetrun only reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    #[serde(default)]
    pub model: String,
    #[serde(default, alias = "token_usage")]
    pub token_usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default, alias = "prompt_tokens")]
    pub prompt_tokens: u64,
    #[serde(default, alias = "response_tokens")]
    pub response_tokens: u64,
    #[serde(default, alias = "total_tokens")]
    pub total_tokens: u64,
}

impl AgentState {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandAgent {
        // The prompt lands in `$0` of the script.
        CommandAgent::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn send_returns_stdout() {
        let agent = shell(r#"echo "got: $0""#);
        let text = agent.send("build the parser").await.unwrap();
        assert_eq!(text.trim(), "got: build the parser");
    }

    #[tokio::test]
    async fn send_reports_failure() {
        let agent = shell("echo broken >&2; exit 3");
        let err = agent.send("x").await.unwrap_err().to_string();
        assert!(err.contains("broken"), "{err}");
    }

    #[tokio::test]
    async fn send_stream_yields_lines() {
        let agent = shell("echo one; echo two");
        let mut chunks = Vec::new();
        let text = agent
            .send_stream("x", &mut |chunk: &str| chunks.push(chunk.to_string()))
            .await
            .unwrap();
        assert_eq!(chunks, vec!["one", "two"]);
        assert_eq!(text, "one\ntwo\n");
    }

    #[tokio::test]
    async fn missing_program_is_agent_error() {
        let agent = CommandAgent::new("/nonexistent/agent-binary", Vec::new());
        assert!(matches!(agent.send("x").await, Err(Error::Agent(_))));
    }

    #[tokio::test]
    async fn agent_state_accepts_both_key_styles() {
        let dir = tempfile::tempdir().unwrap();
        let camel = dir.path().join("camel.json");
        let snake = dir.path().join("snake.json");
        std::fs::write(
            &camel,
            r#"{"model":"m1","tokenUsage":{"promptTokens":1,"responseTokens":2,"totalTokens":3}}"#,
        )
        .unwrap();
        std::fs::write(
            &snake,
            r#"{"model":"m1","token_usage":{"prompt_tokens":1,"response_tokens":2,"total_tokens":3}}"#,
        )
        .unwrap();

        let a = AgentState::load(&camel).await.unwrap();
        let b = AgentState::load(&snake).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.token_usage.total_tokens, 3);
    }
}
