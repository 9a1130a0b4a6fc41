//! External command execution.
//!
//! Control-plane, storage and host adapters shell out through
//! [`CommandRunner`] so they can be exercised against scripted fakes.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ClusterError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; `None` when terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Runs commands on the local host with a wall-clock budget.
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("exec: {} {}", program, args.join(" "));
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ClusterError::precondition(format!("required tool `{}` is not installed", program))
                }
                _ => ClusterError::command(program, e.to_string()),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ClusterError::Timeout(self.timeout, format!("{} {}", program, args.join(" "))))?
            .map_err(|e| ClusterError::command(program, e.to_string()))?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Split a configured command line on whitespace.
pub fn split_command_line(line: &str) -> Option<(&str, Vec<&str>)> {
    let mut parts = line.split_whitespace();
    let program = parts.next()?;
    Some((program, parts.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_tool_is_precondition() {
        let runner = SystemCommandRunner::default();
        let err = runner
            .run("swarmkeeper-definitely-not-installed", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Precondition(_)));
    }

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let out = CommandOutput {
            status: Some(1),
            stdout: "partial".into(),
            stderr: "  Error: boom \n".into(),
        };
        assert_eq!(out.diagnostic(), "Error: boom");
        assert_eq!(CommandOutput::failure(1, "").diagnostic(), "");
    }

    #[test]
    fn test_split_command_line() {
        let (program, args) = split_command_line("docker system prune -f").unwrap();
        assert_eq!(program, "docker");
        assert_eq!(args, vec!["system", "prune", "-f"]);
        assert!(split_command_line("   ").is_none());
    }
}
