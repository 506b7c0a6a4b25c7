//! Shell connector: runs an external command template with placeholders.
//!
//! Connectors bridge dutsched to lab services it does not talk to directly:
//! the fleet inventory and the remote execution service. They can be
//! implemented in any language; the only contract is the command line and
//! the output on stdout.
//!
//! # Templates
//!
//! A template is split into arguments with shell quoting rules first, and
//! placeholders are substituted per argument afterwards. A substituted value
//! therefore always stays one argument, whatever it contains:
//!
//! ```text
//! template:  lab-cli count --dims '{dimensions}'
//! argv:      ["lab-cli", "count", "--dims", "{\"pool\":[\"quota\"]}"]
//! ```
//!
//! # Example Connector (Python)
//! ```python
//! #!/usr/bin/env python3
//! import json, sys
//!
//! dims = json.loads(sys.argv[2])
//! print(count_bots(dims))
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result type for connector invocations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Errors from running a connector command.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// The template could not be split into arguments.
    #[error("Invalid command template: {0}")]
    InvalidTemplate(String),

    /// The process could not be started.
    #[error("Failed to run connector: {0}")]
    SpawnFailed(String),

    /// The process did not finish in time.
    #[error("Connector timed out after {0}s")]
    Timeout(u64),
}

/// Captured output of a finished connector process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` if the process exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout with surrounding whitespace removed.
    pub fn trimmed_stdout(&self) -> &str {
        self.stdout.trim()
    }

    /// Last non-empty stderr line, for error messages.
    pub fn stderr_tail(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
    }
}

/// Runs a command template through the system process API.
#[derive(Debug, Clone)]
pub struct ShellConnector {
    /// The command template, e.g. `lab-cli status {job_id}`.
    command: String,
    /// Working directory for the command
    working_dir: Option<PathBuf>,
    /// Timeout in seconds
    timeout_secs: u64,
}

impl ShellConnector {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            timeout_secs: 3600,
        }
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// The raw template, for logging.
    pub fn template(&self) -> &str {
        &self.command
    }

    /// Splits the template and substitutes every `{name}` placeholder.
    pub fn command_parts(&self, substitutions: &[(&str, &str)]) -> ConnectorResult<Vec<String>> {
        let parts = shell_words::split(&self.command)
            .map_err(|e| ConnectorError::InvalidTemplate(format!("{}: {}", self.command, e)))?;

        if parts.is_empty() {
            return Err(ConnectorError::InvalidTemplate(
                "command template is empty".to_string(),
            ));
        }

        Ok(parts
            .into_iter()
            .map(|part| {
                substitutions
                    .iter()
                    .fold(part, |acc, (name, value)| {
                        acc.replace(&format!("{{{}}}", name), value)
                    })
            })
            .collect())
    }

    /// Runs the command and captures its output.
    ///
    /// A non-zero exit status is not an error here; callers decide what it
    /// means through [`CommandOutput::success`].
    pub async fn run(&self, substitutions: &[(&str, &str)]) -> ConnectorResult<CommandOutput> {
        let parts = self.command_parts(substitutions)?;

        debug!("Running connector: {:?}", parts);

        let mut cmd = tokio::process::Command::new(&parts[0]);
        cmd.args(&parts[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output())
            .await
            .map_err(|_| ConnectorError::Timeout(self.timeout_secs))?
            .map_err(|e| ConnectorError::SpawnFailed(format!("{}: {}", parts[0], e)))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_stay_single_arguments() {
        let connector = ShellConnector::new("lab-cli count --dims '{dimensions}' --pool {pool}");
        let parts = connector
            .command_parts(&[("dimensions", r#"{"a": ["b c"]}"#), ("pool", "quota")])
            .unwrap();

        assert_eq!(
            parts,
            vec!["lab-cli", "count", "--dims", r#"{"a": ["b c"]}"#, "--pool", "quota"]
        );
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        let connector = ShellConnector::new("lab-cli 'unterminated");
        assert!(matches!(
            connector.command_parts(&[]),
            Err(ConnectorError::InvalidTemplate(_))
        ));
        assert!(ShellConnector::new("  ").command_parts(&[]).is_err());
    }

    #[test]
    fn test_stderr_tail() {
        let output = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "warming up\nquota exceeded\n\n".to_string(),
        };
        assert_eq!(output.stderr_tail(), "quota exceeded");
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout() {
        let connector = ShellConnector::new("sh -c 'echo {word}'");
        let output = connector.run(&[("word", "ready")]).await.unwrap();

        assert!(output.success());
        assert_eq!(output.trimmed_stdout(), "ready");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out() {
        let connector = ShellConnector::new("sleep 5").with_timeout(0);
        let err = connector.run(&[]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout(0)));
    }
}
