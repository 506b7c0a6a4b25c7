//! Execution service driven by external commands.
//!
//! Each service call runs one command template:
//!
//! | Call | Template | Placeholders | Stdout |
//! |------|----------|--------------|--------|
//! | schedule | `schedule_command` | `{request_file}`, `{key}` | job id (last line) |
//! | status | `status_command` | `{job_id}` | status word or JSON |
//! | fetch | `fetch_command` | `{job_id}`, `{output_file}` | ignored |
//!
//! The request is written as JSON to a temporary file. The fetch command
//! must write the job's result to `{output_file}`.
//!
//! # Example
//!
//! ```toml
//! [execution]
//! type = "command"
//! schedule_command = "lab-cli schedule --request {request_file}"
//! status_command = "lab-cli status {job_id}"
//! fetch_command = "lab-cli fetch {job_id} --out {output_file}"
//! working_dir = "/opt/lab"
//! timeout_secs = 120
//! ```

use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionError, ExecutionRequest, ExecutionResult, ExecutionService, JobId, JobStatus};
use crate::config::CommandExecutionConfig;
use crate::connector::{CommandOutput, ShellConnector};

/// Execution service backed by three shell commands.
pub struct CommandExecutionService {
    schedule: ShellConnector,
    status: ShellConnector,
    fetch: ShellConnector,
}

impl CommandExecutionService {
    pub fn new(config: CommandExecutionConfig) -> Self {
        let connector = |template: String| {
            ShellConnector::new(template)
                .with_working_dir(config.working_dir.clone())
                .with_timeout(config.timeout_secs)
        };

        Self {
            schedule: connector(config.schedule_command.clone()),
            status: connector(config.status_command.clone()),
            fetch: connector(config.fetch_command.clone()),
        }
    }
}

fn require_success(call: &str, output: &CommandOutput) -> ExecutionResult<()> {
    if output.success() {
        return Ok(());
    }
    Err(ExecutionError::CallFailed(format!(
        "{} exited with {}: {}",
        call,
        output.exit_code,
        output.stderr_tail()
    )))
}

/// Parses status command output: a bare word, or a JSON object with a
/// `status` field and optional `reason`.
fn parse_status(stdout: &str) -> ExecutionResult<JobStatus> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed)
            .map_err(|e| ExecutionError::InvalidResponse(format!("status JSON: {}", e)));
    }

    let word = trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| ExecutionError::InvalidResponse("empty status output".to_string()))?;
    word.parse()
}

#[async_trait]
impl ExecutionService for CommandExecutionService {
    async fn schedule(&self, request: &ExecutionRequest) -> ExecutionResult<JobId> {
        let file = tempfile::Builder::new()
            .prefix("dutsched-request-")
            .suffix(".json")
            .tempfile()?;
        let json = serde_json::to_vec_pretty(request)
            .map_err(|e| ExecutionError::CallFailed(format!("Failed to encode request: {}", e)))?;
        tokio::fs::write(file.path(), json).await?;

        let path = file.path().to_string_lossy().to_string();
        let output = self
            .schedule
            .run(&[("request_file", &path), ("key", &request.key)])
            .await?;
        require_success("schedule", &output)?;

        let id = output
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| ExecutionError::InvalidResponse("schedule printed no job id".to_string()))?;

        debug!("Scheduled {} as job {}", request.key, id);
        Ok(JobId::new(id))
    }

    async fn status(&self, job: &JobId) -> ExecutionResult<JobStatus> {
        let output = self.status.run(&[("job_id", job.as_str())]).await?;
        require_success("status", &output)?;
        parse_status(&output.stdout)
    }

    async fn fetch_output(&self, job: &JobId) -> ExecutionResult<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let output_file = dir.path().join("result.json.gz");
        let path = output_file.to_string_lossy().to_string();

        let output = self
            .fetch
            .run(&[("job_id", job.as_str()), ("output_file", &path)])
            .await?;
        require_success("fetch", &output)?;

        tokio::fs::read(&output_file).await.map_err(|e| {
            ExecutionError::InvalidResponse(format!("fetch wrote no output file: {}", e))
        })
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_forms() {
        assert_eq!(parse_status("running\n").unwrap(), JobStatus::Running);
        assert_eq!(
            parse_status("connecting\nCOMPLETED\n").unwrap(),
            JobStatus::Completed
        );
        assert_eq!(
            parse_status(r#"{"status": "failed", "reason": "no dut"}"#).unwrap(),
            JobStatus::Failed {
                reason: "no dut".to_string()
            }
        );
        assert!(parse_status("").is_err());
        assert!(parse_status(r#"{"state": 1}"#).is_err());
    }

    #[cfg(unix)]
    mod shell {
        use super::*;
        use crate::execution::{TestRunResult, decode_test_result};
        use crate::hardware::AtomicHardwareConfig;
        use crate::inventory::Dimensions;

        fn request() -> ExecutionRequest {
            ExecutionRequest {
                key: "abc-shard-0".to_string(),
                attempt: 0,
                suite: "bvt".to_string(),
                pool: "quota".to_string(),
                harness: "tast".to_string(),
                tests: vec!["tast.a".to_string()],
                hardware: AtomicHardwareConfig::new("eve"),
                dimensions: Dimensions::new(),
                timeout_secs: 60,
                created_at: chrono::Utc::now(),
                tags: Default::default(),
            }
        }

        fn service(schedule: &str, status: &str, fetch: &str) -> CommandExecutionService {
            CommandExecutionService::new(CommandExecutionConfig {
                schedule_command: schedule.to_string(),
                status_command: status.to_string(),
                fetch_command: fetch.to_string(),
                working_dir: None,
                timeout_secs: 10,
                request_timeout_secs: 60,
            })
        }

        #[tokio::test]
        async fn test_round_trip_through_commands() {
            // Schedule echoes the request's key back as the job id, fetch
            // copies a canned result into place.
            let dir = tempfile::tempdir().unwrap();
            let canned = dir.path().join("canned.json");
            std::fs::write(&canned, r#"{"cases":[{"name":"tast.a","verdict":"PASS"}]}"#).unwrap();

            let service = service(
                r#"sh -c 'grep -q abc-shard-0 "$1" && echo job-{key}' schedule {request_file}"#,
                "echo completed",
                &format!("cp {} {{output_file}}", canned.display()),
            );

            let job = service.schedule(&request()).await.unwrap();
            assert_eq!(job.as_str(), "job-abc-shard-0");
            assert_eq!(service.status(&job).await.unwrap(), JobStatus::Completed);

            let bytes = service.fetch_output(&job).await.unwrap();
            let result: TestRunResult = decode_test_result(&bytes).unwrap();
            assert_eq!(result.cases[0].verdict, "PASS");
        }

        #[tokio::test]
        async fn test_failing_schedule_reports_stderr() {
            let service = service("sh -c 'echo no quota >&2; exit 1'", "true", "true");
            let err = service.schedule(&request()).await.unwrap_err();

            assert!(matches!(err, ExecutionError::CallFailed(_)));
            assert!(err.to_string().contains("no quota"));
        }

        #[tokio::test]
        async fn test_fetch_without_output_file() {
            let service = service("echo job", "echo running", "true");
            let err = service.fetch_output(&JobId::new("job")).await.unwrap_err();
            assert!(matches!(err, ExecutionError::InvalidResponse(_)));
        }
    }
}
