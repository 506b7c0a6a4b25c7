//! Execution service abstraction: where shards actually run.
//!
//! dutsched does not run tests itself. Every shard is turned into an
//! [`ExecutionRequest`] by a [`RequestMaterializer`] and handed to an
//! [`ExecutionService`], which schedules it on a remote fleet and reports
//! back through polling.
//!
//! # Architecture
//!
//! ```text
//!  Shard ──► RequestMaterializer ──► ExecutionRequest
//!                                          │
//!                                          ▼
//!                    ┌──────────────────────────────────────┐
//!                    │           ExecutionService            │
//!                    │                                       │
//!                    │  schedule(request) ──────► JobId      │
//!                    │  status(job)       ──────► JobStatus  │
//!                    │  fetch_output(job) ──────► bytes      │
//!                    └──────────────────────────────────────┘
//!                                          │
//!                                          ▼
//!                          decode_test_result ──► TestRunResult
//! ```
//!
//! # Built-in Services
//!
//! | Service | Module | Description |
//! |---------|--------|-------------|
//! | Command | [`command`] | Schedule, poll, and fetch through shell commands |

pub mod command;
pub mod materializer;
pub mod result;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connector::ConnectorError;
use crate::hardware::AtomicHardwareConfig;
use crate::inventory::Dimensions;

pub use command::CommandExecutionService;
pub use materializer::{JsonMaterializer, MaterializeError, MaterializeInput, RequestMaterializer};
pub use result::{CaseResult, DecodeError, TestRunResult, decode_test_result, encode_test_result};

/// Result type for execution service operations.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Errors returned by an [`ExecutionService`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The service could not be reached or refused the call.
    #[error("Execution service call failed: {0}")]
    CallFailed(String),

    /// The service answered with something unparseable.
    #[error("Invalid execution service response: {0}")]
    InvalidResponse(String),

    /// The call did not finish in time.
    #[error("Execution service call timed out: {0}")]
    Timeout(String),

    /// I/O error preparing or collecting a call.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConnectorError> for ExecutionError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Timeout(secs) => ExecutionError::Timeout(format!("after {}s", secs)),
            other => ExecutionError::CallFailed(other.to_string()),
        }
    }
}

/// Identifier of a scheduled job, as assigned by the execution service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a device.
    Pending,
    Running,
    /// Finished; output can be fetched.
    Completed,
    /// The job failed outside the tests (infrastructure, provisioning).
    Failed {
        #[serde(default)]
        reason: String,
    },
    /// The service cancelled the job.
    Cancelled,
}

impl JobStatus {
    /// Returns `true` once the job will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed { .. } | JobStatus::Cancelled
        )
    }
}

impl FromStr for JobStatus {
    type Err = ExecutionError;

    /// Parses a bare status word, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "scheduled" | "queued" => Ok(JobStatus::Pending),
            "running" | "started" => Ok(JobStatus::Running),
            "completed" | "succeeded" | "success" => Ok(JobStatus::Completed),
            "failed" | "failure" | "infra_failure" => Ok(JobStatus::Failed {
                reason: String::new(),
            }),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(ExecutionError::InvalidResponse(format!(
                "unknown job status {:?}",
                other
            ))),
        }
    }
}

/// A fully materialized request for one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Attempt key, e.g. `<hw>-shard-0-retry-1`.
    pub key: String,

    pub attempt: u32,

    pub suite: String,

    pub pool: String,

    pub harness: String,

    /// Tests to run, in order.
    pub tests: Vec<String>,

    /// Device configuration the request targets.
    pub hardware: AtomicHardwareConfig,

    /// Scheduling dimensions for the target devices.
    pub dimensions: Dimensions,

    pub timeout_secs: u64,

    pub created_at: DateTime<Utc>,

    /// Free-form tags attached for bookkeeping on the service side.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// A remote service that runs execution requests.
///
/// # Thread Safety
///
/// Services must be `Send + Sync`; many attempts share one instance and
/// call it concurrently.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Submits a request, returning the service's job id.
    async fn schedule(&self, request: &ExecutionRequest) -> ExecutionResult<JobId>;

    /// Current state of a job.
    async fn status(&self, job: &JobId) -> ExecutionResult<JobStatus>;

    /// Raw (usually gzip-compressed) output of a completed job.
    async fn fetch_output(&self, job: &JobId) -> ExecutionResult<Vec<u8>>;

    /// Service name, for logging.
    fn name(&self) -> &'static str;
}
