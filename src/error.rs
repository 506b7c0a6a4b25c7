//! Per-shard error taxonomy.
//!
//! A [`ShardError`] never aborts a run: it is attached to the attempt it
//! belongs to and reported next to the successful attempts.

use serde::Serialize;

use crate::hardware::HardwareKey;
use crate::inventory::Dimensions;

/// Why a shard produced no test results.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardError {
    /// No device configuration can serve a hardware requirement.
    #[error("No device matches hardware requirement {requirement}")]
    NoHardwareMatch { requirement: HardwareKey },

    /// The chosen device has no units in the fleet at all.
    #[error("No bots in the fleet match {dimensions}")]
    BotParamsRejected { dimensions: Dimensions },

    /// Upstream produced no tests for the suite.
    #[error("Suite {suite:?} has no tests to schedule")]
    Enumeration { suite: String },

    #[error("Shard has no test cases")]
    EmptyShard,

    /// The execution request could not be built.
    #[error("Failed to materialize request: {message}")]
    Materialize { message: String },

    #[error("{error}")]
    Dispatch {
        #[from]
        error: DispatchError,
    },

    /// A result carried a verdict outside the known set.
    #[error("Test {test} reported unknown verdict {verdict:?}")]
    InvalidVerdict { test: String, verdict: String },
}

/// Failures talking to the execution service, by stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "stage", content = "message", rename_all = "snake_case")]
pub enum DispatchError {
    #[error("Failed to schedule request: {0}")]
    Schedule(String),

    #[error("Failed to poll job status: {0}")]
    Status(String),

    #[error("Failed to fetch job output: {0}")]
    Fetch(String),

    #[error("Failed to decode job output: {0}")]
    Decode(String),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Job was cancelled by the execution service")]
    JobCancelled,

    /// The attempt task itself failed (panicked or was aborted).
    #[error("Internal dispatch failure: {0}")]
    Internal(String),
}
