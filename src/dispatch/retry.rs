//! Verdict classification and retry selection.

use std::str::FromStr;

use crate::error::ShardError;
use crate::execution::TestRunResult;

/// Verdict of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Error,
    Abort,
    NoVerdict,
}

impl Verdict {
    /// Returns `true` if a test with this verdict should run again.
    pub fn is_retriable(self) -> bool {
        matches!(self, Verdict::Fail | Verdict::Error | Verdict::Abort)
    }
}

/// A verdict string outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown verdict {0:?}")]
pub struct UnknownVerdict(pub String);

impl FromStr for Verdict {
    type Err = UnknownVerdict;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PASS" => Ok(Verdict::Pass),
            "FAIL" => Ok(Verdict::Fail),
            "ERROR" => Ok(Verdict::Error),
            "ABORT" => Ok(Verdict::Abort),
            "NO_VERDICT" => Ok(Verdict::NoVerdict),
            _ => Err(UnknownVerdict(s.to_string())),
        }
    }
}

/// Names of the tests in `result` that should be retried, in result order.
///
/// Fails on the first case whose verdict is not recognized.
pub fn retriable_tests(result: &TestRunResult) -> Result<Vec<String>, ShardError> {
    let mut retriable = Vec::new();
    for case in &result.cases {
        let verdict: Verdict = case.verdict.parse().map_err(|_| ShardError::InvalidVerdict {
            test: case.name.clone(),
            verdict: case.verdict.clone(),
        })?;
        if verdict.is_retriable() && !retriable.contains(&case.name) {
            retriable.push(case.name.clone());
        }
    }
    Ok(retriable)
}

/// Key of retry attempt `attempt` of a shard.
pub fn retry_key(shard_key: &str, attempt: u32) -> String {
    format!("{}-retry-{}", shard_key, attempt)
}
