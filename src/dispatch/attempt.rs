//! Dispatch attempts: what runs, and how it ended.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::retry::retry_key;
use crate::distribution::DistributionPlan;
use crate::error::ShardError;
use crate::execution::{MaterializeInput, TestRunResult};
use crate::hardware::{AtomicHardwareConfig, EquivalenceTable, HardwareKey};
use crate::inventory::{DeviceInfo, LabAvailability};

/// One execution of a shard's tests on its device.
///
/// Attempt 0 runs the whole shard. Attempt `n + 1` runs only the retriable
/// tests of attempt `n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSpec {
    /// Attempt key: the shard key, or `{shard}-retry-{n}`.
    pub key: String,

    /// Key of the shard this attempt descends from.
    pub shard_key: String,

    pub attempt: u32,

    pub suite: String,

    pub pool: String,

    pub harness: String,

    pub hardware: HardwareKey,

    pub config: AtomicHardwareConfig,

    /// Probed device information; `None` when the device was never probed.
    pub device: Option<DeviceInfo>,

    pub tests: Vec<String>,
}

impl AttemptSpec {
    /// The next attempt of this lineage, running `tests`.
    pub fn retry(&self, tests: Vec<String>) -> Self {
        let attempt = self.attempt + 1;
        Self {
            key: retry_key(&self.shard_key, attempt),
            shard_key: self.shard_key.clone(),
            attempt,
            suite: self.suite.clone(),
            pool: self.pool.clone(),
            harness: self.harness.clone(),
            hardware: self.hardware.clone(),
            config: self.config.clone(),
            device: self.device.clone(),
            tests,
        }
    }

    /// Fleet size of the target device; zero when unknown.
    pub fn fleet_size(&self) -> u32 {
        self.device.as_ref().map_or(0, |device| device.total)
    }

    pub fn materialize_input(&self) -> MaterializeInput<'_> {
        MaterializeInput {
            key: &self.key,
            attempt: self.attempt,
            suite: &self.suite,
            pool: &self.pool,
            harness: &self.harness,
            tests: &self.tests,
            hardware: &self.config,
            device: self.device.as_ref(),
        }
    }
}

/// Builds attempt 0 for every device-bound shard of a plan.
pub fn initial_attempts(
    plan: &DistributionPlan,
    table: &EquivalenceTable,
    lab: &LabAvailability,
    suite: &str,
    pool: &str,
) -> Vec<AttemptSpec> {
    plan.assignment
        .shards()
        .map(|shard| AttemptSpec {
            key: shard.key.clone(),
            shard_key: shard.key.clone(),
            attempt: 0,
            suite: suite.to_string(),
            pool: pool.to_string(),
            harness: shard.harness.clone(),
            hardware: shard.hardware.clone(),
            config: table.config(&shard.hardware).cloned().unwrap_or_default(),
            device: lab.device_for(&shard.hardware).cloned(),
            tests: shard.tests.clone(),
        })
        .collect()
}

/// Lifecycle of an attempt, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Materializing,
    Dispatched,
    Monitoring,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::Pending => "pending",
            AttemptState::Materializing => "materializing",
            AttemptState::Dispatched => "dispatched",
            AttemptState::Monitoring => "monitoring",
        };
        f.write_str(name)
    }
}

/// Terminal state of an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Every test finished with a non-retriable verdict.
    Succeeded { result: TestRunResult },

    /// At least one test failed, or a verdict was unknown.
    Failed { result: TestRunResult },

    /// No test results were produced.
    TopLevelError { error: ShardError },

    /// The run was cancelled before the attempt finished.
    Cancelled,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded { .. })
    }

    pub fn error(&self) -> Option<&ShardError> {
        match self {
            AttemptOutcome::TopLevelError { error } => Some(error),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&TestRunResult> {
        match self {
            AttemptOutcome::Succeeded { result } | AttemptOutcome::Failed { result } => Some(result),
            _ => None,
        }
    }

    /// Short label for summaries.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded { .. } => "succeeded",
            AttemptOutcome::Failed { .. } => "failed",
            AttemptOutcome::TopLevelError { .. } => "error",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

/// Final record of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptReport {
    pub key: String,

    pub shard_key: String,

    pub attempt: u32,

    /// Device the attempt targeted; `None` for tests never placed.
    pub hardware: Option<HardwareKey>,

    pub harness: String,

    pub tests: Vec<String>,

    /// Job id assigned by the execution service, once scheduled.
    pub job_id: Option<String>,

    #[serde(flatten)]
    pub outcome: AttemptOutcome,

    pub finished_at: DateTime<Utc>,
}

impl AttemptReport {
    /// Report for an attempt that ran (or tried to run) `spec`.
    pub fn for_spec(spec: &AttemptSpec, job_id: Option<String>, outcome: AttemptOutcome) -> Self {
        Self {
            key: spec.key.clone(),
            shard_key: spec.shard_key.clone(),
            attempt: spec.attempt,
            hardware: Some(spec.hardware.clone()),
            harness: spec.harness.clone(),
            tests: spec.tests.clone(),
            job_id,
            outcome,
            finished_at: Utc::now(),
        }
    }

    /// Report for tests that never reached a device.
    pub fn unplaced(key: impl Into<String>, harness: &str, tests: Vec<String>, error: ShardError) -> Self {
        let key = key.into();
        Self {
            shard_key: key.clone(),
            key,
            attempt: 0,
            hardware: None,
            harness: harness.to_string(),
            tests,
            job_id: None,
            outcome: AttemptOutcome::TopLevelError { error },
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::DistributionEngine;
    use crate::hardware::{EquivalenceResolver, HardwareRequirement};
    use crate::plan::TestCase;

    fn spec() -> AttemptSpec {
        AttemptSpec {
            key: "hw-shard-0".to_string(),
            shard_key: "hw-shard-0".to_string(),
            attempt: 0,
            suite: "bvt".to_string(),
            pool: "quota".to_string(),
            harness: "tast".to_string(),
            hardware: HardwareKey::from("hw"),
            config: AtomicHardwareConfig::new("eve"),
            device: None,
            tests: vec!["tast.a".to_string(), "tast.b".to_string()],
        }
    }

    #[test]
    fn test_retry_lineage_keys() {
        let first = spec().retry(vec!["tast.b".to_string()]);
        assert_eq!(first.key, "hw-shard-0-retry-1");
        assert_eq!(first.attempt, 1);
        assert_eq!(first.tests, vec!["tast.b"]);

        let second = first.retry(vec!["tast.b".to_string()]);
        assert_eq!(second.key, "hw-shard-0-retry-2");
        assert_eq!(second.shard_key, "hw-shard-0");
    }

    #[test]
    fn test_initial_attempts_carry_device_info() {
        let eve = AtomicHardwareConfig::new("eve");
        let tests = vec![TestCase::new("tast.a", HardwareRequirement::from(&eve))];
        let table = EquivalenceResolver::new().resolve(&tests);
        let mut lab = LabAvailability::new();
        lab.insert_signature(
            eve.signature(),
            DeviceInfo {
                ready: 2,
                total: 3,
                ..Default::default()
            },
        );
        lab.bind(eve.key(), eve.signature());
        let plan = DistributionEngine::new(10).distribute(&table, &mut lab);

        let attempts = initial_attempts(&plan, &table, &lab, "bvt", "quota");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].key, format!("{}-shard-0", eve.key()));
        assert_eq!(attempts[0].config, eve);
        assert_eq!(attempts[0].fleet_size(), 3);
    }

    #[test]
    fn test_report_serializes_flat_outcome() {
        let report = AttemptReport::for_spec(&spec(), Some("job-1".to_string()), AttemptOutcome::Cancelled);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["outcome"], "cancelled");
        assert_eq!(json["job_id"], "job-1");
        assert!(!report.outcome.is_success());
    }
}
