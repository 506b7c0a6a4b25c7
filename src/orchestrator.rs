//! Run orchestration: from a test plan to per-attempt outcomes.
//!
//! # Execution Flow
//!
//! 1. **Resolution**: Flatten requirements and compute equivalence classes
//!    (against the inventory's device catalog when it has one)
//! 2. **Probing**: Query live device counts for every hardware signature
//! 3. **Distribution**: Place tests into device-bound shards
//! 4. **Dispatch**: Run every shard, retrying failed tests, until all
//!    attempts have reported or the run budget expires
//! 5. **Reporting**: Aggregate per-test results and notify reporters
//!
//! A run never fails as a whole. Problems with individual shards are
//! recorded on those shards, and a plan without any tests produces a single
//! `enumeration-error` entry.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dutsched::config::{ExecutionConfig, InventoryConfig, load_config};
//! use dutsched::execution::{CommandExecutionService, JsonMaterializer};
//! use dutsched::inventory::command::CommandInventory;
//! use dutsched::orchestrator::Orchestrator;
//! use dutsched::plan::load_plan;
//! use dutsched::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("dutsched.toml"))?;
//!     let plan = load_plan(std::path::Path::new("plan.json"))?;
//!
//!     let InventoryConfig::Command(inventory) = config.inventory.clone() else {
//!         anyhow::bail!("expected a command inventory");
//!     };
//!     let ExecutionConfig::Command(execution) = config.execution.clone();
//!
//!     let orchestrator = Orchestrator::new(
//!         config,
//!         CommandInventory::new(inventory),
//!         Arc::new(CommandExecutionService::new(execution)),
//!         Arc::new(JsonMaterializer::new(3600)),
//!         ConsoleReporter::new(false),
//!     );
//!     let result = orchestrator.run(&plan).await;
//!
//!     std::process::exit(result.exit_code());
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch::{
    AttemptOutcome, AttemptReport, DispatchSettings, Dispatcher, Verdict, initial_attempts,
};
use crate::distribution::{DistributionEngine, DistributionPlan};
use crate::error::ShardError;
use crate::execution::{ExecutionService, RequestMaterializer};
use crate::hardware::{EquivalenceResolver, EquivalenceTable};
use crate::inventory::{FleetInventory, LabAvailability, LabProber};
use crate::plan::TestPlan;
use crate::report::Reporter;

/// Attempt key of the single entry reported for a plan without tests.
pub const ENUMERATION_ERROR_KEY: &str = "enumeration-error";

/// Aggregated results of an entire run.
///
/// # Exit Codes
///
/// The [`exit_code`](Self::exit_code) method returns conventional exit codes:
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | All tests passed |
/// | 1 | Some tests failed, weren't run, or a shard errored |
/// | 2 | All tests passed but some were flaky |
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub suite: String,

    /// Distinct tests across all shards, placed or not.
    pub total_tests: usize,

    /// Tests whose last run ended with a non-retriable verdict.
    pub passed: usize,

    /// Tests whose last run ended with a retriable or unknown verdict.
    pub failed: usize,

    /// Passed tests that failed in an earlier attempt.
    pub flaky: usize,

    /// Tests without any result (unplaced, rejected, errored, cancelled).
    pub not_run: usize,

    /// Attempts that ended in a top-level error.
    pub errors: usize,

    /// Wall-clock duration of the run.
    pub duration: Duration,

    /// Every attempt, keyed by attempt key.
    pub attempts: BTreeMap<String, AttemptReport>,
}

/// Last known state of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestState {
    Passed { flaky: bool },
    Failed,
    NotRun,
}

impl RunResult {
    /// Aggregates attempt reports into per-test counts.
    ///
    /// A test's state is taken from the highest attempt that produced a
    /// verdict for it; a test without any verdict is not run.
    pub fn from_reports(
        suite: impl Into<String>,
        attempts: BTreeMap<String, AttemptReport>,
        duration: Duration,
    ) -> Self {
        // test -> (attempt, verdict of that attempt); `None` when the
        // attempt produced no verdict for the test.
        let mut runs: BTreeMap<&str, Vec<(u32, Option<Result<Verdict, ()>>)>> = BTreeMap::new();

        for report in attempts.values() {
            let verdicts: BTreeMap<&str, &str> = report
                .outcome
                .result()
                .map(|result| {
                    result
                        .cases
                        .iter()
                        .map(|case| (case.name.as_str(), case.verdict.as_str()))
                        .collect()
                })
                .unwrap_or_default();

            for test in &report.tests {
                let verdict = verdicts
                    .get(test.as_str())
                    .map(|raw| raw.parse::<Verdict>().map_err(|_| ()));
                runs.entry(test.as_str())
                    .or_default()
                    .push((report.attempt, verdict));
            }
        }

        let states: Vec<TestState> = runs
            .into_values()
            .map(|mut history| {
                history.sort_by_key(|(attempt, _)| *attempt);
                // Later attempts without a verdict (cancelled, errored) do
                // not override an earlier one.
                let verdicts: Vec<Result<Verdict, ()>> =
                    history.iter().filter_map(|(_, verdict)| *verdict).collect();
                let Some((last, earlier)) = verdicts.split_last() else {
                    return TestState::NotRun;
                };
                match last {
                    Ok(verdict) if !verdict.is_retriable() => TestState::Passed {
                        flaky: earlier
                            .iter()
                            .any(|verdict| matches!(verdict, Ok(v) if v.is_retriable())),
                    },
                    _ => TestState::Failed,
                }
            })
            .collect();

        let count = |wanted: fn(&TestState) -> bool| states.iter().filter(|s| wanted(s)).count();

        Self {
            suite: suite.into(),
            total_tests: states.len(),
            passed: count(|s| matches!(s, TestState::Passed { .. })),
            failed: count(|s| matches!(s, TestState::Failed)),
            flaky: count(|s| matches!(s, TestState::Passed { flaky: true })),
            not_run: count(|s| matches!(s, TestState::NotRun)),
            errors: attempts
                .values()
                .filter(|report| report.outcome.error().is_some())
                .count(),
            duration,
            attempts,
        }
    }

    /// Returns `true` if every test passed and no shard errored.
    ///
    /// Flaky tests count as passed.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.not_run == 0 && self.errors == 0
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if !self.success() {
            1
        } else if self.flaky > 0 {
            2
        } else {
            0
        }
    }

    /// Names of tests whose last run failed, sorted.
    pub fn failed_tests(&self) -> Vec<&str> {
        let mut latest: BTreeMap<&str, (u32, bool)> = BTreeMap::new();
        for report in self.attempts.values() {
            let Some(result) = report.outcome.result() else {
                continue;
            };
            for case in &result.cases {
                let failed = case
                    .verdict
                    .parse::<Verdict>()
                    .map_or(true, Verdict::is_retriable);
                let entry = latest.entry(case.name.as_str()).or_insert((report.attempt, failed));
                if report.attempt >= entry.0 {
                    *entry = (report.attempt, failed);
                }
            }
        }
        latest
            .into_iter()
            .filter(|(_, (_, failed))| *failed)
            .map(|(name, _)| name)
            .collect()
    }
}

/// Resolution, availability, and placement of one plan.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub table: EquivalenceTable,
    pub lab: LabAvailability,
    pub distribution: DistributionPlan,
}

/// Serializable overview of a [`PlannedRun`], for `dutsched plan`.
#[derive(Debug, Serialize)]
pub struct PlanSummary<'a> {
    pub suite: &'a str,
    pub requirements: usize,
    pub configurations: usize,
    pub signatures: BTreeMap<String, &'a crate::inventory::DeviceInfo>,
    pub distribution: &'a DistributionPlan,
}

impl PlannedRun {
    pub fn summary<'a>(&'a self, suite: &'a str) -> PlanSummary<'a> {
        PlanSummary {
            suite,
            requirements: self.table.hw_to_tests().len(),
            configurations: self.table.configs().len(),
            signatures: self
                .lab
                .signatures()
                .map(|(key, info)| (key.to_string(), info))
                .collect(),
            distribution: &self.distribution,
        }
    }
}

/// Ties inventory, distribution, dispatch, and reporting together.
///
/// # Type Parameters
///
/// - `I`: The fleet inventory type
/// - `E`: The execution service type
/// - `M`: The request materializer type
/// - `R`: The reporter type
pub struct Orchestrator<I, E: ?Sized, M: ?Sized, R> {
    config: Config,
    inventory: I,
    service: Arc<E>,
    materializer: Arc<M>,
    reporter: R,
}

impl<I, E, M, R> Orchestrator<I, E, M, R>
where
    I: FleetInventory,
    E: ExecutionService + ?Sized + 'static,
    M: RequestMaterializer + ?Sized + 'static,
    R: Reporter,
{
    pub fn new(config: Config, inventory: I, service: Arc<E>, materializer: Arc<M>, reporter: R) -> Self {
        Self {
            config,
            inventory,
            service,
            materializer,
            reporter,
        }
    }

    /// Resolves, probes, and distributes a plan without dispatching it.
    pub async fn plan(&self, plan: &TestPlan) -> PlannedRun {
        let resolver = match self.inventory.catalog() {
            Some(catalog) => {
                info!("Using {} catalog devices from {}", catalog.len(), self.inventory.name());
                EquivalenceResolver::with_catalog(catalog)
            }
            None => EquivalenceResolver::new(),
        };
        let table = resolver.resolve(&plan.tests);
        info!(
            "Resolved {} tests into {} hardware requirements",
            plan.tests.len(),
            table.hw_to_tests().len()
        );

        let mut lab = LabProber::new(&self.inventory, self.config.suite.pool.clone())
            .probe(&table)
            .await;

        let distribution =
            DistributionEngine::new(self.config.suite.max_in_shard).distribute(&table, &mut lab);

        PlannedRun {
            table,
            lab,
            distribution,
        }
    }

    /// Runs a plan with the configured run budget.
    pub async fn run(&self, plan: &TestPlan) -> RunResult {
        self.run_with_cancel(plan, CancellationToken::new()).await
    }

    /// Runs a plan, stopping early when `cancel` fires or the run budget
    /// expires.
    pub async fn run_with_cancel(&self, plan: &TestPlan, cancel: CancellationToken) -> RunResult {
        let start = Instant::now();
        let mut reports = BTreeMap::new();

        if plan.tests.is_empty() {
            warn!("Suite {:?} has no tests", plan.suite);
            let report = AttemptReport::unplaced(
                ENUMERATION_ERROR_KEY,
                "",
                Vec::new(),
                ShardError::Enumeration {
                    suite: plan.suite.clone(),
                },
            );
            self.reporter.on_attempt_complete(&report).await;
            reports.insert(report.key.clone(), report);
            return self.finish(plan, reports, start).await;
        }

        let planned = self.plan(plan).await;
        self.reporter.on_plan_complete(&planned.distribution).await;

        for unmatched in &planned.distribution.unmatched {
            let report = AttemptReport::unplaced(
                unmatched.key.clone(),
                &unmatched.harness,
                unmatched.tests.clone(),
                unmatched.error(),
            );
            self.reporter.on_attempt_complete(&report).await;
            reports.insert(report.key.clone(), report);
        }

        let attempts = initial_attempts(
            &planned.distribution,
            &planned.table,
            &planned.lab,
            &plan.suite,
            &self.config.suite.pool,
        );

        let budget = Duration::from_secs(self.config.scheduler.timeout_secs);
        let deadline = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                warn!("Run budget of {:?} exhausted, cancelling remaining attempts", budget);
                cancel.cancel();
            })
        };

        let dispatcher = Dispatcher::new(
            self.service.clone(),
            self.materializer.clone(),
            DispatchSettings::from_config(&self.config),
        );
        let dispatched = dispatcher.dispatch(attempts, cancel, &self.reporter).await;
        deadline.abort();

        reports.extend(dispatched);
        self.finish(plan, reports, start).await
    }

    async fn finish(
        &self,
        plan: &TestPlan,
        reports: BTreeMap<String, AttemptReport>,
        start: Instant,
    ) -> RunResult {
        let result = RunResult::from_reports(plan.suite.clone(), reports, start.elapsed());

        let cancelled = result
            .attempts
            .values()
            .filter(|report| report.outcome == AttemptOutcome::Cancelled)
            .count();
        info!(
            "Run complete: {} passed, {} failed, {} flaky, {} not run, {} errors, {} cancelled",
            result.passed, result.failed, result.flaky, result.not_run, result.errors, cancelled
        );

        self.reporter.on_run_complete(&result).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{DeclaredDevice, DeclaredInventoryConfig, load_config_str};
    use crate::dispatch::AttemptReport;
    use crate::execution::{
        CaseResult, ExecutionRequest, ExecutionResult, JobId, JobStatus, JsonMaterializer,
        TestRunResult, encode_test_result,
    };
    use crate::hardware::{AtomicHardwareConfig, HardwareRequirement};
    use crate::inventory::declared::DeclaredInventory;
    use crate::plan::TestCase;
    use crate::report::NullReporter;

    /// Runs everything; `tast.flaky` fails on its first attempt only.
    #[derive(Default)]
    struct LabService {
        requests: Mutex<Vec<ExecutionRequest>>,
    }

    #[async_trait]
    impl ExecutionService for LabService {
        async fn schedule(&self, request: &ExecutionRequest) -> ExecutionResult<JobId> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            Ok(JobId::new((requests.len() - 1).to_string()))
        }

        async fn status(&self, _job: &JobId) -> ExecutionResult<JobStatus> {
            Ok(JobStatus::Completed)
        }

        async fn fetch_output(&self, job: &JobId) -> ExecutionResult<Vec<u8>> {
            let index: usize = job.as_str().parse().unwrap_or_default();
            let request = self.requests.lock().unwrap()[index].clone();
            let cases = request
                .tests
                .iter()
                .map(|name| {
                    let verdict = if name == "tast.flaky" && request.attempt == 0 {
                        "FAIL"
                    } else {
                        "PASS"
                    };
                    CaseResult::new(name.clone(), verdict)
                })
                .collect();
            Ok(encode_test_result(&TestRunResult { cases })?)
        }

        fn name(&self) -> &'static str {
            "lab"
        }
    }

    fn config() -> Config {
        load_config_str(
            r#"
            [suite]
            pool = "quota"
            max_in_shard = 2

            [scheduler]
            poll_interval_secs = 0

            [inventory]
            type = "declared"

            [execution]
            type = "command"
            schedule_command = "unused"
            status_command = "unused"
            fetch_command = "unused"
            "#,
        )
        .unwrap()
    }

    fn device(board: &str, ready: u32) -> DeclaredDevice {
        DeclaredDevice {
            board: board.to_string(),
            model: None,
            labels: Default::default(),
            companions: Vec::new(),
            pool: "quota".to_string(),
            ready,
            total: None,
        }
    }

    fn orchestrator(
        devices: Vec<DeclaredDevice>,
        catalog: bool,
    ) -> (
        Orchestrator<DeclaredInventory, LabService, JsonMaterializer, NullReporter>,
        Arc<LabService>,
    ) {
        let service = Arc::new(LabService::default());
        let orchestrator = Orchestrator::new(
            config(),
            DeclaredInventory::new(DeclaredInventoryConfig { devices, catalog }),
            service.clone(),
            Arc::new(JsonMaterializer::new(60)),
            NullReporter,
        );
        (orchestrator, service)
    }

    fn on(name: &str, board: &str) -> TestCase {
        TestCase::new(name, HardwareRequirement::from(&AtomicHardwareConfig::new(board)))
    }

    #[tokio::test]
    async fn test_two_signatures_end_to_end() {
        let (orchestrator, service) =
            orchestrator(vec![device("octopus", 1), device("eve", 1)], false);
        let plan = TestPlan {
            suite: "bvt".to_string(),
            tests: vec![on("tast.a", "octopus"), on("tast.b", "octopus"), on("tast.c", "eve")],
        };

        let planned = orchestrator.plan(&plan).await;
        assert_eq!(planned.distribution.shard_count(), 2);
        let octopus = AtomicHardwareConfig::new("octopus").key();
        let eve = AtomicHardwareConfig::new("eve").key();
        assert_eq!(planned.distribution.assignment.shards_for(&octopus)[0].tests.len(), 2);
        assert_eq!(planned.lab.remaining(&octopus), 0);
        assert_eq!(planned.lab.remaining(&eve), 0);

        let result = orchestrator.run(&plan).await;
        assert!(result.success());
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.passed, 3);
        assert_eq!(service.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unmatched_board_does_not_block_others() {
        let (orchestrator, _service) = orchestrator(vec![device("eve", 2)], true);
        let plan = TestPlan {
            suite: "bvt".to_string(),
            tests: vec![on("tast.a", "eve"), on("tast.b", "grunt")],
        };

        let result = orchestrator.run(&plan).await;

        let grunt = AtomicHardwareConfig::new("grunt").key();
        let unmatched = &result.attempts[&format!("{}-unmatched-0", grunt)];
        assert_eq!(
            unmatched.outcome.error(),
            Some(&ShardError::NoHardwareMatch { requirement: grunt })
        );
        assert_eq!(result.passed, 1);
        assert_eq!(result.not_run, 1);
        assert_eq!(result.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_flaky_test_exit_code() {
        let (orchestrator, _service) = orchestrator(vec![device("eve", 1)], false);
        let plan = TestPlan {
            suite: "bvt".to_string(),
            tests: vec![on("tast.flaky", "eve"), on("tast.ok", "eve")],
        };

        let result = orchestrator.run(&plan).await;

        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.flaky, 1);
        assert_eq!(result.passed, 2);
        assert!(result.success());
        assert_eq!(result.exit_code(), 2);
        assert!(result.failed_tests().is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_reports_enumeration_error() {
        let (orchestrator, service) = orchestrator(vec![device("eve", 1)], false);
        let plan = TestPlan {
            suite: "bvt".to_string(),
            tests: Vec::new(),
        };

        let result = orchestrator.run(&plan).await;

        assert_eq!(result.attempts.len(), 1);
        assert_eq!(
            result.attempts[ENUMERATION_ERROR_KEY].outcome.error(),
            Some(&ShardError::Enumeration {
                suite: "bvt".to_string()
            })
        );
        assert_eq!(result.exit_code(), 1);
        assert!(service.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_absent_fleet_is_rejected() {
        let (orchestrator, service) = orchestrator(vec![device("eve", 1)], false);
        let plan = TestPlan {
            suite: "bvt".to_string(),
            tests: vec![on("tast.a", "nami")],
        };

        let result = orchestrator.run(&plan).await;

        let report = result.attempts.values().next().unwrap();
        assert!(matches!(
            report.outcome.error(),
            Some(ShardError::BotParamsRejected { .. })
        ));
        assert!(service.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_tests_use_latest_attempt() {
        let outcome = |verdict: &str| AttemptOutcome::Failed {
            result: TestRunResult {
                cases: vec![CaseResult::new("tast.a", verdict)],
            },
        };
        let mut first = AttemptReport::unplaced("s", "tast", vec!["tast.a".to_string()], ShardError::EmptyShard);
        first.outcome = outcome("FAIL");
        let mut second = first.clone();
        second.key = "s-retry-1".to_string();
        second.attempt = 1;
        second.outcome = outcome("ERROR");

        let attempts = BTreeMap::from([(first.key.clone(), first), (second.key.clone(), second)]);
        let result = RunResult::from_reports("bvt", attempts, Duration::ZERO);

        assert_eq!(result.failed, 1);
        assert_eq!(result.failed_tests(), vec!["tast.a"]);
    }

    #[test]
    fn test_cancelled_retry_keeps_earlier_verdict() {
        let mut first = AttemptReport::unplaced("s", "tast", vec!["tast.a".to_string()], ShardError::EmptyShard);
        first.outcome = AttemptOutcome::Failed {
            result: TestRunResult {
                cases: vec![CaseResult::new("tast.a", "FAIL")],
            },
        };
        let mut second = first.clone();
        second.key = "s-retry-1".to_string();
        second.attempt = 1;
        second.outcome = AttemptOutcome::Cancelled;

        let attempts = BTreeMap::from([(first.key.clone(), first), (second.key.clone(), second)]);
        let result = RunResult::from_reports("bvt", attempts, Duration::ZERO);

        assert_eq!(result.failed, 1);
        assert_eq!(result.not_run, 0);
        assert_eq!(result.failed_tests(), vec!["tast.a"]);
    }

    #[tokio::test]
    async fn test_requirement_less_tests_fail_the_run() {
        let (orchestrator, service) = orchestrator(vec![device("eve", 1)], false);
        let plan = TestPlan {
            suite: "bvt".to_string(),
            tests: vec![TestCase {
                name: "tast.a".to_string(),
                requirements: Vec::new(),
            }],
        };

        let result = orchestrator.run(&plan).await;

        assert_eq!(result.total_tests, 1);
        assert_eq!(result.not_run, 1);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.attempts.len(), 1);
        let report = result.attempts.values().next().unwrap();
        assert_eq!(report.tests, vec!["tast.a"]);
        assert!(matches!(
            report.outcome.error(),
            Some(ShardError::NoHardwareMatch { .. })
        ));
        assert!(service.requests.lock().unwrap().is_empty());
    }
}
