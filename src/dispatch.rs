//! Concurrent dispatch, monitoring, and retry of shard attempts.
//!
//! # Architecture
//!
//! ```text
//!   AttemptSpec (attempt 0 per shard)
//!        │ register + spawn
//!        ▼
//!  ┌──────────────────────────── attempt task ────────────────────────────┐
//!  │ Pending ─► Materializing ─► Dispatched ─► Monitoring ─► terminal     │
//!  │                                                  │                   │
//!  │                 retriable tests & budget left ───┴─► register + spawn │
//!  │                                                      child attempt    │
//!  └───────────────────────────────────┬──────────────────────────────────┘
//!                                      │ AttemptReport
//!                                      ▼
//!                     InFlight (outstanding count + channel)
//!                                      │
//!                                      ▼
//!                collector: BTreeMap<attempt key, AttemptReport>
//! ```
//!
//! Each attempt runs on its own task. A semaphore bounds how many attempts
//! are scheduled and monitored at once. A child attempt is registered
//! before its parent reports, so the outstanding count never reaches zero
//! while work is still queued.
//!
//! # Failure Handling
//!
//! Nothing an attempt does can fail the run. Every problem becomes an
//! [`AttemptOutcome::TopLevelError`] on the attempt it belongs to:
//!
//! | Situation | Error |
//! |-----------|-------|
//! | Shard without tests | [`ShardError::EmptyShard`] |
//! | Target has no devices at all | [`ShardError::BotParamsRejected`] |
//! | Request cannot be built | [`ShardError::Materialize`] |
//! | Schedule, poll, fetch, or decode failure | [`ShardError::Dispatch`] |
//! | Unknown verdict in a result | [`ShardError::InvalidVerdict`], on the retry key |

pub mod attempt;
pub mod inflight;
pub mod monitor;
pub mod retry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{DispatchError, ShardError};
use crate::execution::{ExecutionService, RequestMaterializer, decode_test_result};
use crate::inventory::Dimensions;
use crate::report::Reporter;

pub use attempt::{AttemptOutcome, AttemptReport, AttemptSpec, AttemptState, initial_attempts};
pub use inflight::InFlight;
pub use monitor::{JobWatch, MonitorSettings, watch_job};
pub use retry::{UnknownVerdict, Verdict, retriable_tests, retry_key};

/// Dispatcher settings.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Attempts scheduled or monitored at once. Minimum 1.
    pub max_parallel: usize,

    /// Retry attempts per shard lineage.
    pub retry_count: u32,

    pub monitor: MonitorSettings,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_parallel: config.scheduler.max_parallel,
            retry_count: config.suite.retry_count,
            monitor: MonitorSettings {
                poll_interval: Duration::from_secs(config.scheduler.poll_interval_secs),
                max_status_errors: config.scheduler.max_status_errors,
            },
        }
    }
}

/// State shared by every attempt task of one dispatch.
struct Shared<E: ?Sized, M: ?Sized> {
    service: Arc<E>,
    materializer: Arc<M>,
    settings: DispatchSettings,
    permits: Semaphore,
    inflight: InFlight,
    cancel: CancellationToken,
}

/// Runs shard attempts against an [`ExecutionService`].
pub struct Dispatcher<E: ?Sized, M: ?Sized> {
    service: Arc<E>,
    materializer: Arc<M>,
    settings: DispatchSettings,
}

impl<E, M> Dispatcher<E, M>
where
    E: ExecutionService + ?Sized + 'static,
    M: RequestMaterializer + ?Sized + 'static,
{
    pub fn new(service: Arc<E>, materializer: Arc<M>, settings: DispatchSettings) -> Self {
        Self {
            service,
            materializer,
            settings,
        }
    }

    /// Runs every attempt, retries included, until all have reported.
    ///
    /// Returns one report per attempt key. When `cancel` fires, attempts
    /// still waiting or monitoring end as [`AttemptOutcome::Cancelled`].
    pub async fn dispatch<R: Reporter + ?Sized>(
        &self,
        attempts: Vec<AttemptSpec>,
        cancel: CancellationToken,
        reporter: &R,
    ) -> BTreeMap<String, AttemptReport> {
        let (inflight, mut results) = InFlight::new();
        let shared = Arc::new(Shared {
            service: self.service.clone(),
            materializer: self.materializer.clone(),
            settings: self.settings,
            permits: Semaphore::new(self.settings.max_parallel.max(1)),
            inflight,
            cancel,
        });

        info!(
            "Dispatching {} attempts to {} (max {} in parallel, {} retries)",
            attempts.len(),
            self.service.name(),
            self.settings.max_parallel.max(1),
            self.settings.retry_count
        );

        for spec in attempts {
            shared.inflight.register();
            launch(shared.clone(), spec);
        }

        let mut reports = BTreeMap::new();
        loop {
            select! {
                biased;
                Some(report) = results.recv() => {
                    reporter.on_attempt_complete(&report).await;
                    collect(&mut reports, report);
                }
                _ = shared.inflight.wait_drained() => {
                    while let Ok(report) = results.try_recv() {
                        reporter.on_attempt_complete(&report).await;
                        collect(&mut reports, report);
                    }
                    break;
                }
            }
        }

        info!("All {} attempts reported", reports.len());
        reports
    }
}

fn collect(reports: &mut BTreeMap<String, AttemptReport>, report: AttemptReport) {
    debug!("{}: {}", report.key, report.outcome.label());
    if let Some(previous) = reports.insert(report.key.clone(), report) {
        warn!("Attempt {} reported twice", previous.key);
    }
}

/// Spawns an attempt. The caller must have registered it.
///
/// The attempt runs in its own task so a panic is caught here and still
/// produces a report.
fn launch<E, M>(shared: Arc<Shared<E, M>>, spec: AttemptSpec)
where
    E: ExecutionService + ?Sized + 'static,
    M: RequestMaterializer + ?Sized + 'static,
{
    tokio::spawn(async move {
        let task = tokio::spawn(run_attempt(shared.clone(), spec.clone()));
        let report = match task.await {
            Ok(report) => report,
            Err(e) => {
                let error = DispatchError::Internal(format!("attempt task failed: {}", e));
                AttemptReport::for_spec(&spec, None, AttemptOutcome::TopLevelError { error: error.into() })
            }
        };
        shared.inflight.complete(report);
    });
}

fn top_level(spec: &AttemptSpec, job_id: Option<String>, error: impl Into<ShardError>) -> AttemptReport {
    let error = error.into();
    warn!("{}: {}", spec.key, error);
    AttemptReport::for_spec(spec, job_id, AttemptOutcome::TopLevelError { error })
}

/// Runs one attempt to a terminal state and returns its report.
///
/// A retry child, if any, is registered and launched before this returns.
async fn run_attempt<E, M>(shared: Arc<Shared<E, M>>, spec: AttemptSpec) -> AttemptReport
where
    E: ExecutionService + ?Sized + 'static,
    M: RequestMaterializer + ?Sized + 'static,
{
    debug!("{}: {}", spec.key, AttemptState::Pending);

    if spec.tests.is_empty() {
        return top_level(&spec, None, ShardError::EmptyShard);
    }

    if spec.fleet_size() == 0 {
        let dimensions = match &spec.device {
            Some(device) => device.dimensions.clone(),
            None => Dimensions::for_config(&spec.config, &spec.pool),
        };
        return top_level(&spec, None, ShardError::BotParamsRejected { dimensions });
    }

    debug!("{}: {}", spec.key, AttemptState::Materializing);
    let request = match shared.materializer.materialize(&spec.materialize_input()) {
        Ok(request) => request,
        Err(e) => {
            return top_level(&spec, None, ShardError::Materialize {
                message: e.to_string(),
            });
        }
    };

    let cancel = shared.cancel.child_token();
    let permit = select! {
        _ = cancel.cancelled() => None,
        permit = shared.permits.acquire() => permit.ok(),
    };
    let Some(permit) = permit else {
        return AttemptReport::for_spec(&spec, None, AttemptOutcome::Cancelled);
    };

    let job = match shared.service.schedule(&request).await {
        Ok(job) => job,
        Err(e) => return top_level(&spec, None, DispatchError::Schedule(e.to_string())),
    };
    let job_id = Some(job.to_string());
    debug!("{}: {} as job {}", spec.key, AttemptState::Dispatched, job);

    debug!("{}: {}", spec.key, AttemptState::Monitoring);
    match watch_job(shared.service.as_ref(), &job, shared.settings.monitor, &cancel).await {
        Ok(JobWatch::Completed) => {}
        Ok(JobWatch::Cancelled) => {
            info!("{}: cancelled while monitoring job {}", spec.key, job);
            return AttemptReport::for_spec(&spec, job_id, AttemptOutcome::Cancelled);
        }
        Err(e) => return top_level(&spec, job_id, e),
    }

    let output = match shared.service.fetch_output(&job).await {
        Ok(output) => output,
        Err(e) => return top_level(&spec, job_id, DispatchError::Fetch(e.to_string())),
    };
    drop(permit);

    let result = match decode_test_result(&output) {
        Ok(result) => result,
        Err(e) => return top_level(&spec, job_id, DispatchError::Decode(e.to_string())),
    };

    let classified = retriable_tests(&result);
    let succeeded = matches!(&classified, Ok(retriable) if retriable.is_empty());

    match classified {
        Ok(retriable) if !retriable.is_empty() && spec.attempt < shared.settings.retry_count => {
            let child = spec.retry(retriable);
            info!(
                "{}: retrying {} tests as {}",
                spec.key,
                child.tests.len(),
                child.key
            );
            shared.inflight.register();
            launch(shared.clone(), child);
        }
        // Recorded whatever the remaining budget; the child never runs.
        Err(error) => {
            let child = spec.retry(Vec::new());
            shared.inflight.register();
            shared.inflight.complete(top_level(&child, None, error));
        }
        Ok(_) => {}
    }

    let outcome = if succeeded {
        AttemptOutcome::Succeeded { result }
    } else {
        AttemptOutcome::Failed { result }
    };
    AttemptReport::for_spec(&spec, job_id, outcome)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::execution::{
        CaseResult, ExecutionError, ExecutionRequest, ExecutionResult, JobId, JobStatus,
        JsonMaterializer, TestRunResult, encode_test_result,
    };
    use crate::hardware::{AtomicHardwareConfig, HardwareKey};
    use crate::inventory::DeviceInfo;
    use crate::report::NullReporter;

    /// Execution service answering from a verdict table keyed by
    /// `(attempt, test)`. Tests not in the table pass.
    #[derive(Default)]
    struct FakeService {
        verdicts: HashMap<(u32, &'static str), &'static str>,
        /// Jobs for these attempt keys never finish.
        hanging: BTreeSet<String>,
        /// Jobs for these attempt keys fail remotely.
        failing: BTreeSet<String>,
        requests: Mutex<HashMap<String, ExecutionRequest>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeService {
        fn scheduled(&self) -> Vec<ExecutionRequest> {
            let mut requests: Vec<_> = self.requests.lock().unwrap().values().cloned().collect();
            requests.sort_by(|a, b| a.key.cmp(&b.key));
            requests
        }
    }

    #[async_trait]
    impl ExecutionService for FakeService {
        async fn schedule(&self, request: &ExecutionRequest) -> ExecutionResult<JobId> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            self.requests
                .lock()
                .unwrap()
                .insert(request.key.clone(), request.clone());
            tokio::task::yield_now().await;
            Ok(JobId::new(request.key.clone()))
        }

        async fn status(&self, job: &JobId) -> ExecutionResult<JobStatus> {
            if self.hanging.contains(job.as_str()) {
                return Ok(JobStatus::Running);
            }
            if self.failing.contains(job.as_str()) {
                return Ok(JobStatus::Failed {
                    reason: "dut went away".to_string(),
                });
            }
            Ok(JobStatus::Completed)
        }

        async fn fetch_output(&self, job: &JobId) -> ExecutionResult<Vec<u8>> {
            self.active.fetch_sub(1, Ordering::SeqCst);
            let request = self
                .requests
                .lock()
                .unwrap()
                .get(job.as_str())
                .cloned()
                .ok_or_else(|| ExecutionError::CallFailed("unknown job".to_string()))?;

            let cases = request
                .tests
                .iter()
                .map(|name| {
                    let verdict = self
                        .verdicts
                        .get(&(request.attempt, name.as_str()))
                        .copied()
                        .unwrap_or("PASS");
                    CaseResult::new(name.clone(), verdict)
                })
                .collect();
            Ok(encode_test_result(&TestRunResult { cases })?)
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn settings(retry_count: u32) -> DispatchSettings {
        DispatchSettings {
            max_parallel: 4,
            retry_count,
            monitor: MonitorSettings {
                poll_interval: Duration::from_millis(1),
                max_status_errors: 0,
            },
        }
    }

    fn shard(key: &str, tests: &[&str], total: u32) -> AttemptSpec {
        AttemptSpec {
            key: key.to_string(),
            shard_key: key.to_string(),
            attempt: 0,
            suite: "bvt".to_string(),
            pool: "quota".to_string(),
            harness: "tast".to_string(),
            hardware: HardwareKey::from("hw"),
            config: AtomicHardwareConfig::new("eve"),
            device: Some(DeviceInfo {
                ready: total,
                total,
                ..Default::default()
            }),
            tests: tests.iter().map(|name| name.to_string()).collect(),
        }
    }

    async fn dispatch(
        service: Arc<FakeService>,
        settings: DispatchSettings,
        attempts: Vec<AttemptSpec>,
    ) -> BTreeMap<String, AttemptReport> {
        Dispatcher::new(service, Arc::new(JsonMaterializer::new(60)), settings)
            .dispatch(attempts, CancellationToken::new(), &NullReporter)
            .await
    }

    const FIVE: [&str; 5] = ["tast.a", "tast.b", "tast.c", "tast.d", "tast.e"];

    #[tokio::test]
    async fn test_two_of_five_failing_spawns_one_retry() {
        let service = Arc::new(FakeService {
            verdicts: HashMap::from([((0, "tast.b"), "FAIL"), ((0, "tast.d"), "FAIL")]),
            ..Default::default()
        });

        let reports = dispatch(service.clone(), settings(1), vec![shard("s0", &FIVE, 1)]).await;

        assert_eq!(reports.len(), 2);
        assert!(matches!(reports["s0"].outcome, AttemptOutcome::Failed { .. }));
        let retry = &reports["s0-retry-1"];
        assert_eq!(retry.tests, vec!["tast.b", "tast.d"]);
        assert_eq!(retry.attempt, 1);
        assert!(retry.outcome.is_success());

        let scheduled = service.scheduled();
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[1].tests, vec!["tast.b", "tast.d"]);
    }

    #[tokio::test]
    async fn test_zero_budget_spawns_no_retry() {
        let service = Arc::new(FakeService {
            verdicts: HashMap::from([((0, "tast.b"), "FAIL"), ((0, "tast.d"), "FAIL")]),
            ..Default::default()
        });

        let reports = dispatch(service.clone(), settings(0), vec![shard("s0", &FIVE, 1)]).await;

        assert_eq!(reports.len(), 1);
        assert!(matches!(reports["s0"].outcome, AttemptOutcome::Failed { .. }));
        assert_eq!(service.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_chain_stops_at_budget() {
        let service = Arc::new(FakeService {
            verdicts: HashMap::from([
                ((0, "tast.a"), "ERROR"),
                ((1, "tast.a"), "ABORT"),
                ((2, "tast.a"), "FAIL"),
            ]),
            ..Default::default()
        });

        let reports = dispatch(service, settings(2), vec![shard("s0", &["tast.a", "tast.b"], 1)]).await;

        let keys: Vec<&str> = reports.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["s0", "s0-retry-1", "s0-retry-2"]);
        assert!(reports.values().all(|r| matches!(r.outcome, AttemptOutcome::Failed { .. })));
    }

    #[tokio::test]
    async fn test_rejections_are_not_dispatched() {
        let service = Arc::new(FakeService::default());

        let reports = dispatch(
            service.clone(),
            settings(1),
            vec![shard("empty", &[], 1), shard("nobots", &["tast.a"], 0), shard("ok", &["tast.b"], 1)],
        )
        .await;

        assert_eq!(reports["empty"].outcome.error(), Some(&ShardError::EmptyShard));
        assert!(matches!(
            reports["nobots"].outcome.error(),
            Some(ShardError::BotParamsRejected { .. })
        ));
        assert!(reports["ok"].outcome.is_success());
        assert_eq!(service.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_verdict_recorded_on_retry_key() {
        let service = Arc::new(FakeService {
            verdicts: HashMap::from([((0, "tast.a"), "MAYBE")]),
            ..Default::default()
        });

        let reports = dispatch(service.clone(), settings(1), vec![shard("s0", &["tast.a"], 1)]).await;

        assert!(matches!(reports["s0"].outcome, AttemptOutcome::Failed { .. }));
        assert_eq!(
            reports["s0-retry-1"].outcome.error(),
            Some(&ShardError::InvalidVerdict {
                test: "tast.a".to_string(),
                verdict: "MAYBE".to_string(),
            })
        );
        assert_eq!(service.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_verdict_recorded_without_budget() {
        let service = Arc::new(FakeService {
            verdicts: HashMap::from([((0, "tast.a"), "MAYBE")]),
            ..Default::default()
        });

        let reports = dispatch(service.clone(), settings(0), vec![shard("s0", &["tast.a"], 1)]).await;

        assert_eq!(reports.len(), 2);
        assert!(matches!(reports["s0"].outcome, AttemptOutcome::Failed { .. }));
        assert!(matches!(
            reports["s0-retry-1"].outcome.error(),
            Some(ShardError::InvalidVerdict { .. })
        ));
        assert!(reports["s0-retry-1"].tests.is_empty());
        assert_eq!(service.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_verdict_on_last_attempt() {
        // Attempt 1 is the last one allowed; its unknown verdict still
        // lands on the next retry key.
        let service = Arc::new(FakeService {
            verdicts: HashMap::from([((0, "tast.a"), "FAIL"), ((1, "tast.a"), "MAYBE")]),
            ..Default::default()
        });

        let reports = dispatch(service.clone(), settings(1), vec![shard("s0", &["tast.a"], 1)]).await;

        assert_eq!(reports.len(), 3);
        assert!(matches!(
            reports["s0-retry-2"].outcome.error(),
            Some(ShardError::InvalidVerdict { .. })
        ));
        assert_eq!(service.scheduled().len(), 2);
    }

    #[tokio::test]
    async fn test_remote_failure_is_dispatch_error() {
        let service = Arc::new(FakeService {
            failing: BTreeSet::from(["s0".to_string()]),
            ..Default::default()
        });

        let reports = dispatch(service, settings(1), vec![shard("s0", &["tast.a"], 1)]).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports["s0"].outcome.error(),
            Some(&ShardError::Dispatch {
                error: DispatchError::JobFailed("dut went away".to_string())
            })
        );
        assert_eq!(reports["s0"].job_id.as_deref(), Some("s0"));
    }

    #[tokio::test]
    async fn test_cancel_ends_hanging_attempts_only() {
        let service = Arc::new(FakeService {
            hanging: BTreeSet::from(["slow".to_string()]),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let reports = Dispatcher::new(service, Arc::new(JsonMaterializer::new(60)), settings(1))
            .dispatch(
                vec![shard("slow", &["tast.a"], 1), shard("fast", &["tast.b"], 1)],
                cancel,
                &NullReporter,
            )
            .await;

        assert_eq!(reports["slow"].outcome, AttemptOutcome::Cancelled);
        assert!(reports["fast"].outcome.is_success());
    }

    #[tokio::test]
    async fn test_parallelism_bounded() {
        let service = Arc::new(FakeService::default());
        let attempts = (0..12)
            .map(|i| shard(&format!("s{}", i), &["tast.a"], 1))
            .collect();
        let mut settings = settings(0);
        settings.max_parallel = 3;

        let reports = dispatch(service.clone(), settings, attempts).await;

        assert_eq!(reports.len(), 12);
        assert!(service.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_no_attempts() {
        let reports = dispatch(Arc::new(FakeService::default()), settings(1), Vec::new()).await;
        assert!(reports.is_empty());
    }
}
