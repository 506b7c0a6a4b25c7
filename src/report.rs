//! Run reporting and output generation.
//!
//! Reporters are notified as a run progresses: once the distribution plan
//! is known, once per finished attempt (retries included), and once at the
//! end with the aggregated [`RunResult`].
//!
//! | Reporter | Output |
//! |----------|--------|
//! | [`ConsoleReporter`] | Progress bar and summary on the terminal |
//! | [`JsonReporter`] | Results file, see [`write_results_json`] |
//! | [`MultiReporter`] | Fans out to several reporters |
//! | [`NullReporter`] | Nothing |

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info};

use crate::dispatch::{AttemptOutcome, AttemptReport};
use crate::distribution::DistributionPlan;
use crate::orchestrator::RunResult;

/// Receives progress notifications from the orchestrator.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once shards are placed, before anything is dispatched.
    async fn on_plan_complete(&self, plan: &DistributionPlan);

    /// Called once per finished attempt, in completion order.
    async fn on_attempt_complete(&self, report: &AttemptReport);

    /// Called once at the end of the run.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_plan_complete(&self, _plan: &DistributionPlan) {}
    async fn on_attempt_complete(&self, _report: &AttemptReport) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// Combines multiple reporters into one.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_plan_complete(&self, plan: &DistributionPlan) {
        for reporter in &self.reporters {
            reporter.on_plan_complete(plan).await;
        }
    }

    async fn on_attempt_complete(&self, report: &AttemptReport) {
        for reporter in &self.reporters {
            reporter.on_attempt_complete(report).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Prints progress and a summary to the terminal.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
        }
    }

    fn with_progress(&self, f: impl FnOnce(&indicatif::ProgressBar)) {
        if let Ok(guard) = self.progress.lock()
            && let Some(pb) = guard.as_ref()
        {
            f(pb);
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_plan_complete(&self, plan: &DistributionPlan) {
        println!(
            "Planned {} shards on {} devices ({} tests, {} unmatched)",
            plan.shard_count(),
            plan.assignment.devices().count(),
            plan.placed_tests(),
            plan.unmatched_tests()
        );

        let pb = indicatif::ProgressBar::new((plan.shard_count() + plan.unmatched.len()) as u64);
        match indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} attempts")
        {
            Ok(style) => pb.set_style(style.progress_chars("#>-")),
            Err(e) => error!("Invalid progress template: {}", e),
        }

        if let Ok(mut guard) = self.progress.lock() {
            *guard = Some(pb);
        }
    }

    async fn on_attempt_complete(&self, report: &AttemptReport) {
        let status = match &report.outcome {
            AttemptOutcome::Succeeded { .. } => console::style("PASS").green(),
            AttemptOutcome::Failed { .. } => console::style("FAIL").red(),
            AttemptOutcome::TopLevelError { .. } => console::style("ERR ").red().bold(),
            AttemptOutcome::Cancelled => console::style("CANC").yellow(),
        };
        let line = match report.outcome.error() {
            Some(err) => format!("{} {} ({})", status, report.key, console::style(err).dim()),
            None => format!("{} {} ({} tests)", status, report.key, report.tests.len()),
        };
        let verbose = self.verbose || !report.outcome.is_success();

        self.with_progress(|pb| {
            // Retries were not known when the bar was sized.
            if report.attempt > 0 {
                pb.inc_length(1);
            }
            pb.inc(1);
            if verbose {
                pb.println(&line);
            }
        });
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Ok(mut guard) = self.progress.lock()
            && let Some(pb) = guard.take()
        {
            pb.finish_and_clear();
        }

        println!();
        println!("Results for {}:", result.suite);
        println!("  Tests:    {}", result.total_tests);
        println!("  Passed:   {}", console::style(result.passed).green());
        println!("  Failed:   {}", console::style(result.failed).red());

        if result.not_run > 0 {
            println!("  Not Run:  {}", console::style(result.not_run).red().bold());
        }

        if result.flaky > 0 {
            println!("  Flaky:    {}", console::style(result.flaky).yellow());
        }

        println!("  Attempts: {}", result.attempts.len());
        println!("  Duration: {:?}", result.duration);

        if result.success() {
            println!();
            println!("{}", console::style("All tests passed!").green().bold());
            return;
        }

        println!();
        println!("{}", console::style("Some tests did not pass.").red().bold());

        let errors: Vec<&AttemptReport> = result
            .attempts
            .values()
            .filter(|report| report.outcome.error().is_some())
            .collect();
        if !errors.is_empty() {
            println!();
            println!("Shard errors:");
            for report in errors {
                if let Some(err) = report.outcome.error() {
                    println!("  - {} ({} tests)", report.key, report.tests.len());
                    println!("    {}", console::style(err).dim());
                }
            }
        }

        let failed = result.failed_tests();
        if !failed.is_empty() {
            println!();
            println!("Failed tests:");
            for name in failed {
                println!("  - {}", name);
            }
        }
    }
}

/// Writes the results file when the run completes.
pub struct JsonReporter {
    path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_plan_complete(&self, _plan: &DistributionPlan) {}
    async fn on_attempt_complete(&self, _report: &AttemptReport) {}

    async fn on_run_complete(&self, result: &RunResult) {
        match write_results_json(&self.path, result) {
            Ok(()) => info!("Results written to {}", self.path.display()),
            Err(e) => error!("{:#}", e),
        }
    }
}

/// Writes `result` as pretty JSON, creating parent directories.
pub fn write_results_json(path: &Path, result: &RunResult) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(result).context("Failed to encode results")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write results file: {}", path.display()))?;

    Ok(())
}
