//! Outstanding-attempt tracking.
//!
//! Attempts can spawn further attempts (retries) while the collector is
//! draining results, so the number of attempts is not known up front.
//! Every launch registers first; every finished attempt sends its report
//! and then deregisters. The run is over when the count returns to zero.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::AttemptReport;

/// Counts attempts that were registered but have not reported yet.
#[derive(Debug)]
pub struct InFlight {
    outstanding: AtomicUsize,
    drained: Notify,
    results: UnboundedSender<AttemptReport>,
}

impl InFlight {
    /// Creates a tracker and the receiving end of its results channel.
    pub fn new() -> (Self, UnboundedReceiver<AttemptReport>) {
        let (results, receiver) = unbounded_channel();
        let tracker = Self {
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
            results,
        };
        (tracker, receiver)
    }

    /// Registers an attempt. Must be called before the attempt is spawned.
    pub fn register(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a finished attempt.
    pub fn complete(&self, report: AttemptReport) {
        // Fails only once the collector is gone.
        let _ = self.results.send(report);
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Attempts registered and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Waits until no attempt is outstanding.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dispatch::AttemptOutcome;
    use crate::error::ShardError;

    fn report(key: &str) -> AttemptReport {
        AttemptReport::unplaced(key, "tast", Vec::new(), ShardError::EmptyShard)
    }

    #[tokio::test]
    async fn test_drained_immediately_when_empty() {
        let (inflight, _rx) = InFlight::new();
        inflight.wait_drained().await;
        assert_eq!(inflight.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_reports_arrive_before_drain() {
        let (inflight, mut rx) = InFlight::new();
        let inflight = Arc::new(inflight);
        inflight.register();

        let worker = inflight.clone();
        tokio::spawn(async move {
            // A child registers before its parent completes.
            worker.register();
            worker.complete(report("parent"));
            tokio::task::yield_now().await;
            worker.complete(report("child"));
        });

        inflight.wait_drained().await;
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.key, "parent");
        assert_eq!(second.key, "child");
        assert!(matches!(second.outcome, AttemptOutcome::TopLevelError { .. }));
    }
}
