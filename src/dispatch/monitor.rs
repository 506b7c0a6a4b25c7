//! Polling a scheduled job until it reaches a terminal state.

use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::execution::{ExecutionService, JobId, JobStatus};

/// How a watched job ended, when it ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobWatch {
    /// Output is ready to fetch.
    Completed,
    /// The caller cancelled the watch.
    Cancelled,
}

/// Polling parameters.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Consecutive failed polls tolerated before giving up.
    pub max_status_errors: u32,
}

/// Polls `job` every `poll_interval` until it is terminal or `cancel` fires.
///
/// Transient status errors are logged and tolerated until more than
/// `max_status_errors` happen in a row. A job the service reports as
/// failed or cancelled is a [`DispatchError`].
pub async fn watch_job<E: ExecutionService + ?Sized>(
    service: &E,
    job: &JobId,
    settings: MonitorSettings,
    cancel: &CancellationToken,
) -> Result<JobWatch, DispatchError> {
    let mut errors = 0u32;

    loop {
        let status = select! {
            _ = cancel.cancelled() => return Ok(JobWatch::Cancelled),
            status = service.status(job) => status,
        };

        match status {
            Ok(JobStatus::Completed) => return Ok(JobWatch::Completed),
            Ok(JobStatus::Failed { reason }) => return Err(DispatchError::JobFailed(reason)),
            Ok(JobStatus::Cancelled) => return Err(DispatchError::JobCancelled),
            Ok(status) => {
                debug!("Job {} is {:?}", job, status);
                errors = 0;
            }
            Err(e) => {
                errors += 1;
                if errors > settings.max_status_errors {
                    return Err(DispatchError::Status(format!(
                        "{} consecutive failures, last: {}",
                        errors, e
                    )));
                }
                warn!("Status poll {} of job {} failed: {}", errors, job, e);
            }
        }

        select! {
            _ = cancel.cancelled() => return Ok(JobWatch::Cancelled),
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }
}
