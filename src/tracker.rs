//! Completion tracker
//!
//! Blocks until a Job reaches a terminal state, or until it disappears from
//! the cache after a delete. Waits wake on cache change notifications, with a
//! jittered exponential poll as a fallback, and always end on the deadline or
//! on cancellation.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::cache::{ObjectCache, ObjectKey};
use crate::resources::{job_outcome, JobOutcome};
use crate::retry::{Backoff, RetryConfig};
use crate::Error;

/// Observes Jobs through the local cache
#[derive(Clone)]
pub struct CompletionTracker {
    jobs: Arc<dyn ObjectCache<Job>>,
    poll: RetryConfig,
}

impl CompletionTracker {
    /// Create a tracker reading `jobs`, falling back to polling on the `poll` schedule
    pub fn new(jobs: Arc<dyn ObjectCache<Job>>, poll: RetryConfig) -> Self {
        Self { jobs, poll }
    }

    /// True if the Job is currently in the cache
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.jobs.get_by_key(key).is_some()
    }

    /// Wait for the Job to succeed or fail
    ///
    /// A Job that is not in the cache yet counts as still running.
    pub async fn await_terminal(
        &self,
        key: &ObjectKey,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, Error> {
        self.wait_for("completion", key, timeout, cancel, |job| {
            job.and_then(|job| job_outcome(&job))
        })
        .await
    }

    /// Wait for the Job to be gone from the cache
    pub async fn await_absence(
        &self,
        key: &ObjectKey,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.wait_for("deletion", key, timeout, cancel, |job| match job {
            Some(_) => None,
            None => Some(()),
        })
        .await
    }

    async fn wait_for<T, F>(
        &self,
        what: &str,
        key: &ObjectKey,
        timeout: Duration,
        cancel: &CancellationToken,
        check: F,
    ) -> Result<T, Error>
    where
        F: Fn(Option<Arc<Job>>) -> Option<T>,
    {
        let deadline = Instant::now() + timeout;
        let mut changes = self.jobs.subscribe();
        let mut notifications = true;
        let mut backoff = Backoff::new(&self.poll);

        loop {
            // Mark the current generation as seen before reading, so a change
            // racing with the read still wakes the next select
            changes.borrow_and_update();
            if let Some(result) = check(self.jobs.get_by_key(key)) {
                return Ok(result);
            }

            let delay = backoff.next_delay();
            trace!(job = %key, what, delay_ms = delay.as_millis() as u64, "Waiting on job");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("{} of Job {}", what, key)));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout(format!("{} of Job {}", what, key)));
                }
                changed = changes.changed(), if notifications => {
                    if changed.is_err() {
                        // Cache dropped its sender; keep polling on the backoff
                        notifications = false;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
