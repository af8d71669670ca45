//! Fan-in barrier over a set of Jobs
//!
//! Each run owns its barrier. All Jobs are awaited concurrently; the first
//! failure cancels the remaining waiters, which are drained before the
//! barrier returns so no waiter outlives it.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::ObjectKey;
use crate::resources::JobOutcome;
use crate::tracker::CompletionTracker;
use crate::Error;

/// Wait until every Job in `jobs` succeeded, failing fast on the first failure
pub async fn await_all(
    tracker: &CompletionTracker,
    jobs: &[ObjectKey],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let peers = cancel.child_token();
    let mut waiters = JoinSet::new();

    for key in jobs {
        let tracker = tracker.clone();
        let key = key.clone();
        let peers = peers.clone();
        waiters.spawn(async move {
            let outcome = tracker.await_terminal(&key, timeout, &peers).await;
            (key, outcome)
        });
    }

    let mut first_error = None;
    while let Some(joined) = waiters.join_next().await {
        let error = match joined {
            Ok((key, Ok(JobOutcome::Succeeded))) => {
                debug!(job = %key, "Job succeeded");
                continue;
            }
            Ok((key, Ok(JobOutcome::Failed { message }))) => Error::job_failed(key.name, message),
            Ok((_, Err(e))) => e,
            Err(e) => Error::contract(format!("job waiter did not finish: {}", e)),
        };

        if first_error.is_none() {
            warn!(error = %error, pending = waiters.len(), "Cancelling remaining job waiters");
            peers.cancel();
            first_error = Some(error);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
