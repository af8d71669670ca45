//! Registry of active training runs
//!
//! Each run gets a child of the registry's root token. A request can have at
//! most one live run; the run removes itself when its task ends. Finished
//! runs are remembered by request uid so a reconcile that still sees the
//! pre-completion status cannot start the same request over.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ObjectKey;

/// Tracks the training run of every request
#[derive(Clone)]
pub struct RunRegistry {
    active: Arc<DashMap<ObjectKey, u64>>,
    finished: Arc<DashMap<ObjectKey, String>>,
    root: CancellationToken,
    next_id: Arc<AtomicU64>,
}

impl RunRegistry {
    /// Create a registry whose runs are cancelled together with `root`
    pub fn new(root: CancellationToken) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            finished: Arc::new(DashMap::new()),
            root,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start a run for the request `uid` at `key` unless one is live or done
    ///
    /// Returns false when the request already has a live run, or when a run
    /// for the same uid has finished.
    pub fn launch<F, Fut>(&self, key: ObjectKey, uid: &str, run: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.has_finished(&key, uid) {
            debug!(request = %key, "Training run already finished");
            return false;
        }
        match self.active.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!(request = %key, "Training run already active");
                false
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                slot.insert(id);

                let task = run(self.root.child_token());
                let active = self.active.clone();
                let finished = self.finished.clone();
                let uid = uid.to_string();
                tokio::spawn(async move {
                    task.await;
                    finished.insert(key.clone(), uid);
                    active.remove_if(&key, |_, run| *run == id);
                    debug!(request = %key, "Training run finished");
                });
                true
            }
        }
    }

    /// Whether the request has a live run
    pub fn is_running(&self, key: &ObjectKey) -> bool {
        self.active.contains_key(key)
    }

    /// Whether a run of the request with this uid already ended
    pub fn has_finished(&self, key: &ObjectKey, uid: &str) -> bool {
        self.finished
            .get(key)
            .is_some_and(|finished| finished.as_str() == uid)
    }

    /// Number of live runs
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Cancel every live run
    pub fn shutdown(&self) {
        let count = self.len();
        if count > 0 {
            info!(count, "Cancelling training runs");
        }
        self.root.cancel();
    }

    /// Wait for every run to end, giving up after `timeout`
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.len(),
                    "Training runs still active after shutdown grace period"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}
