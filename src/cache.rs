//! Local watch cache
//!
//! The core never touches watch machinery directly. It depends on the narrow
//! [`ObjectCache`] interface: look up by key, ask whether the initial list has
//! been seen, and subscribe to change notifications. [`ReflectorCache`] backs
//! it with a kube `watcher` + `reflector` store; [`MemoryCache`] is an
//! in-memory implementation for tests.

use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Error;

/// Namespace/name key of a cached object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object, None if it lacks a name or namespace
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read-only view of a watched resource kind
pub trait ObjectCache<K>: Send + Sync {
    /// Current state of the object with the given key
    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>>;

    /// True once the initial list has been loaded
    fn has_synced(&self) -> bool;

    /// Receiver whose value changes every time the cache contents change
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Wait until every cache reports synced, bounded by `timeout`
pub async fn wait_for_sync(
    caches: &[(&str, &dyn SyncStatus)],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let deadline = tokio::time::Instant::now() + timeout;
    let poll = Duration::from_millis(100);

    loop {
        let pending: Vec<&str> = caches
            .iter()
            .filter(|(_, cache)| !cache.is_synced())
            .map(|(name, _)| *name)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "cache sync of {}",
                pending.join(", ")
            )));
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled("cache sync".to_string()));
            }
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Object-safe sync probe, implemented for every [`ObjectCache`]
pub trait SyncStatus: Send + Sync {
    fn is_synced(&self) -> bool;
}

impl<K> SyncStatus for Arc<dyn ObjectCache<K>> {
    fn is_synced(&self) -> bool {
        self.has_synced()
    }
}

// =============================================================================
// Reflector-backed cache
// =============================================================================

/// Cache backed by a kube reflector store
pub struct ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    kind: &'static str,
    store: Store<K>,
    synced: AtomicBool,
    generation: watch::Sender<u64>,
}

impl<K> ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Start watching `api` in a background task that stops on `cancel`
    pub fn spawn(
        kind: &'static str,
        api: Api<K>,
        config: watcher::Config,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (store, writer) = reflector::store();
        let (generation, _) = watch::channel(0);
        let cache = Arc::new(Self {
            kind,
            store,
            synced: AtomicBool::new(false),
            generation,
        });

        let stream = watcher::watcher(api, config)
            .default_backoff()
            .reflect(writer);

        let task_cache = cache.clone();
        tokio::spawn(async move {
            task_cache.run(stream, cancel).await;
        });

        cache
    }

    async fn run<S>(&self, stream: S, cancel: CancellationToken)
    where
        S: futures::Stream<Item = Result<Event<K>, watcher::Error>> + Send,
    {
        let mut stream = std::pin::pin!(stream);

        info!(kind = self.kind, "Starting watch cache");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(Event::Apply(obj))) | Some(Ok(Event::InitApply(obj))) => {
                        debug!(kind = self.kind, name = %obj.name_any(), "Object applied");
                        self.bump();
                    }
                    Some(Ok(Event::Delete(obj))) => {
                        debug!(kind = self.kind, name = %obj.name_any(), "Object deleted");
                        self.bump();
                    }
                    Some(Ok(Event::Init)) => {
                        debug!(kind = self.kind, "Watch cache relisting");
                    }
                    Some(Ok(Event::InitDone)) => {
                        if !self.synced.swap(true, Ordering::SeqCst) {
                            info!(
                                kind = self.kind,
                                objects = self.store.state().len(),
                                "Watch cache synced"
                            );
                        }
                        self.bump();
                    }
                    Some(Err(e)) => {
                        warn!(kind = self.kind, error = %e, "Watch error, backing off");
                    }
                    None => break,
                }
            }
        }

        info!(kind = self.kind, "Watch cache stopped");
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }
}

fn object_ref<K>(key: &ObjectKey) -> ObjectRef<K>
where
    K: Resource<DynamicType = ()>,
{
    ObjectRef::new(&key.name).within(&key.namespace)
}

impl<K> ObjectCache<K> for ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.get(&object_ref(key))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

// =============================================================================
// In-memory cache
// =============================================================================

/// In-memory cache whose contents are driven by the caller
pub struct MemoryCache<K> {
    objects: DashMap<ObjectKey, Arc<K>>,
    synced: AtomicBool,
    generation: watch::Sender<u64>,
}

impl<K> Default for MemoryCache<K> {
    fn default() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            objects: DashMap::new(),
            synced: AtomicBool::new(true),
            generation,
        }
    }
}

impl<K> MemoryCache<K>
where
    K: Resource + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object
    pub fn apply(&self, obj: K) -> Result<(), Error> {
        let key = ObjectKey::of(&obj)
            .ok_or_else(|| Error::contract("cached object needs a name and namespace"))?;
        self.objects.insert(key, Arc::new(obj));
        self.bump();
        Ok(())
    }

    /// Remove an object, returning it if it was present
    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let removed = self.objects.remove(key).map(|(_, obj)| obj);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Replace an object in place
    pub fn update<F>(&self, key: &ObjectKey, f: F) -> bool
    where
        F: FnOnce(&mut K),
    {
        let updated = match self.objects.get_mut(key) {
            Some(mut entry) => {
                let mut obj = entry.as_ref().clone();
                f(&mut obj);
                *entry = Arc::new(obj);
                true
            }
            None => false,
        };
        if updated {
            self.bump();
        }
        updated
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
        self.bump();
    }

    /// Keys of every cached object, sorted
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }
}

impl<K> ObjectCache<K> for MemoryCache<K>
where
    K: Send + Sync,
{
    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.objects.get(key).map(|e| e.value().clone())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}
