//! Meridian store: the local cache read by reconcile and rebalance passes.
//!
//! Writers (watchers) publish whole snapshots through an `ArcSwap`; readers
//! load the current snapshot without locking and never see a partial write.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use arc_swap::ArcSwap;
use meridian_core::{Delta, DeltaKind, ObjectKey};
use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info};

/// Read side of the local cache as seen by handlers.
pub trait Cache<T>: Send + Sync {
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<T>>>;
    /// Every cached object, across all namespaces.
    fn list(&self) -> Result<Vec<Arc<T>>>;
}

/// Immutable view of the cache at one epoch.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub epoch: u64,
    items: FxHashMap<ObjectKey, Arc<T>>,
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self { Self { epoch: 0, items: FxHashMap::default() } }
}

impl<T> Snapshot<T> {
    pub fn get(&self, key: &ObjectKey) -> Option<&Arc<T>> { self.items.get(key) }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &Arc<T>)> { self.items.iter() }
}

pub struct LocalCache<T> {
    name: &'static str,
    snap: ArcSwap<Snapshot<T>>,
    /// Serializes writers; readers never take it.
    write: Mutex<()>,
    epoch_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
}

impl<T> LocalCache<T> {
    pub fn new(name: &'static str) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let (synced_tx, _) = watch::channel(false);
        Self { name, snap: ArcSwap::from_pointee(Snapshot::default()), write: Mutex::new(()), epoch_tx, synced_tx }
    }

    pub fn name(&self) -> &'static str { self.name }

    pub fn current(&self) -> Arc<Snapshot<T>> { self.snap.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    /// True once a full listing has been stored via [`LocalCache::replace`].
    pub fn has_synced(&self) -> bool { *self.synced_tx.borrow() }

    pub async fn wait_synced(&self) {
        let mut rx = self.synced_tx.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Apply one change. Returns the object previously stored under the key.
    pub fn apply(&self, delta: Delta<T>) -> Option<Arc<T>> {
        let _w = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let cur = self.snap.load();
        let mut items = cur.items.clone();
        let prev = match delta.kind {
            DeltaKind::Applied => items.insert(delta.key, Arc::new(delta.obj)),
            DeltaKind::Deleted => items.remove(&delta.key),
        };
        self.publish(cur.epoch, items);
        prev
    }

    /// Swap in a complete listing and mark the cache synced.
    /// Returns the entries that were cached before but are absent from `items`.
    pub fn replace(&self, items: Vec<(ObjectKey, T)>) -> Vec<(ObjectKey, Arc<T>)> {
        let _w = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let cur = self.snap.load();
        let next: FxHashMap<ObjectKey, Arc<T>> = items.into_iter().map(|(k, o)| (k, Arc::new(o))).collect();
        let removed: Vec<(ObjectKey, Arc<T>)> = cur
            .items
            .iter()
            .filter(|(k, _)| !next.contains_key(*k))
            .map(|(k, o)| (k.clone(), Arc::clone(o)))
            .collect();
        self.publish(cur.epoch, next);
        if !self.synced_tx.send_replace(true) {
            info!(cache = self.name, objects = self.snap.load().len(), "cache synced");
        }
        removed
    }

    fn publish(&self, prev_epoch: u64, items: FxHashMap<ObjectKey, Arc<T>>) {
        let epoch = prev_epoch.saturating_add(1);
        let len = items.len();
        self.snap.store(Arc::new(Snapshot { epoch, items }));
        self.epoch_tx.send_replace(epoch);
        gauge!("cache_objects", len as f64, "cache" => self.name);
        debug!(cache = self.name, epoch, objects = len, "snapshot swapped");
    }
}

impl<T: Send + Sync> Cache<T> for LocalCache<T> {
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<T>>> {
        Ok(self.snap.load().get(key).cloned())
    }

    fn list(&self) -> Result<Vec<Arc<T>>> {
        Ok(self.snap.load().items.values().cloned().collect())
    }
}
