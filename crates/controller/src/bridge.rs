//! Cache notifications in, queue keys out.

use std::sync::Arc;

use kube::Resource;
use meridian_core::{KeyDerivationError, ObjectKey};
use meridian_queue::WorkQueue;
use metrics::counter;
use tracing::{error, trace};

/// Turns add/update/delete notifications into plain (not rate-limited) adds.
/// Never blocks: the only side effect is the enqueue.
#[derive(Clone)]
pub struct EventBridge {
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl EventBridge {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>) -> Self { Self { queue } }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> { &self.queue }

    pub fn on_add<K: Resource>(&self, obj: &K) { self.enqueue(obj).ok(); }

    pub fn on_update<K: Resource>(&self, _old: &K, new: &K) { self.enqueue(new).ok(); }

    pub fn on_delete<K: Resource>(&self, obj: &K) { self.enqueue(obj).ok(); }

    /// Enqueue the object's key. Objects without identity are logged and dropped;
    /// retrying cannot fix them.
    pub fn enqueue<K: Resource>(&self, obj: &K) -> Result<ObjectKey, KeyDerivationError> {
        match ObjectKey::for_object(obj) {
            Ok(key) => {
                trace!(queue = self.queue.name(), key = %key, "enqueue");
                self.queue.add(key.clone());
                Ok(key)
            }
            Err(e) => {
                counter!("controller_key_errors_total", 1u64, "queue" => self.queue.name());
                error!(queue = self.queue.name(), error = %e, namespace = ?obj.meta().namespace, "cannot derive key; dropping event");
                Err(e)
            }
        }
    }
}
