//! Primary-queue handler: load, reconcile, persist the minimal change.

use std::sync::Arc;

use async_trait::async_trait;
use meridian_core::{ObjectKey, Reconcilable};
use meridian_store::Cache;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::worker::Handler;

/// Domain convergence logic. Mutates the object in place; must not persist it.
#[async_trait]
pub trait Reconcile<T>: Send + Sync {
    async fn reconcile(&self, cancel: &CancellationToken, obj: &mut T) -> anyhow::Result<()>;
}

/// Writes back to the API server. Stale writes must fail (conflict) rather than clobber.
#[async_trait]
pub trait Persistence<T>: Send + Sync {
    /// Full object write; carries status along with everything else.
    async fn update(&self, obj: &T) -> anyhow::Result<()>;
    async fn update_status(&self, obj: &T) -> anyhow::Result<()>;
}

/// What a reconcile pass changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    StatusOnly,
    Full,
}

impl Change {
    pub fn between<T: Reconcilable>(previous: &T, current: &T) -> Self {
        if previous.differs_outside_status(current) {
            Change::Full
        } else if previous.status_differs(current) {
            Change::StatusOnly
        } else {
            Change::Unchanged
        }
    }
}

pub struct ReconcileDriver<T> {
    cache: Arc<dyn Cache<T>>,
    reconciler: Arc<dyn Reconcile<T>>,
    persistence: Arc<dyn Persistence<T>>,
    cancel: CancellationToken,
}

impl<T: Reconcilable> ReconcileDriver<T> {
    pub fn new(
        cache: Arc<dyn Cache<T>>,
        reconciler: Arc<dyn Reconcile<T>>,
        persistence: Arc<dyn Persistence<T>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { cache, reconciler, persistence, cancel }
    }

    /// One reconcile pass for `key`; issues at most one persistence call.
    pub async fn process(&self, key: &ObjectKey) -> Result<Change> {
        let previous = match self.cache.get_by_key(key) {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                info!(key = %key, "object was deleted");
                return Ok(Change::Unchanged);
            }
            Err(source) => return Err(Error::Cache { key: key.clone(), source }),
        };

        let mut current = T::clone(&previous);
        self.reconciler
            .reconcile(&self.cancel, &mut current)
            .await
            .map_err(|source| Error::Reconcile { key: key.clone(), source })?;

        let change = Change::between(previous.as_ref(), &current);
        match change {
            Change::Full => {
                self.persistence
                    .update(&current)
                    .await
                    .map_err(|source| Error::Update { key: key.clone(), source })?;
                counter!("reconcile_updates_total", 1u64);
                debug!(key = %key, "object updated");
            }
            Change::StatusOnly => {
                self.persistence
                    .update_status(&current)
                    .await
                    .map_err(|source| Error::UpdateStatus { key: key.clone(), source })?;
                counter!("reconcile_status_updates_total", 1u64);
                debug!(key = %key, "status updated");
            }
            Change::Unchanged => debug!(key = %key, "in sync"),
        }
        Ok(change)
    }
}

#[async_trait]
impl<T: Reconcilable> Handler for ReconcileDriver<T> {
    async fn handle(&self, key: &ObjectKey) -> Result<()> {
        self.process(key).await.map(|_| ())
    }
}
