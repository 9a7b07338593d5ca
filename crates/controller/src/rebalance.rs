//! Topology-queue handler: any site change re-enqueues every root resource.

use std::sync::Arc;

use async_trait::async_trait;
use kube::Resource;
use meridian_core::{is_root, ObjectKey};
use meridian_store::Cache;
use tracing::info;

use crate::bridge::EventBridge;
use crate::error::{Error, Result};
use crate::worker::Handler;

pub struct RebalanceDriver<T> {
    cache: Arc<dyn Cache<T>>,
    primary: EventBridge,
    owned_by_label: String,
}

impl<T> RebalanceDriver<T>
where
    T: Resource + Send + Sync + 'static,
{
    pub fn new(cache: Arc<dyn Cache<T>>, primary: EventBridge, owned_by_label: impl Into<String>) -> Self {
        Self { cache, primary, owned_by_label: owned_by_label.into() }
    }

    /// Enqueue every root onto the primary queue. Returns how many were enqueued.
    /// A failed listing enqueues nothing.
    pub fn rebalance(&self) -> Result<usize> {
        let all = self.cache.list().map_err(Error::List)?;
        let enqueued = all
            .iter()
            .map(Arc::as_ref)
            .filter(|obj| is_root(*obj, &self.owned_by_label))
            .filter(|obj| self.primary.enqueue(*obj).is_ok())
            .count();
        Ok(enqueued)
    }
}

#[async_trait]
impl<T> Handler for RebalanceDriver<T>
where
    T: Resource + Send + Sync + 'static,
{
    // The site key only signals that something changed.
    async fn handle(&self, site: &ObjectKey) -> Result<()> {
        let roots = self.rebalance()?;
        info!(site = %site, roots, "topology changed; rebalancing roots");
        Ok(())
    }
}
