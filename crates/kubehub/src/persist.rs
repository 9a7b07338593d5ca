use std::marker::PhantomData;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    Client, Resource,
};
use meridian_controller::Persistence;
use meridian_core::Reconcilable;
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value as Json};
use tracing::debug;

const FIELD_MANAGER: &str = "meridian";

/// Writes reconciled objects back through the API server.
///
/// Both calls carry the cached `resourceVersion`, so a write based on a stale
/// snapshot fails with 409 and is retried by the worker.
pub struct KubePersistence<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubePersistence<K> {
    pub fn new(client: Client) -> Self { Self { client, _kind: PhantomData } }
}

/// Merge patch for the status subresource, pinned to the object's resourceVersion.
pub fn status_patch<K>(obj: &K) -> Result<Json>
where
    K: Reconcilable,
    K::Status: Serialize,
{
    let status = serde_json::to_value(obj.status()).context("serializing status")?;
    Ok(json!({
        "metadata": { "resourceVersion": obj.meta().resource_version },
        "status": status,
    }))
}

fn target<K: Resource>(obj: &K) -> Result<(&str, &str)> {
    let meta = obj.meta();
    let ns = meta.namespace.as_deref().ok_or_else(|| anyhow!("object missing metadata.namespace"))?;
    let name = meta.name.as_deref().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    Ok((ns, name))
}

fn record_failure(e: &kube::Error) {
    if let kube::Error::Api(resp) = e {
        if resp.code == 409 {
            counter!("persist_conflicts_total", 1u64);
        }
    }
    counter!("persist_errors_total", 1u64);
}

impl<K> KubePersistence<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    fn api(&self, ns: &str) -> Api<K> { Api::namespaced(self.client.clone(), ns) }
}

#[async_trait]
impl<K> Persistence<K> for KubePersistence<K>
where
    K: Reconcilable + Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned,
    K::DynamicType: Default,
    K::Status: Serialize,
{
    async fn update(&self, obj: &K) -> Result<()> {
        let (ns, name) = target(obj)?;
        let t0 = Instant::now();
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        self.api(ns)
            .replace(name, &pp, obj)
            .await
            .map_err(|e| {
                record_failure(&e);
                e
            })
            .with_context(|| format!("replacing {}/{}", ns, name))?;
        histogram!("persist_update_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(ns, name, "replaced");
        Ok(())
    }

    async fn update_status(&self, obj: &K) -> Result<()> {
        let (ns, name) = target(obj)?;
        let t0 = Instant::now();
        let patch = status_patch(obj)?;
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        self.api(ns)
            .patch_status(name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                record_failure(&e);
                e
            })
            .with_context(|| format!("patching status of {}/{}", ns, name))?;
        histogram!("persist_update_status_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(ns, name, "status patched");
        Ok(())
    }
}
