#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use meridian_controller::{CancellationToken, Persistence, Reconcile};
use meridian_core::{Delta, DEFAULT_OWNED_BY_LABEL};
use meridian_store::{Cache, LocalCache};

pub fn deploy(ns: &str, name: &str, replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec { replicas: Some(replicas), ..Default::default() }),
        status: Some(DeploymentStatus { replicas: Some(replicas), ..Default::default() }),
    }
}

pub fn derived(ns: &str, name: &str, owner: &str) -> Deployment {
    let mut d = deploy(ns, name, 1);
    d.metadata.labels = Some(BTreeMap::from([(DEFAULT_OWNED_BY_LABEL.to_string(), owner.to_string())]));
    d
}

pub fn cache_with(items: Vec<Deployment>) -> Arc<LocalCache<Deployment>> {
    let cache = Arc::new(LocalCache::new("deployments"));
    for d in items {
        cache.apply(Delta::applied(d).unwrap());
    }
    cache
}

pub fn as_cache(c: &Arc<LocalCache<Deployment>>) -> Arc<dyn Cache<Deployment>> {
    Arc::clone(c) as Arc<dyn Cache<Deployment>>
}

/// Records every write; optionally fails them.
#[derive(Default)]
pub struct RecordingPersistence {
    pub updates: Mutex<Vec<Deployment>>,
    pub status_updates: Mutex<Vec<Deployment>>,
    pub fail_with: Option<&'static str>,
}

impl RecordingPersistence {
    pub fn failing(msg: &'static str) -> Self { Self { fail_with: Some(msg), ..Default::default() } }
    pub fn updates(&self) -> Vec<Deployment> { self.updates.lock().unwrap().clone() }
    pub fn status_updates(&self) -> Vec<Deployment> { self.status_updates.lock().unwrap().clone() }
}

#[async_trait]
impl Persistence<Deployment> for RecordingPersistence {
    async fn update(&self, obj: &Deployment) -> anyhow::Result<()> {
        self.updates.lock().unwrap().push(obj.clone());
        match self.fail_with {
            Some(msg) => Err(anyhow::anyhow!(msg)),
            None => Ok(()),
        }
    }

    async fn update_status(&self, obj: &Deployment) -> anyhow::Result<()> {
        self.status_updates.lock().unwrap().push(obj.clone());
        match self.fail_with {
            Some(msg) => Err(anyhow::anyhow!(msg)),
            None => Ok(()),
        }
    }
}

/// Reconcile function built from a closure, counting invocations.
pub struct FnReconcile<F> {
    f: F,
    pub calls: AtomicUsize,
}

impl<F> FnReconcile<F>
where
    F: Fn(&mut Deployment) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self { Self { f, calls: AtomicUsize::new(0) } }
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl<F> Reconcile<Deployment> for FnReconcile<F>
where
    F: Fn(&mut Deployment) -> anyhow::Result<()> + Send + Sync,
{
    async fn reconcile(&self, _cancel: &CancellationToken, obj: &mut Deployment) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.f)(obj)
    }
}

pub fn noop() -> FnReconcile<impl Fn(&mut Deployment) -> anyhow::Result<()> + Send + Sync> {
    FnReconcile::new(|_d: &mut Deployment| Ok(()))
}

/// Sets `status.replicas` to the given value.
pub fn set_status_replicas(n: i32) -> FnReconcile<impl Fn(&mut Deployment) -> anyhow::Result<()> + Send + Sync> {
    FnReconcile::new(move |d: &mut Deployment| {
        d.status.get_or_insert_with(Default::default).replicas = Some(n);
        Ok(())
    })
}
