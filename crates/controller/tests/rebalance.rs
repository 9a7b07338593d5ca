mod common;

use std::sync::Arc;

use common::*;
use k8s_openapi::api::apps::v1::Deployment;
use meridian_controller::{EventBridge, Error, Handler, RebalanceDriver};
use meridian_core::{ObjectKey, DEFAULT_OWNED_BY_LABEL};
use meridian_queue::WorkQueue;
use meridian_store::Cache;

fn primary() -> Arc<WorkQueue<ObjectKey>> { Arc::new(WorkQueue::new("primary")) }

async fn drain(q: &WorkQueue<ObjectKey>) -> Vec<String> {
    let mut out = Vec::new();
    while !q.is_empty() {
        let k = q.get().await.unwrap();
        out.push(k.to_string());
        q.done(&k);
    }
    out.sort();
    out
}

#[tokio::test]
async fn site_change_enqueues_only_roots() {
    let cache = cache_with(vec![deploy("ns", "a", 1), deploy("other", "b", 1), derived("ns", "c", "a")]);
    let q = primary();
    let driver = RebalanceDriver::new(as_cache(&cache), EventBridge::new(Arc::clone(&q)), DEFAULT_OWNED_BY_LABEL);

    driver.handle(&ObjectKey::from("site-east")).await.unwrap();
    assert_eq!(drain(&q).await, vec!["ns/a", "other/b"]);
}

#[tokio::test]
async fn empty_cache_enqueues_nothing() {
    let cache = cache_with(vec![]);
    let q = primary();
    let driver = RebalanceDriver::new(as_cache(&cache), EventBridge::new(Arc::clone(&q)), DEFAULT_OWNED_BY_LABEL);
    assert_eq!(driver.rebalance().unwrap(), 0);
    assert!(q.is_empty());
}

#[tokio::test]
async fn counts_roots_and_ignores_many_derived() {
    let mut items = vec![deploy("ns", "r1", 1), deploy("ns", "r2", 1), deploy("ns", "r3", 1)];
    for i in 0..10 {
        items.push(derived("ns", &format!("r1--site-{i}"), "r1"));
    }
    let cache = cache_with(items);
    let q = primary();
    let driver = RebalanceDriver::new(as_cache(&cache), EventBridge::new(Arc::clone(&q)), DEFAULT_OWNED_BY_LABEL);
    assert_eq!(driver.rebalance().unwrap(), 3);
    assert_eq!(q.len(), 3);
}

struct BrokenCache;

impl Cache<Deployment> for BrokenCache {
    fn get_by_key(&self, _key: &ObjectKey) -> anyhow::Result<Option<Arc<Deployment>>> { Ok(None) }

    fn list(&self) -> anyhow::Result<Vec<Arc<Deployment>>> { Err(anyhow::anyhow!("cache not ready")) }
}

#[tokio::test]
async fn listing_failure_is_handler_failure() {
    let q = primary();
    let driver: RebalanceDriver<Deployment> =
        RebalanceDriver::new(Arc::new(BrokenCache), EventBridge::new(Arc::clone(&q)), DEFAULT_OWNED_BY_LABEL);
    let err = driver.handle(&ObjectKey::from("site")).await.unwrap_err();
    assert!(matches!(err, Error::List(_)));
    assert!(q.is_empty());
}
