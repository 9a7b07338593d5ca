use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Resource,
};
use meridian_controller::EventBridge;
use meridian_core::{Delta, ObjectKey};
use meridian_store::LocalCache;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

fn strip_managed_fields<K: Resource>(obj: &mut K) {
    obj.meta_mut().managed_fields = None;
}

/// Fold one watch event into the cache, then notify the bridge.
///
/// The cache is written first so a handler reading the key always sees the
/// state that triggered it.
pub fn apply_event<K>(ev: Event<K>, cache: &LocalCache<K>, bridge: &EventBridge)
where
    K: Resource + Clone,
{
    match ev {
        Event::Applied(mut o) => {
            strip_managed_fields(&mut o);
            match Delta::applied(o.clone()) {
                Ok(d) => match cache.apply(d) {
                    Some(prev) => bridge.on_update(prev.as_ref(), &o),
                    None => bridge.on_add(&o),
                },
                Err(e) => warn!(cache = cache.name(), error = %e, "skipping object without identity"),
            }
        }
        Event::Deleted(o) => match Delta::deleted(o.clone()) {
            Ok(d) => {
                cache.apply(d);
                bridge.on_delete(&o);
            }
            Err(e) => warn!(cache = cache.name(), error = %e, "skipping object without identity"),
        },
        Event::Restarted(list) => {
            debug!(cache = cache.name(), count = list.len(), "watch restart");
            let mut items = Vec::with_capacity(list.len());
            for mut o in list {
                strip_managed_fields(&mut o);
                match ObjectKey::for_object(&o) {
                    Ok(key) => items.push((key, o)),
                    Err(e) => warn!(cache = cache.name(), error = %e, "skipping object without identity"),
                }
            }
            let removed = cache.replace(items);
            for (_, o) in removed {
                bridge.on_delete(o.as_ref());
            }
            for (_, o) in cache.current().iter() {
                bridge.on_add(o.as_ref());
            }
        }
    }
}

/// List+watch `api` forever, keeping `cache` current and feeding `bridge`.
/// Watch errors are logged and retried with backoff.
pub async fn reflect<K>(api: Api<K>, cache: Arc<LocalCache<K>>, bridge: EventBridge) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(cache = cache.name(), "watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(ev) => apply_event(ev, &cache, &bridge),
            Err(e) => warn!(cache = cache.name(), error = %e, "watch error; backing off"),
        }
    }
    warn!(cache = cache.name(), "watcher stream ended");
    Ok(())
}
