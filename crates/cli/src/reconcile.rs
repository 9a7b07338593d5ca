//! Demo convergence function wired in by the host.

use anyhow::{bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use meridian_controller::{CancellationToken, Reconcile};
use meridian_core::is_root;

/// Records `metadata.generation` as `status.observedGeneration` on root Deployments.
pub struct ObservedGeneration {
    owned_by_label: String,
}

impl ObservedGeneration {
    pub fn new(owned_by_label: impl Into<String>) -> Self { Self { owned_by_label: owned_by_label.into() } }
}

#[async_trait]
impl Reconcile<Deployment> for ObservedGeneration {
    async fn reconcile(&self, cancel: &CancellationToken, d: &mut Deployment) -> Result<()> {
        if cancel.is_cancelled() {
            bail!("shutting down");
        }
        if !is_root(d, &self.owned_by_label) {
            return Ok(());
        }
        let Some(generation) = d.metadata.generation else {
            return Ok(());
        };
        d.status.get_or_insert_with(Default::default).observed_generation = Some(generation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use meridian_core::DEFAULT_OWNED_BY_LABEL;
    use std::collections::BTreeMap;

    fn deploy(generation: Option<i64>, owner: Option<&str>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("ns".into()),
                generation,
                labels: owner.map(|o| BTreeMap::from([(DEFAULT_OWNED_BY_LABEL.to_string(), o.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn root_gets_observed_generation() {
        let r = ObservedGeneration::new(DEFAULT_OWNED_BY_LABEL);
        let mut d = deploy(Some(4), None);
        r.reconcile(&CancellationToken::new(), &mut d).await.unwrap();
        assert_eq!(d.status.unwrap().observed_generation, Some(4));
    }

    #[tokio::test]
    async fn derived_and_generationless_objects_are_untouched() {
        let r = ObservedGeneration::new(DEFAULT_OWNED_BY_LABEL);
        let mut derived = deploy(Some(4), Some("web"));
        r.reconcile(&CancellationToken::new(), &mut derived).await.unwrap();
        assert!(derived.status.is_none());

        let mut fresh = deploy(None, None);
        r.reconcile(&CancellationToken::new(), &mut fresh).await.unwrap();
        assert!(fresh.status.is_none());
    }

    #[tokio::test]
    async fn cancelled_pass_fails() {
        let r = ObservedGeneration::new(DEFAULT_OWNED_BY_LABEL);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut d = deploy(Some(1), None);
        assert!(r.reconcile(&cancel, &mut d).await.is_err());
        assert!(d.status.is_none());
    }
}
