//! Meridian core types: object keys, deltas and the reconcilable resource trait.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use kube::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Label whose non-empty value marks a resource as derived from a root.
pub const DEFAULT_OWNED_BY_LABEL: &str = "meridian.dev/owned-by";

/// Stable identity of a cached object: `namespace/name`, or `name` when cluster-scoped.
///
/// Keys are the only payload carried through work queues; the object itself is
/// always re-read from the local cache when the key is processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyDerivationError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("malformed key {0:?} (expect name or namespace/name)")]
    Malformed(String),
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Result<Self, KeyDerivationError> {
        if name.is_empty() {
            return Err(KeyDerivationError::MissingName);
        }
        match namespace {
            Some(ns) if !ns.is_empty() => Ok(Self(format!("{}/{}", ns, name))),
            _ => Ok(Self(name.to_string())),
        }
    }

    /// Derive the key from an object's metadata.
    pub fn for_object<K: Resource>(obj: &K) -> Result<Self, KeyDerivationError> {
        let meta = obj.meta();
        let name = meta.name.as_deref().ok_or(KeyDerivationError::MissingName)?;
        Self::new(meta.namespace.as_deref(), name)
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Split back into `(namespace, name)`.
    pub fn split(&self) -> Result<(Option<&str>, &str), KeyDerivationError> {
        let parts: Vec<&str> = self.0.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok((None, *name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(*ns), *name)),
            _ => Err(KeyDerivationError::Malformed(self.0.clone())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for ObjectKey {
    fn from(s: String) -> Self { Self(s) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A single cache change, keyed by the object's derived key.
#[derive(Debug, Clone)]
pub struct Delta<T> {
    pub key: ObjectKey,
    pub kind: DeltaKind,
    pub obj: T,
}

impl<T: Resource> Delta<T> {
    pub fn applied(obj: T) -> Result<Self, KeyDerivationError> {
        Ok(Self { key: ObjectKey::for_object(&obj)?, kind: DeltaKind::Applied, obj })
    }

    pub fn deleted(obj: T) -> Result<Self, KeyDerivationError> {
        Ok(Self { key: ObjectKey::for_object(&obj)?, kind: DeltaKind::Deleted, obj })
    }
}

/// Value of the ownership label, if set and non-empty.
pub fn owner_of<'a, K: Resource>(obj: &'a K, label: &str) -> Option<&'a str> {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(label))
        .map(|v| v.as_str())
        .filter(|v| !v.is_empty())
}

/// Roots carry no ownership label (or an empty one); everything else is derived.
pub fn is_root<K: Resource>(obj: &K, label: &str) -> bool {
    owner_of(obj, label).is_none()
}

/// Drop nulls and empty maps/arrays from object fields, recursively.
///
/// Kubernetes treats an absent field and an empty collection alike, so
/// `labels: None` and `labels: Some({})` describe the same object.
fn prune_empty(v: Json) -> Json {
    match v {
        Json::Object(map) => Json::Object(
            map.into_iter()
                .map(|(k, v)| (k, prune_empty(v)))
                .filter(|(_, v)| !is_empty_value(v))
                .collect(),
        ),
        Json::Array(items) => Json::Array(items.into_iter().map(prune_empty).collect()),
        other => other,
    }
}

fn is_empty_value(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::Object(m) => m.is_empty(),
        Json::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Equality as the API server sees it: nil and empty collections compare equal.
/// Falls back to `PartialEq` if either side does not serialize.
pub fn semantic_eq<T: Serialize + PartialEq>(a: &T, b: &T) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => {
            let (a, b) = (prune_empty(a), prune_empty(b));
            a == b || (is_empty_value(&a) && is_empty_value(&b))
        }
        _ => a == b,
    }
}

/// A resource with a controller-owned status portion.
pub trait Reconcilable: Resource + Clone + PartialEq + Serialize + fmt::Debug + Send + Sync + 'static {
    type Status: PartialEq + Clone + Serialize + fmt::Debug + Send + Sync;

    fn status(&self) -> Option<&Self::Status>;
    fn status_mut(&mut self) -> &mut Option<Self::Status>;

    /// Semantic comparison of everything except status (spec, metadata, ...).
    fn differs_outside_status(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        *a.status_mut() = None;
        *b.status_mut() = None;
        !semantic_eq(&a, &b)
    }

    fn status_differs(&self, other: &Self) -> bool { !semantic_eq(&self.status(), &other.status()) }
}

impl Reconcilable for Deployment {
    type Status = DeploymentStatus;

    fn status(&self) -> Option<&DeploymentStatus> { self.status.as_ref() }
    fn status_mut(&mut self) -> &mut Option<DeploymentStatus> { &mut self.status }
}
