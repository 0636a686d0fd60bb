//! Tender core types: reconcile keys, change notifications and the Memcached resource.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// API group of the Memcached resource.
pub const GROUP: &str = "cache.tender.dev";
/// Label selecting every pod the controller manages.
pub const APP_LABEL: (&str, &str) = ("app", "memcached");
/// Label naming the owning Memcached.
pub const OWNER_LABEL: &str = "memcached_cr";

/// Desired state of a Memcached cluster.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[kube(
    group = "cache.tender.dev",
    version = "v1alpha1",
    kind = "Memcached",
    namespaced,
    status = "MemcachedStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
pub struct MemcachedSpec {
    /// Number of memcached instances to run.
    pub size: u32,
}

/// Observed state of a Memcached cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemcachedStatus {
    /// Names of the pods last seen running for this Memcached.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Namespaced identity of a Memcached; the only unit of work scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key: {0} (expect namespace/name)")]
    Malformed(String),
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse `namespace/name`. Both halves must be non-empty.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(Self::new(ns, name)),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }

    /// Key of any namespaced kube object; `None` when name or namespace is missing.
    pub fn of<K: kube::Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Resource kinds the controller watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Memcached,
    Deployment,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Memcached => "Memcached",
            ResourceKind::Deployment => "Deployment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watch operation. A kube watch cannot tell a create from an update, both arrive as `Applied`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventOp {
    Applied,
    Deleted,
}

/// Back-pointer from an owned object to the object that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

impl From<&OwnerReference> for OwnerRef {
    fn from(r: &OwnerReference) -> Self {
        Self {
            api_version: r.api_version.clone(),
            kind: r.kind.clone(),
            name: r.name.clone(),
            uid: r.uid.clone(),
            controller: r.controller.unwrap_or(false),
        }
    }
}

/// A single change notification as delivered by a watch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub kind: ResourceKind,
    pub op: EventOp,
    pub key: ObjectKey,
    pub resource_version: Option<String>,
    /// Owner references carried by the object (empty for Memcached).
    pub owners: Vec<OwnerRef>,
}

impl Notification {
    /// Build a notification from any namespaced kube object. Objects without a namespace or name yield `None`.
    pub fn from_object<K: kube::Resource>(kind: ResourceKind, op: EventOp, obj: &K) -> Option<Self> {
        let key = ObjectKey::of(obj)?;
        let meta = obj.meta();
        let owners = meta.owner_references.as_deref().unwrap_or_default().iter().map(OwnerRef::from).collect();
        Some(Self { kind, op, key, resource_version: meta.resource_version.clone(), owners })
    }
}

/// What a watch hands to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// One object changed.
    Changed(Notification),
    /// The watch relisted `kind` after a restart. `present` holds every object of that kind
    /// that exists in `namespace` (all namespaces when `None`); anything else is gone.
    Relisted { kind: ResourceKind, namespace: Option<String>, present: Vec<ObjectKey> },
}

impl From<Notification> for WatchEvent {
    fn from(n: Notification) -> Self {
        WatchEvent::Changed(n)
    }
}

/// Selector labels for the workload of the named Memcached.
pub fn labels_for(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.0.to_string(), APP_LABEL.1.to_string());
    labels.insert(OWNER_LABEL.to_string(), name.to_string());
    labels
}

/// Render labels as a kube label selector (`k=v,k2=v2`, sorted by key).
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// True when every selector label is present with the same value.
pub fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Order-insensitive comparison of instance identifiers.
pub fn instances_match(observed: &[String], listed: &[String]) -> bool {
    let a: BTreeSet<&str> = observed.iter().map(String::as_str).collect();
    let b: BTreeSet<&str> = listed.iter().map(String::as_str).collect();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_roundtrips_display() {
        let k = ObjectKey::parse("prod/cache").expect("ok");
        assert_eq!(k, ObjectKey::new("prod", "cache"));
        assert_eq!(k.to_string(), "prod/cache");
    }

    #[test]
    fn parse_key_rejects_malformed() {
        assert!(ObjectKey::parse("cache").is_err());
        assert!(ObjectKey::parse("/cache").is_err());
        assert!(ObjectKey::parse("prod/").is_err());
        assert!(ObjectKey::parse("a/b/c").is_err());
    }

    #[test]
    fn labels_are_deterministic() {
        let l = labels_for("cache");
        assert_eq!(selector_string(&l), "app=memcached,memcached_cr=cache");
        assert_eq!(labels_for("cache"), l);
    }

    #[test]
    fn selector_requires_all_pairs() {
        let sel = labels_for("cache");
        let mut labels = sel.clone();
        labels.insert("pod-template-hash".into(), "abc".into());
        assert!(selector_matches(&sel, &labels));
        labels.insert(OWNER_LABEL.into(), "other".into());
        assert!(!selector_matches(&sel, &labels));
    }

    #[test]
    fn instance_comparison_ignores_order() {
        let a = vec!["p1".to_string(), "p2".to_string()];
        let b = vec!["p2".to_string(), "p1".to_string()];
        assert!(instances_match(&a, &b));
        assert!(!instances_match(&a, &["p1".to_string()]));
        assert!(instances_match(&[], &[]));
    }
}
