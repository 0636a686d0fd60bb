//! Tender kubehub: typed object store access and watch wiring.
//!
//! [`ObjectStore`] is the narrow contract the reconciler consumes. [`KubeStore`]
//! serves it from a live cluster, [`MemStore`] from memory for tests and demos.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use tender_core::{Memcached, ObjectKey};

mod client;
pub mod mem;
mod watch;

pub use client::{kube_client, KubeStore};
pub use mem::{MemStore, StoreOp, WriteCounts};
pub use watch::watch_resources;

/// Failures reported by an object store. Not-found on reads is `Ok(None)`, not an error.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Whether retrying the same call later can succeed without anyone changing the object.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Invalid(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
                (404, _) => StoreError::NotFound(resp.message),
                (409, "AlreadyExists") => StoreError::AlreadyExists(resp.message),
                (409, _) => StoreError::Conflict(resp.message),
                (400, _) | (422, _) => StoreError::Invalid(resp.message),
                _ => StoreError::Unavailable(format!("{} ({})", resp.message, resp.code)),
            },
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Count a write in `store_writes{op}` if it went through. Returns whether it was counted.
pub(crate) fn record_write<T>(op: &'static str, res: &StoreResult<T>) -> bool {
    if res.is_err() {
        return false;
    }
    metrics::counter!("store_writes", 1u64, "op" => op);
    true
}

/// Typed reads and optimistic-concurrency writes against the cluster state.
///
/// Every write carries the `resourceVersion` last observed on the object and
/// fails with [`StoreError::Conflict`] if the stored object has moved on.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_memcached(&self, key: &ObjectKey) -> StoreResult<Option<Memcached>>;

    async fn get_deployment(&self, key: &ObjectKey) -> StoreResult<Option<Deployment>>;

    /// Pods in `namespace` carrying every label in `selector`.
    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> StoreResult<Vec<Pod>>;

    async fn create_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment>;

    async fn update_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment>;

    /// Write the status subresource only; the spec is left untouched.
    async fn update_memcached_status(&self, memcached: &Memcached) -> StoreResult<Memcached>;
}
