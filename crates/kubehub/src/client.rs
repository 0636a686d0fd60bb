use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use metrics::histogram;
use tender_core::{selector_string, Memcached, ObjectKey};
use tracing::debug;

use crate::{record_write, ObjectStore, StoreError, StoreResult};

/// Build a client from the ambient kubeconfig or in-cluster environment.
pub async fn kube_client() -> Result<Client> {
    Client::try_default().await.context("creating kube client")
}

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    call_timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, call_timeout: Duration) -> Self {
        Self { client, call_timeout }
    }

    /// Bound a single API call by the per-call timeout and record its latency.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        let started = Instant::now();
        let res = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(r) => r.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.call_timeout)),
        };
        histogram!("store_call_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        if let Err(e) = &res {
            debug!(op, error = %e, "store call failed");
        }
        res
    }
}

fn target(meta: &ObjectMeta) -> StoreResult<(String, String)> {
    let ns = meta.namespace.clone().ok_or_else(|| StoreError::Invalid("object missing metadata.namespace".into()))?;
    let name = meta.name.clone().ok_or_else(|| StoreError::Invalid("object missing metadata.name".into()))?;
    Ok((ns, name))
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get_memcached(&self, key: &ObjectKey) -> StoreResult<Option<Memcached>> {
        let api: Api<Memcached> = Api::namespaced(self.client.clone(), &key.namespace);
        self.call("get_memcached", api.get_opt(&key.name)).await
    }

    async fn get_deployment(&self, key: &ObjectKey) -> StoreResult<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        self.call("get_deployment", api.get_opt(&key.name)).await
    }

    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> StoreResult<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&selector_string(selector));
        let list = self.call("list_pods", api.list(&lp)).await?;
        Ok(list.items)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        let (ns, _) = target(&deployment.metadata)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &ns);
        let written = self.call("create_deployment", api.create(&PostParams::default(), deployment)).await;
        record_write("create_deployment", &written);
        written
    }

    async fn update_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        let (ns, name) = target(&deployment.metadata)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &ns);
        let written = self.call("update_deployment", api.replace(&name, &PostParams::default(), deployment)).await;
        record_write("update_deployment", &written);
        written
    }

    async fn update_memcached_status(&self, memcached: &Memcached) -> StoreResult<Memcached> {
        let (ns, name) = target(&memcached.metadata)?;
        let api: Api<Memcached> = Api::namespaced(self.client.clone(), &ns);
        let body = serde_json::to_vec(memcached).map_err(|e| StoreError::Invalid(format!("serializing status: {}", e)))?;
        let written = self.call("update_status", api.replace_status(&name, &PostParams::default(), body)).await;
        record_write("update_status", &written);
        written
    }
}
