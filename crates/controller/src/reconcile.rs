//! Convergence of one Memcached toward its desired state.
//!
//! Every pass re-reads the store: ensure the Deployment exists, then fix replica drift,
//! then republish the observed pods. A pass with nothing to fix performs no writes.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use tender_core::{instances_match, labels_for, Memcached, MemcachedStatus, ObjectKey};
use tender_kubehub::{ObjectStore, StoreError};
use tracing::{debug, info};

use crate::error::{Outcome, ReconcileError};
use crate::workload::{build_workload, desired_replicas, ensure_controlled, replicas_of, selector_of};

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    drift_cooldown: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, drift_cooldown: Duration) -> Self {
        Self { store, drift_cooldown }
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Outcome {
        match self.converge(key).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Error(e),
        }
    }

    async fn converge(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let Some(memcached) = self.store.get_memcached(key).await? else {
            // Deleted; the Deployment goes away through its owner reference.
            debug!("memcached not found; nothing to do");
            return Ok(Outcome::Done);
        };

        let Some(deployment) = self.store.get_deployment(key).await? else {
            return self.create_workload(&memcached).await;
        };
        ensure_controlled(key, &memcached, &deployment)?;

        let want = desired_replicas(key, &memcached)?;
        let have = replicas_of(&deployment);
        if have != want {
            let mut next = deployment;
            next.spec.get_or_insert_with(Default::default).replicas = Some(want);
            self.store.update_deployment(&next).await?;
            info!(from = have, to = want, "scaled deployment");
            return Ok(Outcome::RequeueAfter(self.drift_cooldown));
        }

        self.sync_status(key, &memcached, &deployment).await?;
        Ok(Outcome::Done)
    }

    async fn create_workload(&self, memcached: &Memcached) -> Result<Outcome, ReconcileError> {
        let deployment = build_workload(memcached)?;
        match self.store.create_deployment(&deployment).await {
            Ok(_) => info!(replicas = replicas_of(&deployment), "created deployment"),
            Err(StoreError::AlreadyExists(_)) => debug!("deployment already exists"),
            Err(e) => return Err(e.into()),
        }
        Ok(Outcome::RequeueNow)
    }

    async fn sync_status(&self, key: &ObjectKey, memcached: &Memcached, deployment: &Deployment) -> Result<(), ReconcileError> {
        let selector = selector_of(deployment).unwrap_or_else(|| labels_for(&key.name));
        let pods = self.store.list_pods(&key.namespace, &selector).await?;
        let mut nodes: Vec<String> = pods.into_iter().filter_map(|p| p.metadata.name).collect();
        nodes.sort();

        let observed = memcached.status.as_ref().map(|s| s.nodes.as_slice()).unwrap_or_default();
        if instances_match(observed, &nodes) {
            return Ok(());
        }
        let mut next = memcached.clone();
        next.status = Some(MemcachedStatus { nodes });
        self.store.update_memcached_status(&next).await?;
        info!(nodes = ?next.status.as_ref().map(|s| &s.nodes), "updated status");
        Ok(())
    }
}
