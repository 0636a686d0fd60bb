//! In-memory [`ObjectStore`] with API-server semantics that matter to the controller:
//! monotonically increasing resource versions, optimistic concurrency, owner-reference
//! cascade on delete and change notifications. Used by tests and `tenderctl` demos.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{Resource, ResourceExt};
use tender_core::{selector_matches, EventOp, Memcached, MemcachedSpec, Notification, ObjectKey, ResourceKind, WatchEvent};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::{ObjectStore, StoreError, StoreResult};

/// Store calls that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    GetMemcached,
    GetDeployment,
    ListPods,
    CreateDeployment,
    UpdateDeployment,
    UpdateStatus,
}

/// Successful writes issued through the [`ObjectStore`] trait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub creates: u64,
    pub updates: u64,
    pub status_updates: u64,
}

impl WriteCounts {
    pub fn total(&self) -> u64 {
        self.creates + self.updates + self.status_updates
    }
}

#[derive(Default)]
struct State {
    rv: u64,
    memcached: BTreeMap<ObjectKey, Memcached>,
    deployments: BTreeMap<ObjectKey, Deployment>,
    pods: BTreeMap<ObjectKey, Pod>,
    faults: VecDeque<(StoreOp, StoreError)>,
    writes: WriteCounts,
}

impl State {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn take_fault(&mut self, op: StoreOp) -> Option<StoreError> {
        let idx = self.faults.iter().position(|(o, _)| *o == op)?;
        self.faults.remove(idx).map(|(_, e)| e)
    }
}

fn check_version(stored: &ObjectMeta, incoming: &ObjectMeta, key: &ObjectKey) -> StoreResult<()> {
    match &incoming.resource_version {
        Some(rv) if Some(rv) != stored.resource_version.as_ref() => {
            Err(StoreError::Conflict(format!("{}: object has been modified (have {}, stored {:?})", key, rv, stored.resource_version)))
        }
        _ => Ok(()),
    }
}

fn stamp(meta: &mut ObjectMeta, rv: String) {
    meta.resource_version = Some(rv);
    if meta.uid.is_none() {
        meta.uid = Some(Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
    }
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
    events: Mutex<Option<mpsc::Sender<WatchEvent>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route change notifications into a fresh channel. Replaces any earlier subscriber.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn emit<K: Resource>(&self, kind: ResourceKind, op: EventOp, obj: &K) {
        if let Some(n) = Notification::from_object(kind, op, obj) {
            self.send(n.into());
        }
    }

    fn send(&self, event: WatchEvent) {
        let guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else { return };
        if tx.try_send(event).is_err() {
            warn!("watch event dropped (subscriber full or gone)");
        }
    }

    /// Fail the next call of `op` with `err`. Faults queue up in order.
    pub fn inject(&self, op: StoreOp, err: StoreError) {
        self.lock().faults.push_back((op, err));
    }

    pub fn writes(&self) -> WriteCounts {
        self.lock().writes
    }

    pub fn memcached(&self, key: &ObjectKey) -> Option<Memcached> {
        self.lock().memcached.get(key).cloned()
    }

    pub fn deployment(&self, key: &ObjectKey) -> Option<Deployment> {
        self.lock().deployments.get(key).cloned()
    }

    /// Create or update a Memcached spec as a user would. Status and identity are preserved.
    pub fn apply_memcached(&self, key: &ObjectKey, size: u32) -> Memcached {
        let obj = {
            let mut st = self.lock();
            let rv = st.next_rv();
            let obj = st.memcached.entry(key.clone()).or_insert_with(|| {
                let mut m = Memcached::new(&key.name, MemcachedSpec::default());
                m.metadata.namespace = Some(key.namespace.clone());
                m
            });
            obj.spec.size = size;
            stamp(&mut obj.metadata, rv);
            obj.clone()
        };
        self.emit(ResourceKind::Memcached, EventOp::Applied, &obj);
        obj
    }

    /// Delete a Memcached and, like the garbage collector, every Deployment it owns.
    pub fn delete_memcached(&self, key: &ObjectKey) -> Option<Memcached> {
        let (removed, cascaded) = {
            let mut st = self.lock();
            let removed = st.memcached.remove(key)?;
            let uid = removed.metadata.uid.clone();
            let owned: Vec<ObjectKey> = st
                .deployments
                .iter()
                .filter(|(_, d)| d.owner_references().iter().any(|o| Some(&o.uid) == uid.as_ref()))
                .map(|(k, _)| k.clone())
                .collect();
            let cascaded: Vec<Deployment> = owned.iter().filter_map(|k| st.deployments.remove(k)).collect();
            (removed, cascaded)
        };
        self.emit(ResourceKind::Memcached, EventOp::Deleted, &removed);
        for d in cascaded.iter() {
            self.emit(ResourceKind::Deployment, EventOp::Deleted, d);
        }
        Some(removed)
    }

    /// Store a Deployment as some other actor would, bypassing version checks.
    pub fn put_deployment(&self, mut deployment: Deployment) -> Option<Deployment> {
        let key = ObjectKey::of(&deployment)?;
        {
            let mut st = self.lock();
            let rv = st.next_rv();
            stamp(&mut deployment.metadata, rv);
            st.deployments.insert(key, deployment.clone());
        }
        self.emit(ResourceKind::Deployment, EventOp::Applied, &deployment);
        Some(deployment)
    }

    /// Mutate a stored Deployment out of band (bumps its resource version).
    pub fn mutate_deployment(&self, key: &ObjectKey, f: impl FnOnce(&mut Deployment)) -> Option<Deployment> {
        let obj = {
            let mut st = self.lock();
            let rv = st.next_rv();
            let d = st.deployments.get_mut(key)?;
            f(d);
            stamp(&mut d.metadata, rv);
            d.clone()
        };
        self.emit(ResourceKind::Deployment, EventOp::Applied, &obj);
        Some(obj)
    }

    /// Remove a Deployment without telling the subscriber, as if it went away while the watch was down.
    pub fn drop_deployment_unobserved(&self, key: &ObjectKey) -> Option<Deployment> {
        self.lock().deployments.remove(key)
    }

    /// Replay every Deployment as a restarted watch would: one `Applied` each, then `Relisted`.
    pub fn relist_deployments(&self) {
        let all: Vec<Deployment> = self.lock().deployments.values().cloned().collect();
        for d in all.iter() {
            self.emit(ResourceKind::Deployment, EventOp::Applied, d);
        }
        let present = all.iter().filter_map(ObjectKey::of).collect();
        self.send(WatchEvent::Relisted { kind: ResourceKind::Deployment, namespace: None, present });
    }

    pub fn put_pod(&self, key: &ObjectKey, labels: BTreeMap<String, String>) {
        let mut st = self.lock();
        let rv = st.next_rv();
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        stamp(&mut pod.metadata, rv);
        st.pods.insert(key.clone(), pod);
    }

    pub fn delete_pod(&self, key: &ObjectKey) -> bool {
        self.lock().pods.remove(key).is_some()
    }

    /// Converge pods to the Deployment's replica count, the way a ReplicaSet would.
    /// Pods are named `<deployment>-<n>` and carry the template labels.
    pub fn run_replicas(&self, key: &ObjectKey) -> usize {
        let Some(d) = self.deployment(key) else { return 0 };
        let spec = d.spec.unwrap_or_default();
        let want = spec.replicas.unwrap_or(1).max(0) as usize;
        let labels = spec.template.metadata.and_then(|m| m.labels).unwrap_or_default();
        let mut st = self.lock();
        let mut mine: Vec<ObjectKey> = st
            .pods
            .iter()
            .filter(|(k, p)| k.namespace == key.namespace && selector_matches(&labels, p.labels()))
            .map(|(k, _)| k.clone())
            .collect();
        mine.sort();
        for extra in mine.iter().skip(want) {
            st.pods.remove(extra);
        }
        let mut n = 0usize;
        while mine.len() < want {
            let pod_key = ObjectKey::new(&key.namespace, format!("{}-{}", key.name, n));
            n += 1;
            if st.pods.contains_key(&pod_key) {
                continue;
            }
            let rv = st.next_rv();
            let mut pod = Pod {
                metadata: ObjectMeta {
                    name: Some(pod_key.name.clone()),
                    namespace: Some(pod_key.namespace.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                ..Default::default()
            };
            stamp(&mut pod.metadata, rv);
            st.pods.insert(pod_key.clone(), pod);
            mine.push(pod_key);
        }
        want
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get_memcached(&self, key: &ObjectKey) -> StoreResult<Option<Memcached>> {
        let mut st = self.lock();
        if let Some(e) = st.take_fault(StoreOp::GetMemcached) {
            return Err(e);
        }
        Ok(st.memcached.get(key).cloned())
    }

    async fn get_deployment(&self, key: &ObjectKey) -> StoreResult<Option<Deployment>> {
        let mut st = self.lock();
        if let Some(e) = st.take_fault(StoreOp::GetDeployment) {
            return Err(e);
        }
        Ok(st.deployments.get(key).cloned())
    }

    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> StoreResult<Vec<Pod>> {
        let mut st = self.lock();
        if let Some(e) = st.take_fault(StoreOp::ListPods) {
            return Err(e);
        }
        Ok(st
            .pods
            .iter()
            .filter(|(k, p)| k.namespace == namespace && selector_matches(selector, p.labels()))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        let key = ObjectKey::of(deployment).ok_or_else(|| StoreError::Invalid("deployment missing namespace or name".into()))?;
        let created = {
            let mut st = self.lock();
            if let Some(e) = st.take_fault(StoreOp::CreateDeployment) {
                return Err(e);
            }
            if st.deployments.contains_key(&key) {
                return Err(StoreError::AlreadyExists(format!("deployments.apps \"{}\" already exists", key.name)));
            }
            let rv = st.next_rv();
            let mut obj = deployment.clone();
            obj.metadata.uid = None;
            stamp(&mut obj.metadata, rv);
            st.deployments.insert(key, obj.clone());
            st.writes.creates += 1;
            obj
        };
        self.emit(ResourceKind::Deployment, EventOp::Applied, &created);
        Ok(created)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        let key = ObjectKey::of(deployment).ok_or_else(|| StoreError::Invalid("deployment missing namespace or name".into()))?;
        let updated = {
            let mut st = self.lock();
            if let Some(e) = st.take_fault(StoreOp::UpdateDeployment) {
                return Err(e);
            }
            let stored = st.deployments.get(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            check_version(&stored.metadata, &deployment.metadata, &key)?;
            let (uid, created) = (stored.metadata.uid.clone(), stored.metadata.creation_timestamp.clone());
            let rv = st.next_rv();
            let mut obj = deployment.clone();
            obj.metadata.uid = uid;
            obj.metadata.creation_timestamp = created;
            stamp(&mut obj.metadata, rv);
            st.deployments.insert(key, obj.clone());
            st.writes.updates += 1;
            obj
        };
        self.emit(ResourceKind::Deployment, EventOp::Applied, &updated);
        Ok(updated)
    }

    async fn update_memcached_status(&self, memcached: &Memcached) -> StoreResult<Memcached> {
        let key = ObjectKey::of(memcached).ok_or_else(|| StoreError::Invalid("memcached missing namespace or name".into()))?;
        let updated = {
            let mut st = self.lock();
            if let Some(e) = st.take_fault(StoreOp::UpdateStatus) {
                return Err(e);
            }
            let stored = st.memcached.get(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            check_version(&stored.metadata, &memcached.metadata, &key)?;
            let rv = st.next_rv();
            let obj = st.memcached.get_mut(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            obj.status = memcached.status.clone();
            stamp(&mut obj.metadata, rv);
            let obj = obj.clone();
            st.writes.status_updates += 1;
            obj
        };
        self.emit(ResourceKind::Memcached, EventOp::Applied, &updated);
        Ok(updated)
    }
}
