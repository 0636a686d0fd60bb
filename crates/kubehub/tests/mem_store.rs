#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use tender_core::{labels_for, EventOp, MemcachedStatus, ObjectKey, ResourceKind, WatchEvent};
use tender_kubehub::{MemStore, ObjectStore, StoreError, StoreOp};

fn key(name: &str) -> ObjectKey { ObjectKey::new("default", name) }

fn deployment(name: &str, replicas: i32, owner_uid: Option<&str>) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            owner_references: owner_uid.map(|uid| {
                vec![OwnerReference {
                    api_version: "cache.tender.dev/v1alpha1".into(),
                    kind: "Memcached".into(),
                    name: name.to_string(),
                    uid: uid.to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        },
        spec: Some(DeploymentSpec { replicas: Some(replicas), ..Default::default() }),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_twice_reports_already_exists() {
    let store = MemStore::new();
    let created = store.create_deployment(&deployment("cache", 3, None)).await.expect("create");
    assert!(created.metadata.uid.is_some());
    assert!(created.metadata.resource_version.is_some());
    let err = store.create_deployment(&deployment("cache", 3, None)).await.expect_err("duplicate");
    assert!(matches!(err, StoreError::AlreadyExists(_)));
    assert_eq!(store.writes().creates, 1);
}

#[tokio::test]
async fn stale_resource_version_is_a_conflict() {
    let store = MemStore::new();
    let created = store.create_deployment(&deployment("cache", 3, None)).await.expect("create");

    // Someone else writes in between
    store.mutate_deployment(&key("cache"), |d| d.spec.get_or_insert_with(Default::default).replicas = Some(7)).expect("exists");

    let mut stale = created.clone();
    stale.spec.get_or_insert_with(Default::default).replicas = Some(5);
    let err = store.update_deployment(&stale).await.expect_err("stale write");
    assert!(matches!(err, StoreError::Conflict(_)));

    let fresh = store.get_deployment(&key("cache")).await.expect("get").expect("exists");
    let mut next = fresh.clone();
    next.spec.get_or_insert_with(Default::default).replicas = Some(5);
    let updated = store.update_deployment(&next).await.expect("fresh write");
    assert_eq!(updated.spec.and_then(|s| s.replicas), Some(5));
    assert_eq!(updated.metadata.uid, created.metadata.uid);
    assert_ne!(updated.metadata.resource_version, fresh.metadata.resource_version);
}

#[tokio::test]
async fn status_write_leaves_spec_alone() {
    let store = MemStore::new();
    let m = store.apply_memcached(&key("cache"), 3);
    let mut with_status = m.clone();
    with_status.spec.size = 99;
    with_status.status = Some(MemcachedStatus { nodes: vec!["cache-0".into()] });
    let updated = store.update_memcached_status(&with_status).await.expect("status");
    assert_eq!(updated.spec.size, 3);
    assert_eq!(updated.status.map(|s| s.nodes), Some(vec!["cache-0".to_string()]));

    // Original version is now stale
    let err = store.update_memcached_status(&with_status).await.expect_err("stale");
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn deleting_owner_cascades_to_owned_deployments() {
    let store = MemStore::new();
    let m = store.apply_memcached(&key("cache"), 1);
    let uid = m.meta().uid.clone().expect("uid");
    store.put_deployment(deployment("cache", 1, Some(&uid))).expect("put");
    store.put_deployment(deployment("unrelated", 1, None)).expect("put");

    let mut rx = store.subscribe(16);
    store.delete_memcached(&key("cache")).expect("deleted");
    assert!(store.deployment(&key("cache")).is_none());
    assert!(store.deployment(&key("unrelated")).is_some());

    let Some(WatchEvent::Changed(first)) = rx.recv().await else { panic!("expected memcached change") };
    assert_eq!((first.kind, first.op), (ResourceKind::Memcached, EventOp::Deleted));
    let Some(WatchEvent::Changed(second)) = rx.recv().await else { panic!("expected deployment change") };
    assert_eq!((second.kind, second.op, second.key), (ResourceKind::Deployment, EventOp::Deleted, key("cache")));
}

#[tokio::test]
async fn list_pods_filters_by_namespace_and_selector() {
    let store = MemStore::new();
    store.put_pod(&key("cache-a"), labels_for("cache"));
    store.put_pod(&key("other-a"), labels_for("other"));
    store.put_pod(&ObjectKey::new("prod", "cache-b"), labels_for("cache"));
    let pods = store.list_pods("default", &labels_for("cache")).await.expect("list");
    let names: Vec<_> = pods.iter().filter_map(|p| p.metadata.name.clone()).collect();
    assert_eq!(names, vec!["cache-a".to_string()]);
}

#[tokio::test]
async fn injected_faults_fire_once_in_order() {
    let store = MemStore::new();
    store.inject(StoreOp::GetMemcached, StoreError::Unavailable("down".into()));
    assert!(store.get_memcached(&key("cache")).await.is_err());
    assert!(matches!(store.get_memcached(&key("cache")).await, Ok(None)));
}

#[tokio::test]
async fn run_replicas_tracks_deployment_size() {
    let store = MemStore::new();
    let mut d = deployment("cache", 3, None);
    if let Some(spec) = d.spec.as_mut() {
        spec.template.metadata = Some(ObjectMeta { labels: Some(labels_for("cache")), ..Default::default() });
    }
    store.put_deployment(d).expect("put");
    assert_eq!(store.run_replicas(&key("cache")), 3);
    assert_eq!(store.list_pods("default", &labels_for("cache")).await.expect("list").len(), 3);

    store.mutate_deployment(&key("cache"), |d| d.spec.get_or_insert_with(Default::default).replicas = Some(1));
    assert_eq!(store.run_replicas(&key("cache")), 1);
    assert_eq!(store.list_pods("default", &labels_for("cache")).await.expect("list").len(), 1);
}

#[tokio::test]
async fn relist_replays_survivors_then_names_them() {
    let store = MemStore::new();
    store.put_deployment(deployment("cache", 1, None)).expect("put");
    store.put_deployment(deployment("gone", 1, None)).expect("put");
    let mut rx = store.subscribe(16);

    assert!(store.drop_deployment_unobserved(&key("gone")).is_some());
    store.relist_deployments();

    let Some(WatchEvent::Changed(applied)) = rx.recv().await else { panic!("expected replayed change") };
    assert_eq!((applied.op, applied.key), (EventOp::Applied, key("cache")));
    let Some(WatchEvent::Relisted { kind, namespace, present }) = rx.recv().await else { panic!("expected relist") };
    assert_eq!(kind, ResourceKind::Deployment);
    assert_eq!(namespace, None);
    assert_eq!(present, vec![key("cache")]);
    assert!(rx.try_recv().is_err());
}
