//! The Deployment a Memcached is realised as.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use tender_core::{labels_for, Memcached, ObjectKey};

use crate::error::ReconcileError;

pub const IMAGE: &str = "memcached:1.4.36-alpine";
pub const PORT: i32 = 11211;

/// Replica count the Deployment should run for this Memcached.
pub fn desired_replicas(key: &ObjectKey, memcached: &Memcached) -> Result<i32, ReconcileError> {
    i32::try_from(memcached.spec.size).map_err(|_| ReconcileError::InvalidSpec {
        key: key.clone(),
        reason: format!("size {} exceeds {}", memcached.spec.size, i32::MAX),
    })
}

/// Build the Deployment for a Memcached. Same name and namespace, selector labels derived
/// from the name, and a controller owner reference back to the Memcached.
pub fn build_workload(memcached: &Memcached) -> Result<Deployment, ReconcileError> {
    let key = ObjectKey::of(memcached).ok_or_else(|| ReconcileError::InvalidSpec {
        key: ObjectKey::new(memcached.namespace().unwrap_or_default(), memcached.name_any()),
        reason: "missing namespace or name".into(),
    })?;
    let replicas = desired_replicas(&key, memcached)?;
    let owner = memcached.controller_owner_ref(&()).ok_or_else(|| ReconcileError::InvalidSpec {
        key: key.clone(),
        reason: "missing uid; cannot set owner reference".into(),
    })?;
    let labels = labels_for(&key.name);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "memcached".into(),
                        image: Some(IMAGE.into()),
                        command: Some(["memcached", "-m=64", "-o", "modern", "-v"].iter().map(|s| s.to_string()).collect()),
                        ports: Some(vec![ContainerPort {
                            container_port: PORT,
                            name: Some("memcached".into()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Replicas as the API server sees them (unset defaults to 1).
pub fn replicas_of(deployment: &Deployment) -> i32 {
    deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// Selector labels of a Deployment; an empty selector counts as none.
pub fn selector_of(deployment: &Deployment) -> Option<BTreeMap<String, String>> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.clone())
        .filter(|m| !m.is_empty())
}

/// Check that the Deployment is controlled by this very Memcached (matching uid).
pub fn ensure_controlled(key: &ObjectKey, memcached: &Memcached, deployment: &Deployment) -> Result<(), ReconcileError> {
    let uid = memcached.uid();
    let controller = deployment.owner_references().iter().find(|r| r.controller == Some(true));
    match controller {
        Some(r) if uid.as_deref() == Some(r.uid.as_str()) => Ok(()),
        Some(r) => Err(ReconcileError::ForeignOwner { key: key.clone(), owner: format!("{}/{} ({})", r.kind, r.name, r.uid) }),
        None => Err(ReconcileError::ForeignOwner { key: key.clone(), owner: "no controller".into() }),
    }
}
