use std::fmt::Debug;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tender_core::{EventOp, Memcached, Notification, ObjectKey, ResourceKind, WatchEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// List+watch Memcached and Deployment objects and forward every change as a [`WatchEvent`].
///
/// A watch restart replays its list as `Applied` changes followed by one `Relisted`
/// event naming every object still present. Transient watch failures are retried with kube-runtime's default backoff. Returns
/// when a stream ends or the receiving side is dropped.
pub async fn watch_resources(client: Client, namespace: Option<&str>, tx: mpsc::Sender<WatchEvent>) -> Result<()> {
    let memcached: Api<Memcached> = scoped(client.clone(), namespace);
    let deployments: Api<Deployment> = scoped(client, namespace);
    tokio::try_join!(
        pump(memcached, ResourceKind::Memcached, namespace, tx.clone()),
        pump(deployments, ResourceKind::Deployment, namespace, tx),
    )?;
    Ok(())
}

async fn pump<K>(api: Api<K>, kind: ResourceKind, namespace: Option<&str>, tx: mpsc::Sender<WatchEvent>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, "watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(Event::Applied(o)) => forward(&tx, kind, EventOp::Applied, &o).await?,
            Ok(Event::Deleted(o)) => forward(&tx, kind, EventOp::Deleted, &o).await?,
            Ok(Event::Restarted(list)) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                for o in list.iter() {
                    forward(&tx, kind, EventOp::Applied, o).await?;
                }
                let present = list.iter().filter_map(ObjectKey::of).collect();
                let relisted = WatchEvent::Relisted { kind, namespace: namespace.map(str::to_string), present };
                tx.send(relisted).await.map_err(|_| anyhow!("notification channel closed"))?;
            }
            Err(e) => warn!(kind = %kind, error = %e, "watch error; backing off"),
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}

async fn forward<K: Resource>(tx: &mpsc::Sender<WatchEvent>, kind: ResourceKind, op: EventOp, obj: &K) -> Result<()> {
    match Notification::from_object(kind, op, obj) {
        Some(n) => tx.send(n.into()).await.map_err(|_| anyhow!("notification channel closed")),
        None => {
            debug!(kind = %kind, "skipping object without namespace or name");
            Ok(())
        }
    }
}
