//! Event watch dispatcher: turns change notifications into reconcile keys.

use std::sync::Arc;

use metrics::counter;
use tender_core::{EventOp, Notification, ObjectKey, ResourceKind, WatchEvent};
use tender_queue::WorkQueue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::ownership::OwnershipIndex;

/// Routes notifications into the work queue. Never waits on reconciliation; adding to the
/// queue only takes its lock.
pub struct Dispatcher {
    index: OwnershipIndex,
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl Dispatcher {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        Self { index: OwnershipIndex::new(), queue }
    }

    pub fn index(&self) -> &OwnershipIndex {
        &self.index
    }

    /// Key to reconcile for a notification, or `None` when it is not ours.
    pub fn route(&mut self, n: &Notification) -> Option<ObjectKey> {
        match (n.kind, n.op) {
            (ResourceKind::Memcached, _) => Some(n.key.clone()),
            (ResourceKind::Deployment, EventOp::Applied) => self.index.observe(n.kind, &n.key, &n.owners),
            (ResourceKind::Deployment, EventOp::Deleted) => {
                let last_known = self.index.forget(n.kind, &n.key);
                OwnershipIndex::owner_from_refs(&n.key.namespace, &n.owners).or(last_known)
            }
        }
    }

    /// Route one notification and enqueue its key. Returns whether a key was enqueued.
    pub fn dispatch(&mut self, n: &Notification) -> bool {
        match self.route(n) {
            Some(key) => {
                trace!(kind = %n.kind, object = %n.key, key = %key, rv = ?n.resource_version, "enqueue");
                self.queue.add(key);
                true
            }
            None => {
                counter!("dispatch_dropped", 1u64);
                debug!(kind = %n.kind, object = %n.key, "dropping event for object without a Memcached owner");
                false
            }
        }
    }

    /// Reconcile the owners of objects that vanished while the watch was down, and stop
    /// tracking those objects. Returns the number of keys enqueued.
    pub fn relisted(&mut self, kind: ResourceKind, namespace: Option<&str>, present: &[ObjectKey]) -> usize {
        let orphaned = self.index.retain_listed(kind, namespace, present);
        if !orphaned.is_empty() {
            debug!(kind = %kind, owners = orphaned.len(), "relist dropped objects; requeueing owners");
        }
        let n = orphaned.len();
        for key in orphaned {
            self.queue.add(key);
        }
        n
    }

    /// Apply one watch event.
    pub fn handle(&mut self, event: &WatchEvent) {
        match event {
            WatchEvent::Changed(n) => {
                self.dispatch(n);
            }
            WatchEvent::Relisted { kind, namespace, present } => {
                self.relisted(*kind, namespace.as_deref(), present);
            }
        }
    }

    /// Drain watch events until the channel closes or `shutdown` fires.
    pub async fn run(mut self, mut rx: mpsc::Receiver<WatchEvent>, shutdown: CancellationToken) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(ev) => self.handle(&ev),
                    None => {
                        debug!("notification channel closed");
                        break;
                    }
                },
            }
        }
        info!(tracked = self.index.len(), "dispatcher stopped");
    }
}
