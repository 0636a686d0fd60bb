//! Tender controller: drives Memcached resources toward their desired state.
//!
//! Data flow: notification -> [`Dispatcher`] -> [`WorkQueue`] -> [`WorkerPool`] ->
//! [`Reconciler`] -> store write -> notification.

#![forbid(unsafe_code)]

use std::sync::Arc;

use tender_core::{ObjectKey, WatchEvent};
use tender_kubehub::ObjectStore;
use tender_queue::WorkQueue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ownership;
pub mod reconcile;
pub mod workers;
pub mod workload;

pub use config::ControllerConfig;
pub use dispatch::Dispatcher;
pub use error::{Outcome, ReconcileError};
pub use ownership::OwnershipIndex;
pub use reconcile::Reconciler;
pub use workers::WorkerPool;

/// Wires a store and a notification source into a running controller.
pub struct Controller {
    store: Arc<dyn ObjectStore>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(store: Arc<dyn ObjectStore>, config: ControllerConfig) -> Self {
        Self { store, config }
    }

    /// Spawn the dispatcher and worker pool. Must be called within a tokio runtime.
    pub fn start(self, events: mpsc::Receiver<WatchEvent>) -> ControllerHandle {
        let shutdown = CancellationToken::new();
        let queue = Arc::new(WorkQueue::new(self.config.backoff()));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&self.store), self.config.drift_cooldown));

        let dispatcher = Dispatcher::new(Arc::clone(&queue));
        let pool = WorkerPool::new(Arc::clone(&queue), reconciler, self.config.workers, self.config.reconcile_timeout);
        let tasks = vec![
            tokio::spawn(dispatcher.run(events, shutdown.clone())),
            tokio::spawn(pool.run(shutdown.clone())),
        ];
        info!(
            workers = self.config.workers,
            cooldown_secs = self.config.drift_cooldown.as_secs(),
            ns = ?self.config.namespace,
            "controller started"
        );
        ControllerHandle { shutdown, queue, tasks }
    }
}

pub struct ControllerHandle {
    shutdown: CancellationToken,
    queue: Arc<WorkQueue<ObjectKey>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        Arc::clone(&self.queue)
    }

    /// Stop dispatching, abandon in-flight work and wait for every task to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.queue.shut_down();
        for t in self.tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "controller task ended abnormally");
            }
        }
        info!("controller stopped");
    }
}
