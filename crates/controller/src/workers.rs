use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tender_core::ObjectKey;
use tender_queue::WorkQueue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{Outcome, ReconcileError};
use crate::reconcile::Reconciler;

/// Fixed set of workers draining the queue, one key per worker at a time.
pub struct WorkerPool {
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<Reconciler>,
    workers: usize,
    deadline: Duration,
}

impl WorkerPool {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>, reconciler: Arc<Reconciler>, workers: usize, deadline: Duration) -> Self {
        Self { queue, reconciler, workers: workers.max(1), deadline }
    }

    /// Run until `shutdown` fires. In-flight reconciliations are abandoned on shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let stopper = tokio::spawn({
            let queue = Arc::clone(&self.queue);
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancelled().await;
                queue.shut_down();
            }
        });

        let mut set = JoinSet::new();
        for id in 0..self.workers {
            self.spawn_worker(&mut set, id, &shutdown);
        }
        info!(workers = self.workers, "worker pool started");
        let mut next_id = self.workers;
        while let Some(res) = set.join_next().await {
            let Err(e) = res else { continue };
            if e.is_panic() && !self.queue.is_shutting_down() {
                error!(error = %e, worker = next_id, "worker panicked; starting a replacement");
                counter!("worker_restarts", 1u64);
                self.spawn_worker(&mut set, next_id, &shutdown);
                next_id += 1;
            } else {
                error!(error = %e, "worker task failed");
            }
        }
        stopper.abort();
        info!("worker pool stopped");
    }
}

impl WorkerPool {
    fn spawn_worker(&self, set: &mut JoinSet<()>, id: usize, shutdown: &CancellationToken) {
        set.spawn(worker(id, Arc::clone(&self.queue), Arc::clone(&self.reconciler), self.deadline, shutdown.clone()));
    }
}

/// A key taken from the queue. Dropping it releases the key; if the worker is unwinding
/// from a panic the key is also requeued with backoff so it is never stranded.
struct Claim<'a> {
    queue: &'a WorkQueue<ObjectKey>,
    key: ObjectKey,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.queue.add_rate_limited(self.key.clone());
        }
        self.queue.done(&self.key);
    }
}

async fn worker(id: usize, queue: Arc<WorkQueue<ObjectKey>>, reconciler: Arc<Reconciler>, deadline: Duration, shutdown: CancellationToken) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let claim = Claim { queue: &queue, key };
        let outcome = process(&reconciler, &claim.key, deadline, &shutdown).await;
        apply_outcome(&queue, &claim.key, &outcome);
    }
    debug!(worker = id, "worker exiting");
}

/// Run one reconciliation bounded by `deadline` and the shutdown signal.
pub async fn process(reconciler: &Reconciler, key: &ObjectKey, deadline: Duration, shutdown: &CancellationToken) -> Outcome {
    let started = Instant::now();
    let span = info_span!("reconcile", key = %key);
    let outcome = tokio::select! {
        _ = shutdown.cancelled() => Outcome::Error(ReconcileError::Cancelled),
        res = tokio::time::timeout(deadline, reconciler.reconcile(key)).instrument(span) => match res {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Error(ReconcileError::DeadlineExceeded(deadline)),
        },
    };
    histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
    counter!("reconcile_total", 1u64, "outcome" => outcome.label());
    outcome
}

/// Translate an outcome into queue actions. Any non-error outcome resets the key's backoff.
pub fn apply_outcome(queue: &WorkQueue<ObjectKey>, key: &ObjectKey, outcome: &Outcome) {
    match outcome {
        Outcome::Done => {
            queue.forget(key);
            debug!(key = %key, "reconciled");
        }
        Outcome::RequeueNow => {
            queue.forget(key);
            queue.add(key.clone());
        }
        Outcome::RequeueAfter(delay) => {
            queue.forget(key);
            queue.add_after(key.clone(), *delay);
        }
        Outcome::Error(e) => {
            let attempts = queue.num_requeues(key) + 1;
            if e.is_retryable() {
                warn!(key = %key, error = %e, attempts, "reconcile failed; retrying with backoff");
            } else {
                error!(key = %key, error = %e, attempts, "reconcile blocked until the object is fixed; retrying with backoff");
            }
            queue.add_rate_limited(key.clone());
        }
    }
}
