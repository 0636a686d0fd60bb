use std::time::Duration;

use tender_core::ObjectKey;
use tender_kubehub::StoreError;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("deployment {key} is controlled by {owner}, not by this Memcached")]
    ForeignOwner { key: ObjectKey, owner: String },
    #[error("invalid spec for {key}: {reason}")]
    InvalidSpec { key: ObjectKey, reason: String },
    #[error("reconciliation exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Transient failures clear up on their own; the rest need someone to fix an object.
    /// Both kinds are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Store(e) => e.is_retryable(),
            ReconcileError::DeadlineExceeded(_) | ReconcileError::Cancelled => true,
            ReconcileError::ForeignOwner { .. } | ReconcileError::InvalidSpec { .. } => false,
        }
    }
}

/// What the work queue should do with a key after one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; wait for the next real event.
    Done,
    /// Re-verify immediately.
    RequeueNow,
    /// Look again after a cooldown.
    RequeueAfter(Duration),
    /// Failed; retry with per-key backoff.
    Error(ReconcileError),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::RequeueNow => "requeue_now",
            Outcome::RequeueAfter(_) => "requeue_after",
            Outcome::Error(_) => "error",
        }
    }
}
