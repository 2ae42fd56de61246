//! Producer side of the pool's bounded queue.
//!
//! Producers hold a [`QueueHandle`], which never keeps the queue open on its
//! own: only the pool owns the real sender, so closing is a single ownership
//! transfer rather than a convention every producer has to follow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

/// Why a push was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    /// The owner closed the queue; the pool is draining or stopped.
    #[error("queue is closed")]
    Closed,
}

/// Write-only handle to a pool's queue.
pub struct QueueHandle<P> {
    sender: mpsc::WeakSender<P>,
    closed: Arc<AtomicBool>,
}

impl<P> Clone for QueueHandle<P> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<P> std::fmt::Debug for QueueHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<P> QueueHandle<P> {
    pub(crate) fn new(sender: &mpsc::Sender<P>, closed: Arc<AtomicBool>) -> Self {
        Self {
            sender: sender.downgrade(),
            closed,
        }
    }

    /// Push `payload`, waiting for a free slot while the queue is full.
    ///
    /// Dropping the returned future before it resolves leaves nothing
    /// queued. A push that is already waiting when the owner closes the queue
    /// still completes once a consumer frees a slot.
    pub async fn push(&self, payload: P) -> Result<(), PushError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PushError::Closed);
        }
        let sender = self.sender.upgrade().ok_or(PushError::Closed)?;
        sender.send(payload).await.map_err(|_| PushError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.upgrade().is_none()
    }
}
