//! Webhook-specific stages: raw body dump and enqueue.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::pipeline::{Consume, Ctx, Middleware, Next, StageError};
use crate::pool::{PushError, QueueHandle};

/// Bytes of the body included in the debug preview.
const BODY_PREVIEW_BYTES: usize = 500;

// =============================================================================
// Raw body dump
// =============================================================================

/// Writes every inbound body to `<dir>/webhook_<nanos>_<seq>.json` before the
/// chain continues. A failed write is logged and does not halt the request.
pub struct RawBodyLog {
    dir: PathBuf,
    seq: AtomicU64,
}

impl RawBodyLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    fn next_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("webhook_{nanos}_{seq}.json"))
    }
}

impl Middleware for RawBodyLog {
    fn call<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let body = match ctx.body_bytes().await {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "webhook_raw_body_unreadable");
                    return ctx.fail(err);
                }
            };

            debug!(
                body_length = body.len(),
                body_preview = %String::from_utf8_lossy(&body[..body.len().min(BODY_PREVIEW_BYTES)]),
                "webhook_raw_body"
            );

            let path = self.next_path();
            match tokio::fs::write(&path, &body).await {
                Ok(()) => info!(path = %path.display(), "webhook_raw_body_logged"),
                Err(e) => warn!(path = %path.display(), error = %e, "webhook_raw_body_write_failed"),
            }

            next.run(ctx).await;
        })
    }
}

// =============================================================================
// Enqueue
// =============================================================================

/// Pushes the decoded value onto a worker pool queue.
///
/// Waits for a free slot while the queue is full. If the request is
/// cancelled first, the push is abandoned (nothing is queued) and the
/// request fails with `408`. A closed queue fails with `503`.
pub struct Push<P> {
    queue: QueueHandle<P>,
}

impl<P> Push<P> {
    pub fn new(queue: QueueHandle<P>) -> Self {
        Self { queue }
    }
}

impl<P: Send + 'static> Consume<P> for Push<P> {
    fn consume<'a>(&'a self, ctx: &'a mut Ctx, input: P) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move {
            let cancelled = ctx.cancelled();
            tokio::select! {
                biased;
                _ = cancelled => {
                    warn!(uri = %ctx.uri(), "webhook_enqueue_cancelled");
                    Err(StageError::PushCancelled)
                }
                pushed = self.queue.push(input) => match pushed {
                    Ok(()) => {
                        debug!("webhook_enqueued");
                        Ok(())
                    }
                    Err(PushError::Closed) => {
                        warn!("webhook_queue_closed");
                        Err(StageError::QueueClosed)
                    }
                },
            }
        })
    }
}
