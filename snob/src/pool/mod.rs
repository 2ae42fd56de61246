//! Bounded asynchronous worker pool.
//!
//! A fixed set of consumers drains a bounded queue. Each dequeued payload is
//! dispatched to its own task running the processing function, and the
//! consumer goes straight back to the queue. This keeps the queue moving when
//! processing is slow.
//!
//! ```text
//! QueueHandle::push ─→ [ bounded queue ] ─→ consumer 1 ─→ spawn(process)
//!                                        ├→ consumer 2 ─→ spawn(process)
//!                                        └→ consumer N ─→ spawn(process)
//! ```
//!
//! ## Lifecycle
//!
//! `Created → Running → Draining → Stopped`. Only the pool itself closes the
//! queue (by dropping the one sender it owns), so it can only happen once.
//! [`WorkerPool::shutdown`] closes the queue, waits for every consumer to
//! exit, then waits for every dispatched task. It has no timeout of its own.

pub mod queue;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::recover::Recoverer;

pub use queue::{PushError, QueueHandle};

/// Consumers started when nothing else is configured.
pub const DEFAULT_WORKERS: usize = 5;

/// Queue capacity used when nothing else is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Processing function run for every dequeued payload.
///
/// The token is the one the pool was started with. Dispatched work is not
/// cancelled by the pool; a processor that wants to stop early must watch it.
pub trait Process<P>: Send + Sync + 'static {
    fn process(&self, cancel: CancellationToken, payload: P) -> BoxFuture<'static, ()>;
}

impl<P, F, Fut> Process<P> for F
where
    F: Fn(CancellationToken, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn process(&self, cancel: CancellationToken, payload: P) -> BoxFuture<'static, ()> {
        Box::pin(self(cancel, payload))
    }
}

/// How many processing tasks may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingLimit {
    /// Every dequeued payload gets its own task immediately.
    #[default]
    Unbounded,
    /// At most `n` tasks at once; consumers wait for a slot before dispatching,
    /// which leaves payloads in the queue and pushes back on producers.
    Bounded(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool cannot start while {0:?}")]
    NotStartable(PoolState),
}

struct Inner<P> {
    state: PoolState,
    sender: Option<mpsc::Sender<P>>,
    receiver: Option<mpsc::Receiver<P>>,
}

/// Fixed set of consumers over a bounded queue.
pub struct WorkerPool<P> {
    processor: Arc<dyn Process<P>>,
    workers: usize,
    capacity: usize,
    limit: ProcessingLimit,
    recoverer: Recoverer,
    handle: QueueHandle<P>,
    closed: Arc<AtomicBool>,
    inner: Mutex<Inner<P>>,
    consumers: TaskTracker,
    tasks: TaskTracker,
}

impl<P: Send + 'static> WorkerPool<P> {
    /// Build a pool. Zero workers or zero capacity are raised to one.
    pub fn new(
        processor: Arc<dyn Process<P>>,
        workers: usize,
        capacity: usize,
        recoverer: Recoverer,
    ) -> Self {
        if workers == 0 || capacity == 0 {
            warn!(workers, capacity, "worker_pool_size_clamped");
        }
        let workers = workers.max(1);
        let capacity = capacity.max(1);

        let (sender, receiver) = mpsc::channel(capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let handle = QueueHandle::new(&sender, Arc::clone(&closed));

        Self {
            processor,
            workers,
            capacity,
            limit: ProcessingLimit::default(),
            recoverer,
            handle,
            closed,
            inner: Mutex::new(Inner {
                state: PoolState::Created,
                sender: Some(sender),
                receiver: Some(receiver),
            }),
            consumers: TaskTracker::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_limit(mut self, limit: ProcessingLimit) -> Self {
        self.limit = limit;
        self
    }

    /// Write-only handle for producers.
    pub fn queue(&self) -> QueueHandle<P> {
        self.handle.clone()
    }

    pub fn state(&self) -> PoolState {
        self.lock().state
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Processing tasks dispatched and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch the consumers. `cancel` stops them without draining and is
    /// passed to every processing call.
    pub fn start(&self, cancel: CancellationToken) -> Result<(), PoolError> {
        let receiver = {
            let mut inner = self.lock();
            if inner.state != PoolState::Created {
                return Err(PoolError::NotStartable(inner.state));
            }
            let receiver = inner
                .receiver
                .take()
                .ok_or(PoolError::NotStartable(inner.state))?;
            inner.state = PoolState::Running;
            receiver
        };

        let receiver = Arc::new(AsyncMutex::new(receiver));
        let permits = match self.limit {
            ProcessingLimit::Unbounded => None,
            ProcessingLimit::Bounded(n) => Some(Arc::new(Semaphore::new(n.max(1)))),
        };

        for id in 0..self.workers {
            let consumer = Consumer {
                id,
                receiver: Arc::clone(&receiver),
                processor: Arc::clone(&self.processor),
                permits: permits.clone(),
                tasks: self.tasks.clone(),
                recoverer: self.recoverer.clone(),
                cancel: cancel.clone(),
            };
            self.consumers.spawn(consumer.run());
        }

        info!(
            workers = self.workers,
            capacity = self.capacity,
            limit = ?self.limit,
            "worker_pool_started"
        );
        Ok(())
    }

    /// Close the queue, then wait for consumers, then for dispatched tasks.
    ///
    /// Safe to call more than once and from several tasks; only the first
    /// call closes the queue.
    pub async fn shutdown(&self) {
        let (sender, receiver) = {
            let mut inner = self.lock();
            if matches!(inner.state, PoolState::Created | PoolState::Running) {
                inner.state = PoolState::Draining;
            }
            (inner.sender.take(), inner.receiver.take())
        };

        if let Some(sender) = sender {
            self.closed.store(true, Ordering::Release);
            drop(sender);
            info!("worker_pool_queue_closed");
        }
        if let Some(receiver) = receiver {
            // Never started: nobody will ever read what is buffered.
            drop(receiver);
            warn!("worker_pool_stopped_before_start");
        }

        info!(in_flight = self.tasks.len(), "worker_pool_draining");

        self.consumers.close();
        self.consumers.wait().await;
        debug!("worker_pool_consumers_exited");

        self.tasks.close();
        self.tasks.wait().await;

        self.lock().state = PoolState::Stopped;
        info!("worker_pool_stopped");
    }
}

struct Consumer<P> {
    id: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<P>>>,
    processor: Arc<dyn Process<P>>,
    permits: Option<Arc<Semaphore>>,
    tasks: TaskTracker,
    recoverer: Recoverer,
    cancel: CancellationToken,
}

impl<P: Send + 'static> Consumer<P> {
    async fn run(self) {
        debug!(worker = self.id, "worker_started");

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(worker = self.id, "worker_cancelled");
                    break;
                }
                payload = recv(&self.receiver) => payload,
            };

            let Some(payload) = next else {
                debug!(worker = self.id, "worker_queue_closed");
                break;
            };

            let permit = match &self.permits {
                None => None,
                Some(permits) => tokio::select! {
                    _ = self.cancel.cancelled() => {
                        warn!(worker = self.id, "worker_payload_dropped");
                        break;
                    }
                    permit = Arc::clone(permits).acquire_owned() => permit.ok(),
                },
            };

            self.dispatch(payload, permit);
        }

        debug!(worker = self.id, "worker_stopped");
    }

    fn dispatch(&self, payload: P, permit: Option<OwnedSemaphorePermit>) {
        let processor = Arc::clone(&self.processor);
        let cancel = self.cancel.clone();
        let recoverer = self.recoverer.clone();
        let worker = self.id;

        // The processor is called inside the guarded task so a panic while
        // building its future cannot unwind the consumer.
        self.tasks.spawn(async move {
            let _permit = permit;
            let work = async move { processor.process(cancel, payload).await };
            if recoverer.guard("process", work).await.is_none() {
                warn!(worker, "worker_task_recovered");
            }
        });
    }
}

async fn recv<P>(receiver: &AsyncMutex<mpsc::Receiver<P>>) -> Option<P> {
    receiver.lock().await.recv().await
}
