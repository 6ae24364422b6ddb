//! Fixed-size worker pool over a shared FIFO queue.
//!
//! The [`WorkerPool`] runs at most `size` work orders at once. Orders are
//! pulled in submission order by whichever worker is free; each order
//! receives the ordinal id of the worker running it. The pool logs the
//! outcome of an order but never hands it back: callers that care about
//! results report them from inside the order.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default number of workers when `0` is requested.
pub const DEFAULT_WORKERS: usize = fleetrun_core::config::DEFAULT_WORKERS;

/// Future produced by a work order.
pub type WorkFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A unit of work. Receives the id of the worker executing it.
pub type WorkOrder = Box<dyn FnOnce(usize) -> WorkFuture + Send>;

/// Fixed-size pool of tokio workers sharing one unbounded queue.
pub struct WorkerPool {
    size: usize,
    /// Dropped by [`WorkerPool::stop`] to close the queue.
    sender: Mutex<Option<mpsc::UnboundedSender<WorkOrder>>>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<WorkOrder>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a pool with `size` workers. The workers are not running until
    /// [`WorkerPool::start`] is called.
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_WORKERS } else { size };
        let (tx, rx) = mpsc::unbounded_channel();

        info!(size, "WorkerPool created");

        Self {
            size,
            sender: Mutex::new(Some(tx)),
            receiver: Arc::new(AsyncMutex::new(rx)),
            workers: Mutex::new(Vec::new()),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Launch the workers. Calling this more than once has no effect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.size {
            let receiver = Arc::clone(&self.receiver);
            let queued = Arc::clone(&self.queued);
            workers.push(tokio::spawn(run_worker(worker_id, receiver, queued)));
        }
        drop(workers);
        debug!(size = self.size, "WorkerPool started");
    }

    /// Enqueue a work order. Never blocks.
    ///
    /// Works before and after [`WorkerPool::start`]; fails once the pool has
    /// been stopped.
    pub fn submit<F, Fut>(&self, order: F) -> Result<(), PoolError>
    where
        F: FnOnce(usize) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: WorkOrder =
            Box::new(move |worker_id| -> WorkFuture { Box::pin(order(worker_id)) });
        self.submit_order(boxed)
    }

    /// Enqueue an already boxed work order.
    pub fn submit_order(&self, order: WorkOrder) -> Result<(), PoolError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = sender.as_ref().ok_or(PoolError::Closed)?;
        self.queued.fetch_add(1, Ordering::SeqCst);
        if tx.send(order).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::Closed);
        }
        Ok(())
    }

    /// Close the queue and wait until every queued and in-flight order has
    /// finished. Orders are never preempted.
    ///
    /// A pool that was never started is started here so queued work drains.
    pub async fn stop(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        self.start();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!(size = self.size, "WorkerPool stopped");
    }

    /// Number of workers.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether [`WorkerPool::start`] has launched the workers.
    pub fn is_started(&self) -> bool {
        !self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Whether [`WorkerPool::stop`] has closed the queue.
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Orders submitted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<WorkOrder>>>,
    queued: Arc<AtomicUsize>,
) {
    debug!(worker_id, "Worker started");
    loop {
        // The lock is only held while waiting for the next order.
        let order = receiver.lock().await.recv().await;
        let Some(order) = order else {
            break;
        };
        queued.fetch_sub(1, Ordering::SeqCst);

        // Run on its own task so a panicking order cannot take the worker down.
        match tokio::spawn(order(worker_id)).await {
            Ok(Ok(())) => debug!(worker_id, "Work order finished"),
            Ok(Err(e)) => warn!(worker_id, error = %e, "Work order failed"),
            Err(e) => error!(worker_id, error = %e, "Work order panicked"),
        }
    }
    debug!(worker_id, "Worker exiting");
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The queue was closed by `stop`.
    #[error("Worker pool has been closed")]
    Closed,
}
