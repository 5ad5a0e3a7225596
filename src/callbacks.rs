//! Callback executor: a bounded worker pool that delivers user callbacks off
//! the protocol I/O path.
//!
//! Workers start lazily on first submission, so constructing a connection
//! does not require a runtime context. Submission awaits queue space, which
//! preserves completion order end to end with the default single worker.
//! `stop()` closes the queue and joins the workers after they have drained
//! everything already enqueued.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Default depth of the callback queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded worker pool for user callbacks.
pub(crate) struct CallbackExecutor {
    worker_count: usize,
    queue_capacity: usize,
    stopped: AtomicBool,
    tx: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for CallbackExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackExecutor")
            .field("worker_count", &self.worker_count)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl CallbackExecutor {
    /// Single worker: callbacks run in submission order.
    pub fn new() -> Self {
        Self::with_workers(1, DEFAULT_QUEUE_CAPACITY)
    }

    /// Multiple workers trade per-connection callback ordering for
    /// throughput; the driver itself always uses one.
    pub fn with_workers(worker_count: usize, queue_capacity: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            queue_capacity: queue_capacity.max(1),
            stopped: AtomicBool::new(false),
            tx: std::sync::Mutex::new(None),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Get the live sender, spawning the workers on first use. Returns
    /// `None` once stopped.
    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        let mut slot = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = slot.as_ref() {
            return Some(tx.clone());
        }
        let (tx, rx) = mpsc::channel::<Job>(self.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let spawned = (0..self.worker_count)
            .map(|_| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job(),
                            None => break,
                        }
                    }
                })
            })
            .collect();
        *self.workers.lock().unwrap_or_else(|e| e.into_inner()) = spawned;
        *slot = Some(tx.clone());
        Some(tx)
    }

    /// Enqueue a callback, waiting for queue space. After `stop()` the job
    /// runs inline on the submitting task so completions are never lost.
    pub async fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender() {
            Some(tx) => {
                if let Err(e) = tx.send(Box::new(job)).await {
                    // Workers stopped between the clone and the send.
                    (e.0)();
                }
            }
            None => job(),
        }
    }

    /// Close the queue, execute everything already enqueued, terminate the
    /// workers. Idempotent.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(tx);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            let _ = worker.await;
        }
    }
}
