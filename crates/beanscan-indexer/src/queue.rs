use beanscan_core::{Result, ScanError};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handle to the result of a submitted job.
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    pub async fn wait(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| ScanError::InvalidOperation("indexing job was dropped".to_string()))?
    }
}

/// Runs index mutations one at a time in submission order on a single worker task.
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
    completed: Arc<AtomicU64>,
}

impl SerialQueue {
    /// Must be called from within a tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let completed = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&completed);
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("Indexing job panicked");
                }
                counter.fetch_add(1, Ordering::Relaxed);
            }
            debug!("Indexing queue closed");
        });
        Self {
            tx,
            worker,
            completed,
        }
    }

    pub fn submit<F, T>(&self, job: F) -> JobHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(job.await);
        });
        if self.tx.send(job).is_err() {
            debug!("Submitted to a stopped indexing queue");
        }
        JobHandle { rx: done_rx }
    }

    /// Resolves once every job submitted before this call has finished.
    pub async fn flush(&self) -> Result<()> {
        self.submit(async { Ok(()) }).wait().await
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Stops the worker. Pending jobs are dropped.
    pub fn shutdown(&self) {
        self.worker.abort();
    }
}
