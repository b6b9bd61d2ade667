//! Asynchronous variant write-back
//!
//! Newly transformed variants are handed to a bounded queue drained by a
//! fixed number of workers. Submitting never blocks the request path; when
//! the queue is full the variant is dropped and the next miss recomputes it.
//!
//! Closing every [`WriteBackQueue`] handle lets the workers finish the jobs
//! already queued and exit, which is how shutdown drains pending writes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::media::cache_key::CacheKey;
use crate::media::store::ObjectStore;
use crate::server::metrics::MediaMetrics;

pub const DEFAULT_WRITEBACK_WORKERS: usize = 4;
pub const DEFAULT_WRITEBACK_QUEUE_CAPACITY: usize = 256;

/// A variant waiting to be persisted.
#[derive(Debug, Clone)]
pub struct WriteBackJob {
    pub key: CacheKey,
    pub bytes: Bytes,
    pub content_type: String,
}

/// Producer side of the write-back pool.
#[derive(Clone)]
pub struct WriteBackQueue {
    tx: mpsc::Sender<WriteBackJob>,
    metrics: Arc<MediaMetrics>,
}

impl WriteBackQueue {
    /// Enqueue a job without waiting. Returns false if it was dropped.
    pub fn submit(&self, job: WriteBackJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.metrics.writeback_dropped_total.inc();
                tracing::warn!(key = %job.key, "write-back queue full, dropping variant");
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.metrics.writeback_dropped_total.inc();
                tracing::warn!(key = %job.key, "write-back pool stopped, dropping variant");
                false
            }
        }
    }
}

/// Worker side of the write-back pool.
pub struct WriteBackPool {
    handles: Vec<JoinHandle<()>>,
}

impl WriteBackPool {
    /// Start `workers` tasks persisting into `store`.
    pub fn spawn(
        store: Arc<dyn ObjectStore>,
        workers: usize,
        queue_capacity: usize,
        metrics: Arc<MediaMetrics>,
    ) -> (WriteBackQueue, WriteBackPool) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&rx),
                    Arc::clone(&store),
                    Arc::clone(&metrics),
                ))
            })
            .collect();

        (WriteBackQueue { tx, metrics }, WriteBackPool { handles })
    }

    /// Wait for the workers to drain the queue and exit.
    ///
    /// Workers only exit once every queue handle is dropped. Returns false if
    /// they did not finish within `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let join_all = async {
            for handle in self.handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "write-back worker panicked");
                }
            }
        };
        tokio::time::timeout(timeout, join_all).await.is_ok()
    }
}

async fn run_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<WriteBackJob>>>,
    store: Arc<dyn ObjectStore>,
    metrics: Arc<MediaMetrics>,
) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };

        match store.put(job.key.as_str(), job.bytes, &job.content_type).await {
            Ok(()) => {
                metrics.writeback_persisted_total.inc();
                tracing::debug!(worker = id, key = %job.key, "variant persisted");
            }
            Err(e) => {
                metrics.writeback_failed_total.inc();
                tracing::warn!(worker = id, key = %job.key, error = %e, "variant write-back failed");
            }
        }
    }
    tracing::debug!(worker = id, "write-back worker stopped");
}
