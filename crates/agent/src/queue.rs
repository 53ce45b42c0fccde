use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tabpilot_core::{Error, Result, TabId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct TabQueue {
    tx: mpsc::UnboundedSender<Job>,
    open: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// Completion of a job handed to [`TabQueues::enqueue`].
pub struct QueuedJob<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> QueuedJob<T> {
    /// Wait for the job. Fails if the tab's queue was discarded before it ran.
    pub async fn wait(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| Error::Other("queued work discarded with its tab".to_string()))
    }
}

/// Per-tab FIFO execution. Jobs for one tab run strictly one after another in
/// the order they were enqueued; different tabs do not wait on each other.
///
/// The queues live in memory only and are rebuilt empty after a restart.
#[derive(Default)]
pub struct TabQueues {
    queues: Mutex<HashMap<TabId, TabQueue>>,
}

impl TabQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `job` to the tab's queue. Enqueue order is call order, so callers
    /// that must keep events ordered call this before their first await.
    pub fn enqueue<F, T>(&self, tab_id: TabId, job: F) -> QueuedJob<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let wrapped: Job = Box::pin(async move {
            let _ = done_tx.send(job.await);
        });

        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues
            .entry(tab_id)
            .and_modify(|q| {
                if q.tx.is_closed() {
                    *q = spawn_worker(tab_id);
                }
            })
            .or_insert_with(|| spawn_worker(tab_id));
        // the worker only stops once the entry is discarded, and then a fresh one is spawned above
        let _ = queue.tx.send(wrapped);
        QueuedJob { rx: done_rx }
    }

    /// Drop every job still waiting for the tab and wait for the one already
    /// running, if any. When this returns nothing queued before the call is
    /// still touching the tab.
    pub async fn discard(&self, tab_id: TabId) {
        let removed = self.queues.lock().unwrap_or_else(|e| e.into_inner()).remove(&tab_id);
        let Some(queue) = removed else {
            return;
        };
        queue.open.store(false, Ordering::SeqCst);
        // closing the channel lets the worker exit after its current job
        drop(queue.tx);
        if let Err(e) = queue.worker.await {
            error!(tab_id, error = %e, "Tab queue worker failed");
        }
        debug!(tab_id, "Discarded tab queue");
    }

    pub fn is_tracking(&self, tab_id: TabId) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&tab_id)
    }
}

fn spawn_worker(tab_id: TabId) -> TabQueue {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let open = Arc::new(AtomicBool::new(true));
    let still_open = open.clone();
    let worker = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if !still_open.load(Ordering::SeqCst) {
                // dropping the job drops its completion sender
                continue;
            }
            job.await;
        }
        debug!(tab_id, "Tab queue drained");
    });
    TabQueue { tx, open, worker }
}
