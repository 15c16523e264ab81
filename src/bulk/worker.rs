//! Worker pool draining flush batches from the bounded queue

use super::buffer::StagedItem;
use super::executor::Executor;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Releases the flush caller waiting on a batch.
///
/// Consumed by [`CompletionSignal::complete`]. If the owning worker unwinds
/// or is cancelled first, dropping the signal still wakes the waiter, which
/// then sees the batch as aborted.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: oneshot::Sender<Result<()>>,
}

pub type CompletionReceiver = oneshot::Receiver<Result<()>>;

impl CompletionSignal {
    pub fn new() -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn complete(self, outcome: Result<()>) {
        // The waiter only goes away if its task was cancelled
        let _ = self.tx.send(outcome);
    }
}

/// Snapshot of the staging buffer handed to one worker
#[derive(Debug)]
pub struct FlushBatch {
    pub items: Vec<StagedItem>,
    pub completion: CompletionSignal,
}

pub type BatchReceiver = Arc<Mutex<mpsc::Receiver<FlushBatch>>>;

/// Fixed set of worker tasks sharing one queue receiver
pub struct WorkerPool {
    handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    pub fn spawn(count: usize, receiver: BatchReceiver, executor: Arc<Executor>) -> Self {
        let handles = (0..count.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                let executor = executor.clone();
                tokio::spawn(worker_loop(id, receiver, executor))
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit, returning the first failure.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for handle in self.handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Internal(format!("worker task failed: {}", e))),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

async fn worker_loop(id: usize, receiver: BatchReceiver, executor: Arc<Executor>) -> Result<()> {
    debug!(worker = id, "worker started");

    loop {
        let next = receiver.lock().await.recv().await;
        let Some(FlushBatch { items, completion }) = next else {
            break;
        };

        match executor.process(&items).await {
            Ok(()) => completion.complete(Ok(())),
            Err(e) => {
                error!(worker = id, items = items.len(), error = %e, "flush batch aborted");
                let reason = e.to_string();
                completion.complete(Err(e));
                return Err(Error::Aborted(reason));
            }
        }
    }

    info!(worker = id, "worker stopped");
    Ok(())
}
