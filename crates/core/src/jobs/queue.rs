use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::error::JobError;

/// Creates the FIFO of admitted job ids. The receiving half belongs to the
/// executor and nothing else.
pub fn work_queue() -> (WorkQueue, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        WorkQueue {
            tx,
            depth: Arc::clone(&depth),
        },
        QueueReceiver { rx, depth },
    )
}

#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<String>,
    depth: Arc<AtomicUsize>,
}

impl WorkQueue {
    /// Fails with [`JobError::Unavailable`] once the executor has gone away.
    pub fn enqueue(&self, id: String) -> Result<(), JobError> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(id).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(JobError::Unavailable);
        }
        Ok(())
    }

    /// Ids waiting to be picked up, including cancelled ones the worker has
    /// not yet skipped.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    depth: Arc<AtomicUsize>,
}

impl QueueReceiver {
    /// Waits for the next id. `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<String> {
        let id = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(id)
    }

    /// Stops accepting ids and hands back whatever was still queued, oldest
    /// first. Later enqueues fail with [`JobError::Unavailable`].
    pub fn close_and_drain(&mut self) -> Vec<String> {
        self.rx.close();
        let mut leftover = Vec::new();
        while let Ok(id) = self.rx.try_recv() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            leftover.push(id);
        }
        leftover
    }
}
