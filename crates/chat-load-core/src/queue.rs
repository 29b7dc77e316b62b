use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("work queue is closed")]
pub struct QueueClosed;

/// Bounded multi-producer multi-consumer FIFO.
///
/// `push` waits while the queue is full, which is what keeps the generator
/// from racing ahead of the senders. Consumers share one receiver behind a
/// fair async mutex, so items leave in exactly the order they were pushed.
pub struct WorkQueue<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    closed: CancellationToken,
    capacity: usize,
}

impl<T: Send> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue one item, waiting for space. Fails once the queue is closed,
    /// including while already waiting.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(QueueClosed)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(QueueClosed),
            sent = tx.send(item) => sent.map_err(|_| QueueClosed),
        }
    }

    /// Dequeue the oldest item. Returns `None` once the queue is closed and
    /// fully drained.
    pub async fn pop(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Stop accepting items. Items already queued remain poppable.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
