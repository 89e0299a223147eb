//! Archive enqueue contract.
//!
//! The relational archive writer (schema, batching, retention) lives outside
//! this crate; the pipeline only ever enqueues. The queue is bounded and the
//! hot path never blocks on it: when the writer falls behind, spots are
//! dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::spot::Spot;

/// Non-blocking handle the pipeline enqueues through.
#[derive(Clone)]
pub struct ArchiveHandle {
    tx: mpsc::Sender<Arc<Spot>>,
    drops: Arc<AtomicU64>,
}

impl ArchiveHandle {
    /// Create the handle and the receiving end the archive writer drains.
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<Arc<Spot>>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (
            Self {
                tx,
                drops: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue for archival. Drops (and counts) when the queue is full or
    /// the writer has gone away.
    pub fn enqueue(&self, spot: Arc<Spot>) {
        if self.tx.try_send(spot).is_err() {
            self.drops.fetch_add(1, Relaxed);
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot() -> Arc<Spot> {
        Arc::new(Spot::new("K1ABC", "W3LPL-#", 14025.0, "CW"))
    }

    #[tokio::test]
    async fn test_enqueue_delivers() {
        let (handle, mut rx) = ArchiveHandle::new(4);
        handle.enqueue(spot());
        let received = rx.recv().await.expect("spot delivered");
        assert_eq!(received.dx_call, "K1ABC");
        assert_eq!(handle.drop_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_drops_on_full_queue() {
        let (handle, _rx) = ArchiveHandle::new(1);
        handle.enqueue(spot());
        handle.enqueue(spot());
        handle.enqueue(spot());
        assert_eq!(handle.drop_count(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_drops_after_writer_gone() {
        let (handle, rx) = ArchiveHandle::new(4);
        drop(rx);
        handle.enqueue(spot());
        assert_eq!(handle.drop_count(), 1);
    }
}
