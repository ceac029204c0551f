//! Bounded packet queue between the connection loop and the packet writer.
//!
//! The queue holds at most `capacity` items. The async producer side pauses
//! when it is full; the blocking consumer side waits while it is empty. End of
//! stream travels through the queue as a sentinel item, so the writer only
//! sees it after every earlier packet.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendError, TryRecvError, TrySendError};

use crate::packet::Packet;

#[derive(Debug)]
pub enum QueueItem {
    Packet(Packet),
    EndOfStream,
}

/// Errors returned when a packet cannot be enqueued.
#[derive(Debug, Error)]
pub enum PushError {
    /// Queue is at capacity; the packet is handed back.
    #[error("packet queue is full")]
    Full(Packet),
    /// Writer side went away; the packet was released.
    #[error("packet queue is closed")]
    Closed,
}

/// Creates a queue holding at most `capacity` items.
pub fn packet_queue(capacity: usize) -> (PacketSender, PacketReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PacketSender { tx }, PacketReceiver { rx })
}

/// Producer half, owned by the write handler.
#[derive(Debug)]
pub struct PacketSender {
    tx: mpsc::Sender<QueueItem>,
}

impl PacketSender {
    /// Enqueue without waiting.
    pub fn try_push(&self, packet: Packet) -> Result<(), PushError> {
        match self.tx.try_send(QueueItem::Packet(packet)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(QueueItem::Packet(packet))) => Err(PushError::Full(packet)),
            Err(TrySendError::Full(QueueItem::EndOfStream)) | Err(TrySendError::Closed(_)) => {
                Err(PushError::Closed)
            }
        }
    }

    /// Enqueue, waiting for a free slot.
    pub async fn push(&self, packet: Packet) -> Result<(), PushError> {
        self.tx
            .send(QueueItem::Packet(packet))
            .await
            .map_err(|SendError(_)| PushError::Closed)
    }

    /// Enqueue the end-of-stream sentinel and give up the producer side.
    ///
    /// Returns false when the writer is already gone.
    pub async fn finish(self) -> bool {
        self.tx.send(QueueItem::EndOfStream).await.is_ok()
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the packet writer.
#[derive(Debug)]
pub struct PacketReceiver {
    rx: mpsc::Receiver<QueueItem>,
}

impl PacketReceiver {
    /// Blocks the calling (non-async) thread until an item or closure.
    ///
    /// `None` means the producer went away without sending end of stream.
    pub fn blocking_next(&mut self) -> Option<QueueItem> {
        self.rx.blocking_recv()
    }

    pub async fn next(&mut self) -> Option<QueueItem> {
        self.rx.recv().await
    }

    /// Closes the queue and releases every buffered packet unwritten.
    ///
    /// Returns the number of packets discarded.
    pub fn discard_remaining(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        loop {
            match self.rx.try_recv() {
                Ok(QueueItem::Packet(packet)) => {
                    drop(packet);
                    discarded += 1;
                }
                Ok(QueueItem::EndOfStream) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::packet::PacketLedger;

    fn packet(ledger: &Arc<PacketLedger>, byte: u8) -> Packet {
        Packet::new(Bytes::from(vec![byte; 8]), ledger)
    }

    #[test]
    fn producer_pauses_at_capacity() {
        let ledger = PacketLedger::new();
        let (tx, mut rx) = packet_queue(3);

        for i in 0..3 {
            tx.try_push(packet(&ledger, i)).unwrap();
        }
        assert!(tx.is_full());
        assert_eq!(tx.len(), 3);

        let rejected = match tx.try_push(packet(&ledger, 3)) {
            Err(PushError::Full(p)) => p,
            other => panic!("expected full queue, got {other:?}"),
        };
        assert_eq!(tx.len(), 3);

        match rx.blocking_next() {
            Some(QueueItem::Packet(p)) => assert_eq!(p.as_slice()[0], 0),
            other => panic!("unexpected item {other:?}"),
        }
        tx.try_push(rejected).unwrap();
        assert_eq!(tx.len(), 3);
        assert_eq!(ledger.outstanding_packets(), 3);
    }

    #[tokio::test]
    async fn async_push_resumes_after_drain() {
        let ledger = PacketLedger::new();
        let (tx, mut rx) = packet_queue(1);
        tx.push(packet(&ledger, 1)).await.unwrap();

        let paused = tokio::time::timeout(Duration::from_millis(50), tx.push(packet(&ledger, 2)));
        assert!(paused.await.is_err(), "push must wait while the queue is full");

        assert!(matches!(rx.next().await, Some(QueueItem::Packet(_))));
        tokio::time::timeout(Duration::from_secs(1), tx.push(packet(&ledger, 3)))
            .await
            .expect("push resumes once a slot frees")
            .unwrap();
    }

    #[tokio::test]
    async fn end_of_stream_follows_packets() {
        let ledger = PacketLedger::new();
        let (tx, mut rx) = packet_queue(4);
        tx.push(packet(&ledger, 1)).await.unwrap();
        tx.push(packet(&ledger, 2)).await.unwrap();
        assert!(tx.finish().await);

        assert!(matches!(rx.next().await, Some(QueueItem::Packet(_))));
        assert!(matches!(rx.next().await, Some(QueueItem::Packet(_))));
        assert!(matches!(rx.next().await, Some(QueueItem::EndOfStream)));
        assert!(rx.next().await.is_none());
    }

    #[test]
    fn discard_releases_buffered_packets() {
        let ledger = PacketLedger::new();
        let (tx, mut rx) = packet_queue(4);
        for i in 0..3 {
            tx.try_push(packet(&ledger, i)).unwrap();
        }
        assert_eq!(rx.discard_remaining(), 3);
        assert_eq!(ledger.outstanding_packets(), 0);
        assert_eq!(ledger.released(), 3);

        assert!(matches!(tx.try_push(packet(&ledger, 9)), Err(PushError::Closed)));
        assert_eq!(ledger.outstanding_packets(), 0);
    }
}
