use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// The other side of the queue has gone away.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("mailbox closed")]
pub struct MailboxClosed;

/// A bounded FIFO hand-off queue between concurrent contexts.
///
/// Producers clone a [`MailboxSender`]; consumers pop through the mailbox
/// itself, whose receiver sits behind an async mutex so any task may pop
/// (blocking or not) without a dedicated owner. Insertion order is
/// preserved and an item is delivered to exactly one consumer.
pub struct Mailbox<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

/// Cloneable producer handle for a [`Mailbox`].
pub struct MailboxSender<T>(mpsc::Sender<T>);

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        MailboxSender(self.0.clone())
    }
}

impl<T> MailboxSender<T> {
    /// Push one item, waiting for space if the queue is at capacity.
    pub async fn send(&self, item: T) -> Result<(), MailboxClosed> {
        self.0.send(item).await.map_err(|_| MailboxClosed)
    }
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn sender(&self) -> MailboxSender<T> {
        MailboxSender(self.tx.clone())
    }

    /// Blocking pop: waits until an item arrives. Cancel-safe; a cancelled
    /// pop never consumes an item.
    pub async fn pop(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Non-blocking pop: `None` when the queue is currently empty or
    /// another consumer holds the receiver.
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let mailbox = Mailbox::new(8);
        let tx = mailbox.sender();
        for i in 0..5 {
            tx.send(i).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(mailbox.pop().await, Some(i));
        }
        assert_eq!(mailbox.try_pop(), None);
    }

    #[tokio::test]
    async fn test_try_pop_on_empty() {
        let mailbox: Mailbox<u32> = Mailbox::new(4);
        assert_eq!(mailbox.try_pop(), None);
    }

    #[tokio::test]
    async fn test_multiple_producers_no_loss() {
        let mailbox = Arc::new(Mailbox::new(64));
        let mut handles = Vec::new();
        for producer in 0..4 {
            let tx = mailbox.sender();
            handles.push(tokio::spawn(async move {
                for i in 0..16u32 {
                    tx.send(producer * 100 + i).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut received = Vec::new();
        while let Some(item) = mailbox.try_pop() {
            received.push(item);
        }
        assert_eq!(received.len(), 64);

        // per-producer order is preserved even when producers interleave
        for producer in 0..4 {
            let from_producer: Vec<u32> = received
                .iter()
                .copied()
                .filter(|v| v / 100 == producer)
                .collect();
            let mut sorted = from_producer.clone();
            sorted.sort_unstable();
            assert_eq!(from_producer, sorted);
        }
    }

    #[tokio::test]
    async fn test_send_blocks_at_capacity() {
        let mailbox = Mailbox::new(1);
        let tx = mailbox.sender();
        tx.send(1u32).await.unwrap();

        let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), tx.send(2)).await;
        assert!(blocked.is_err(), "send should block while the queue is full");

        assert_eq!(mailbox.pop().await, Some(1));
        tx.send(3).await.unwrap();
        assert_eq!(mailbox.pop().await, Some(3));
    }
}
