//! Queues fed by a transport's background reader
//!
//! A transport pushes unsolicited traffic (streamed reports, trace bytes) into
//! an unbounded channel without waiting on consumers. Consumers hold a
//! [`NotificationQueue`] and choose explicitly between a blocking pop with a
//! timeout and a non-blocking drain.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

// ----------------------------------------------------------------------------
// Notification Queue
// ----------------------------------------------------------------------------

struct QueueInner<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    /// Items pulled off the channel by `count` but not yet consumed
    buffered: VecDeque<T>,
}

impl<T> QueueInner<T> {
    fn pull_pending(&mut self) {
        while let Ok(item) = self.receiver.try_recv() {
            self.buffered.push_back(item);
        }
    }
}

/// Consumer handle for one kind of unsolicited traffic
///
/// Cloning yields another handle onto the same queue.
pub struct NotificationQueue<T> {
    inner: Arc<Mutex<QueueInner<T>>>,
}

impl<T> Clone for NotificationQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for NotificationQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationQueue").finish_non_exhaustive()
    }
}

/// Create a producer/consumer pair
pub fn notification_channel<T>() -> (mpsc::UnboundedSender<T>, NotificationQueue<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let queue = NotificationQueue {
        inner: Arc::new(Mutex::new(QueueInner {
            receiver,
            buffered: VecDeque::new(),
        })),
    };
    (sender, queue)
}

impl<T> NotificationQueue<T> {
    /// Wait up to `timeout` for the next item
    ///
    /// Returns `None` on timeout or when the producer has gone away and the
    /// queue is empty.
    pub async fn pop(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock().await;
        if let Some(item) = inner.buffered.pop_front() {
            return Some(item);
        }
        tokio::time::timeout(timeout, inner.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Take the next item if one is already queued
    pub async fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().await;
        if let Some(item) = inner.buffered.pop_front() {
            return Some(item);
        }
        inner.receiver.try_recv().ok()
    }

    /// Take every item currently queued without waiting for more
    pub async fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock().await;
        inner.pull_pending();
        inner.buffered.drain(..).collect()
    }

    /// Number of items currently queued
    pub async fn count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.pull_pending();
        inner.buffered.len()
    }

    /// Discard everything currently queued
    pub async fn clear(&self) -> usize {
        self.drain().await.len()
    }
}
