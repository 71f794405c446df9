//! Multi-producer multi-consumer FIFO with a priority head.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// An unbounded FIFO shared by reference-counted handles.
///
/// `push_head` jumps the queue and is the priority mechanism; `pop`
/// parks until an item or `close` arrives; `timedpop` bounds the wait.
pub struct AsyncQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        AsyncQueue {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct QueueInner<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> AsyncQueue<T> {
    pub fn new() -> AsyncQueue<T> {
        AsyncQueue {
            inner: Arc::new(QueueInner {
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Append an item. Returns `false` if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.items.lock().push_back(item);
        self.inner.notify.notify_one();
        true
    }

    /// Prepend an item so it is delivered before anything already
    /// queued. Returns `false` if the queue is closed.
    pub fn push_head(&self, item: T) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.items.lock().push_front(item);
        self.inner.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.items.lock().pop_front()
    }

    /// Wait for the next item. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.take_one() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Wait at most `wait` for the next item.
    pub async fn timedpop(&self, wait: Duration) -> Option<T> {
        tokio::time::timeout(wait, self.pop()).await.ok().flatten()
    }

    fn take_one(&self) -> Option<T> {
        let mut items = self.inner.items.lock();
        let item = items.pop_front();
        if item.is_some() && !items.is_empty() {
            // keep other waiting consumers moving
            self.inner.notify.notify_one();
        }
        item
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    /// Close the queue: pending `pop`s drain what is left, then return
    /// `None`; further pushes are rejected.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        AsyncQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order() {
        let q = AsyncQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(2));
        assert_eq!(q.pop().await, Some(3));
    }

    #[tokio::test]
    async fn push_head_takes_priority() {
        let q = AsyncQueue::new();
        q.push(1);
        q.push(2);
        q.push_head(0);
        assert_eq!(q.pop().await, Some(0));
        assert_eq!(q.pop().await, Some(1));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = AsyncQueue::new();
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::task::yield_now().await;
        q.push(42);
        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn timedpop_expires() {
        let q: AsyncQueue<u32> = AsyncQueue::new();
        let got = q.timedpop(Duration::from_millis(10)).await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = AsyncQueue::new();
        q.push(7);
        q.close();
        assert!(!q.push(8));
        assert_eq!(q.pop().await, Some(7));
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn close_unblocks_waiters() {
        let q: AsyncQueue<u32> = AsyncQueue::new();
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::task::yield_now().await;
        q.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn two_consumers_both_served() {
        let q = AsyncQueue::new();
        let a = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        let b = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::task::yield_now().await;
        q.push(1);
        q.push(2);
        let mut got = vec![a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }
}
