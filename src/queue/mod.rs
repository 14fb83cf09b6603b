//! # Publish Queue
//!
//! Bounded FIFO buffer sitting between sample production and network transmission.
//! Producers call [`PublishQueue::enqueue`] from the sample pump; the drain loop is the
//! single consumer and pulls batches with [`PublishQueue::recv_batch`].
//!
//! ```text
//! SampleSource ──enqueue──► [ head ... tail ] ──recv_batch──► BrokerConnection
//!                              (capacity N)
//! ```
//!
//! The queue owns the backpressure policy. With [`OverflowPolicy::DropOldest`] a full
//! queue evicts its head so the freshest position always gets through; with
//! [`OverflowPolicy::Block`] the producer waits for space up to a timeout.
//!
//! All state sits behind one mutex that is never held across an `.await`, so neither
//! side can observe a half-applied operation.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Behaviour of [`PublishQueue::enqueue`] when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the head, then append
    #[default]
    DropOldest,
    /// Wait for space, bounded by the block timeout
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full")]
    Full,

    #[error("Queue is empty")]
    Empty,
}

/// Outcome of a successful enqueue
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued<T> {
    Appended,
    /// The item was appended after evicting the returned head
    Evicted(T),
}

pub struct PublishQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    block_timeout: Duration,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> PublishQueue<T> {
    /// Creates an empty queue. A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: OverflowPolicy, block_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        debug!(
            "Creating publish queue: capacity={}, policy={:?}, block_timeout={:?}",
            capacity, policy, block_timeout
        );
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            block_timeout,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Appends `item` at the tail, applying the overflow policy when full.
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`] under [`OverflowPolicy::Block`] when no space frees up within
    /// the block timeout. The rejected item is dropped.
    pub async fn enqueue(&self, item: T) -> Result<Enqueued<T>, QueueError> {
        match self.policy {
            OverflowPolicy::DropOldest => Ok(self.push_evicting(item)),
            OverflowPolicy::Block => {
                let deadline = tokio::time::Instant::now() + self.block_timeout;
                let mut item = item;
                loop {
                    // Register before checking so a concurrent drain cannot slip between.
                    let space = self.not_full.notified();
                    match self.try_push(item) {
                        Ok(()) => return Ok(Enqueued::Appended),
                        Err(rejected) => item = rejected,
                    }
                    if tokio::time::timeout_at(deadline, space).await.is_err() {
                        warn!(
                            "Publish queue still full after {:?}, rejecting item",
                            self.block_timeout
                        );
                        return Err(QueueError::Full);
                    }
                }
            }
        }
    }

    /// Removes the head without waiting.
    pub fn try_dequeue(&self) -> Result<T, QueueError> {
        let item = self.lock().pop_front().ok_or(QueueError::Empty)?;
        self.not_full.notify_waiters();
        Ok(item)
    }

    /// Removes the head, waiting until one is available.
    pub async fn dequeue(&self) -> T {
        loop {
            let ready = self.not_empty.notified();
            if let Ok(item) = self.try_dequeue() {
                return item;
            }
            ready.await;
        }
    }

    /// Removes up to `max` items from the head in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let batch: Vec<T> = {
            let mut items = self.lock();
            let count = max.min(items.len());
            items.drain(..count).collect()
        };
        if !batch.is_empty() {
            self.not_full.notify_waiters();
        }
        batch
    }

    /// Waits until the queue is non-empty, then drains up to `max` items.
    pub async fn recv_batch(&self, max: usize) -> Vec<T> {
        let max = max.max(1);
        loop {
            let ready = self.not_empty.notified();
            let batch = self.drain(max);
            if !batch.is_empty() {
                return batch;
            }
            ready.await;
        }
    }

    /// Puts an item back at the head for another attempt.
    ///
    /// When the queue is full nothing is inserted and `item` is handed back, so the
    /// queue never grows past capacity.
    pub fn requeue_front(&self, item: T) -> Option<T> {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Some(item);
            }
            items.push_front(item);
        }
        self.not_empty.notify_waiters();
        None
    }

    /// Drops every queued item and returns how many were removed.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut items = self.lock();
            let removed = items.len();
            items.clear();
            removed
        };
        if removed > 0 {
            debug!("Cleared {} items from publish queue", removed);
            self.not_full.notify_waiters();
        }
        removed
    }

    fn push_evicting(&self, item: T) -> Enqueued<T> {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.not_empty.notify_waiters();
        match evicted {
            Some(old) => {
                debug!("Publish queue full, evicted oldest item");
                Enqueued::Evicted(old)
            }
            None => Enqueued::Appended,
        }
    }

    fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.not_empty.notify_waiters();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue(capacity: usize, policy: OverflowPolicy) -> PublishQueue<u32> {
        PublishQueue::new(capacity, policy, Duration::from_millis(500))
    }

    #[tokio::test]
    async fn drop_oldest_evicts_head_when_full() {
        let q = queue(3, OverflowPolicy::DropOldest);
        for i in 0..3 {
            assert_eq!(q.enqueue(i).await, Ok(Enqueued::Appended));
        }
        assert_eq!(q.enqueue(3).await, Ok(Enqueued::Evicted(0)));
        assert_eq!(q.len(), 3);
        assert_eq!(q.drain(10), vec![1, 2, 3]);
    }

    #[test]
    fn try_dequeue_on_empty_queue_fails() {
        let q = queue(2, OverflowPolicy::DropOldest);
        assert_eq!(q.try_dequeue(), Err(QueueError::Empty));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let q = queue(0, OverflowPolicy::DropOldest);
        assert_eq!(q.capacity(), 1);
    }

    #[tokio::test]
    async fn drain_respects_max_and_order() {
        let q = queue(10, OverflowPolicy::DropOldest);
        for i in 0..5 {
            q.enqueue(i).await.unwrap();
        }
        assert_eq!(q.drain(2), vec![0, 1]);
        assert_eq!(q.drain(0), Vec::<u32>::new());
        assert_eq!(q.drain(10), vec![2, 3, 4]);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn block_policy_times_out_with_queue_full() {
        let q = queue(1, OverflowPolicy::Block);
        q.enqueue(1).await.unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(q.enqueue(2).await, Err(QueueError::Full));
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(q.drain(10), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn block_policy_resumes_when_space_frees() {
        let q = Arc::new(queue(1, OverflowPolicy::Block));
        q.enqueue(1).await.unwrap();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.enqueue(2).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(q.try_dequeue(), Ok(1));

        assert_eq!(producer.await.unwrap(), Ok(Enqueued::Appended));
        assert_eq!(q.try_dequeue(), Ok(2));
    }

    #[tokio::test]
    async fn dequeue_waits_for_producer() {
        let q = Arc::new(queue(4, OverflowPolicy::DropOldest));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue().await })
        };
        tokio::task::yield_now().await;
        q.enqueue(7).await.unwrap();
        assert_eq!(consumer.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn recv_batch_returns_available_items() {
        let q = Arc::new(queue(8, OverflowPolicy::DropOldest));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.recv_batch(4).await })
        };
        tokio::task::yield_now().await;
        q.enqueue(1).await.unwrap();
        let batch = consumer.await.unwrap();
        assert!(!batch.is_empty());
        assert_eq!(batch[0], 1);
    }

    #[tokio::test]
    async fn requeue_front_restores_head() {
        let q = queue(3, OverflowPolicy::DropOldest);
        q.enqueue(2).await.unwrap();
        q.enqueue(3).await.unwrap();
        assert_eq!(q.requeue_front(1), None);
        assert_eq!(q.drain(3), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn requeue_front_on_full_queue_hands_item_back() {
        let q = queue(2, OverflowPolicy::DropOldest);
        q.enqueue(2).await.unwrap();
        q.enqueue(3).await.unwrap();
        assert_eq!(q.requeue_front(1), Some(1));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn clear_empties_queue() {
        let q = queue(4, OverflowPolicy::DropOldest);
        q.enqueue(1).await.unwrap();
        q.enqueue(2).await.unwrap();
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
        assert_eq!(q.clear(), 0);
    }
}
