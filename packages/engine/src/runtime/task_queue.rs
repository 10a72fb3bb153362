// packages/engine/src/runtime/task_queue.rs
//! Bounded FIFO of pending tasks
//!
//! Producers never block: a push into a full queue hands the item back.
//! The consumer side awaits a [`Notify`] when the queue is empty.

use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Lock-free bounded queue with an async pop
pub struct TaskQueue<T> {
    queue: ArrayQueue<T>,

    /// Signalled on every successful push
    ready: Notify,

    push_count: AtomicU64,
    pop_count: AtomicU64,

    /// Pushes refused because the queue was full
    reject_count: AtomicU64,
}

impl<T> TaskQueue<T> {
    /// Create a queue holding at most `capacity` items
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            ready: Notify::new(),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            reject_count: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking; a full queue returns the item
    pub fn push(&self, item: T) -> Result<(), T> {
        match self.queue.push(item) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                self.ready.notify_one();
                Ok(())
            }
            Err(item) => {
                self.reject_count.fetch_add(1, Ordering::Relaxed);
                Err(item)
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Wait for the oldest item
    ///
    /// Meant for a single consumer. Cancel safe: dropping the future never
    /// loses an item.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.ready.notified().await;
        }
    }

    /// Take everything currently queued, oldest first
    pub fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.try_pop()).collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            reject_count: self.reject_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub push_count: u64,
    pub pop_count: u64,
    pub reject_count: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    /// Calculate fill percentage
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }
}
