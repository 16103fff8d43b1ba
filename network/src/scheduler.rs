// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deadline scheduler for delayed retries
//!
//! Items are kept in a min-heap ordered by deadline. A single loop sleeps
//! until the nearest deadline, or indefinitely when the heap is empty, and
//! wakes early whenever a new item is queued. Deadlines use the tokio clock
//! so the loop follows a paused clock in tests.

use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Entry<T> {
    deadline: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct SchedulerInner<T> {
    queue: Mutex<BinaryHeap<Reverse<Entry<T>>>>,
    wake: Notify,
    seq: AtomicU64,
}

/// Fires queued items once their delay has elapsed
pub struct RetryScheduler<T> {
    inner: Arc<SchedulerInner<T>>,
}

impl<T> Clone for RetryScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for RetryScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> RetryScheduler<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue: Mutex::new(BinaryHeap::new()),
                wake: Notify::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `item` to fire after `delay`; returns its deadline
    pub fn schedule(&self, item: T, delay: Duration) -> Instant {
        let deadline = Instant::now() + delay;
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.queue.lock().push(Reverse(Entry {
            deadline,
            seq,
            item,
        }));
        // stores a permit if the loop is not waiting right now
        self.inner.wake.notify_one();
        deadline
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nearest queued deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.queue.lock().peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Spawn the scheduling loop, emitting due items on `out`
    pub fn spawn(&self, out: mpsc::UnboundedSender<T>, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run(out, cancel).await })
    }

    async fn run(self, out: mpsc::UnboundedSender<T>, cancel: CancellationToken) {
        tracing::debug!("Retry scheduler started");
        loop {
            let next = self.next_deadline();
            let sleep = async move {
                match next {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = sleep => {}
            }

            for item in self.take_due(Instant::now()) {
                if out.send(item).is_err() {
                    tracing::debug!("Retry scheduler output closed");
                    return;
                }
            }
        }
        tracing::debug!("Retry scheduler stopped");
    }

    fn take_due(&self, now: Instant) -> Vec<T> {
        let mut queue = self.inner.queue.lock();
        let mut due = Vec::new();
        while queue
            .peek()
            .map(|Reverse(entry)| entry.deadline <= now)
            .unwrap_or(false)
        {
            if let Some(Reverse(entry)) = queue.pop() {
                due.push(entry.item);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_nearest_deadline_fires_first() {
        let scheduler = RetryScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        scheduler.schedule("slow", Duration::from_millis(300));
        scheduler.schedule("fast", Duration::from_millis(100));
        scheduler.spawn(tx, cancel.clone());

        assert_eq!(rx.recv().await, Some("fast"));
        let fired_at = start.elapsed();
        assert!(fired_at >= Duration::from_millis(100));
        assert!(fired_at < Duration::from_millis(110));
        assert!(rx.try_recv().is_err());

        assert_eq!(rx.recv().await, Some("slow"));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(scheduler.is_empty());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_item_wakes_idle_loop() {
        let scheduler = RetryScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        scheduler.spawn(tx, cancel.clone());

        // let the loop park with an empty heap
        tokio::time::sleep(Duration::from_secs(5)).await;
        let start = Instant::now();
        scheduler.schedule(7u64, Duration::from_millis(50));

        assert_eq!(rx.recv().await, Some(7));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(60));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_deadline_keeps_queue_order() {
        let scheduler = RetryScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        scheduler.schedule(1, Duration::from_millis(20));
        scheduler.schedule(2, Duration::from_millis(20));
        scheduler.spawn(tx, cancel.clone());

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        cancel.cancel();
    }
}
