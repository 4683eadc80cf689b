//! Bounded priority queue feeding the worker loops.
//!
//! Ordering key is (priority rank, monotonic submission sequence): priority
//! alone is not a total order, so the sequence number guarantees FIFO among
//! equal priorities. Entries carry task ids only — the task manager owns the
//! tasks themselves.
//!
//! Shutdown is sentinel-based: one [`QueueItem::Shutdown`] per worker,
//! ordered ahead of every task and exempt from the capacity bound so that
//! teardown can never block on a full queue.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{SchedulerError, ValidationError};
use crate::task::{Priority, TaskId};

/// What a worker receives from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueItem {
    /// A ready task to execute.
    Task { id: TaskId, priority: Priority },
    /// Unblocks exactly one worker and tells it to exit.
    Shutdown,
}

#[derive(Debug)]
struct Entry {
    item: QueueItem,
    seq: u64,
}

impl Entry {
    /// Max-heap key: sentinels first, then most urgent priority, then
    /// earliest submission.
    fn sort_key(&self) -> (u8, Reverse<u8>, Reverse<u64>) {
        match self.item {
            QueueItem::Shutdown => (1, Reverse(0), Reverse(self.seq)),
            QueueItem::Task { priority, .. } => (0, Reverse(priority.rank()), Reverse(self.seq)),
        }
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Bounded, priority-ordered task queue.
pub(crate) struct TaskQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    /// Entries available to pop.
    items: Semaphore,
    /// Free capacity for task entries.
    slots: Semaphore,
    seq: AtomicU64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            items: Semaphore::new(0),
            slots: Semaphore::new(capacity),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of task entries currently queued.
    pub fn len(&self) -> usize {
        self.heap
            .lock()
            .expect("queue lock poisoned")
            .iter()
            .filter(|e| matches!(e.item, QueueItem::Task { .. }))
            .count()
    }

    /// Enqueue a ready task. Blocks while the queue is at capacity; with
    /// `wait` set, gives up after that long and reports the queue as full.
    pub async fn push(
        &self,
        id: TaskId,
        priority: Priority,
        wait: Option<Duration>,
    ) -> Result<(), SchedulerError> {
        let permit = match wait {
            Some(wait) => tokio::time::timeout(wait, self.slots.acquire())
                .await
                .map_err(|_| ValidationError::QueueFull(wait))?,
            None => self.slots.acquire().await,
        };
        let permit = permit.map_err(|_| SchedulerError::QueueClosed)?;
        permit.forget();

        self.push_entry(QueueItem::Task { id, priority });
        Ok(())
    }

    /// Enqueue a shutdown sentinel. Exempt from the capacity bound — used
    /// only during teardown, which must never block on backpressure.
    pub fn push_sentinel(&self) {
        self.push_entry(QueueItem::Shutdown);
    }

    fn push_entry(&self, item: QueueItem) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap
            .lock()
            .expect("queue lock poisoned")
            .push(Entry { item, seq });
        self.items.add_permits(1);
    }

    /// Wait for the next entry in priority order. Returns `None` once the
    /// queue has been closed and no wakeup is coming.
    pub async fn pop(&self) -> Option<QueueItem> {
        let permit = self.items.acquire().await.ok()?;
        permit.forget();

        let entry = self
            .heap
            .lock()
            .expect("queue lock poisoned")
            .pop()
            .expect("items permit without a queued entry");
        if matches!(entry.item, QueueItem::Task { .. }) {
            self.slots.add_permits(1);
        }
        Some(entry.item)
    }

    /// Close both semaphores, releasing every blocked producer and consumer.
    /// Called at the end of shutdown so a worker stuck pushing re-enqueued
    /// work (or a submitter stuck on a full queue) cannot wedge teardown.
    pub fn close(&self) {
        self.items.close();
        self.slots.close();
    }
}
