use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

use crate::model::UserRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub user_request: UserRequest,
}

impl QueueItem {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            user_request: UserRequest { data },
        }
    }
}

/// Bounded lock-free buffer between the producers and the batcher.
///
/// Items move in on `try_push` and out on `pop_batch`, neither call blocks.
pub struct StagingQueue {
    items: ArrayQueue<QueueItem>,
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl StagingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    /// Hands the item back when the queue is full.
    pub fn try_push(&self, item: QueueItem) -> Result<(), QueueItem> {
        // counted before the push so a racing pop never observes popped > pushed
        self.pushed.fetch_add(1, Ordering::SeqCst);
        self.items.push(item).map_err(|rejected| {
            self.pushed.fetch_sub(1, Ordering::SeqCst);
            rejected
        })
    }

    /// Takes up to `max` items. Returns an empty vec when there is nothing to take.
    pub fn pop_batch(&self, max: usize) -> Vec<QueueItem> {
        let mut batch = Vec::with_capacity(max.min(self.items.len()));
        while batch.len() < max {
            match self.items.pop() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        self.popped.fetch_add(batch.len() as u64, Ordering::SeqCst);
        batch
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::SeqCst)
    }

    pub fn popped_count(&self) -> u64 {
        self.popped.load(Ordering::SeqCst)
    }
}
