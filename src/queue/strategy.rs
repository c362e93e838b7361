//! FIFO and LIFO queue strategies
//!
//! Both are a `VecDeque` behind a `std::sync::Mutex`: every operation is short and
//! non-blocking, so an async mutex would only add overhead. Lock poisoning is recovered
//! because the deque is never left half-modified.

use super::envelope::Envelope;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Which end of the backlog is dispatched first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Arrival order
    #[default]
    Fifo,
    /// Freshest first; old events may starve under sustained backlog
    Lifo,
}

/// Returned by a bounded queue that is at capacity. Hands the envelope back.
#[derive(Debug, Error)]
#[error("queue is full (capacity {capacity})")]
pub struct QueueFull {
    pub capacity: usize,
    pub envelope: Envelope,
}

/// Thread-safe container of envelopes pending dispatch
///
/// `count` and `is_empty` are point-in-time snapshots; each individual call is atomic.
pub trait QueueStrategy: Send + Sync {
    /// Insert an envelope. Never blocks; only fails when a capacity bound is configured.
    fn enqueue(&self, envelope: Envelope) -> Result<(), QueueFull>;

    /// Remove the next envelope according to the strategy's ordering
    fn try_dequeue(&self) -> Option<Envelope>;

    /// Return a dequeued envelope so it is the next one handed out. Ignores capacity.
    fn requeue(&self, envelope: Envelope);

    fn count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn capacity(&self) -> Option<usize>;

    fn kind(&self) -> QueueKind;
}

#[derive(Debug)]
struct Backlog {
    items: Mutex<VecDeque<Envelope>>,
    capacity: Option<usize>,
}

impl Backlog {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_back(&self, envelope: Envelope) -> Result<(), QueueFull> {
        let mut items = self.lock();
        if let Some(capacity) = self.capacity {
            if items.len() >= capacity {
                return Err(QueueFull { capacity, envelope });
            }
        }
        items.push_back(envelope);
        Ok(())
    }
}

/// First in, first out
#[derive(Debug)]
pub struct FifoQueue {
    backlog: Backlog,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            backlog: Backlog::new(capacity),
        }
    }
}

impl Default for FifoQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueStrategy for FifoQueue {
    fn enqueue(&self, envelope: Envelope) -> Result<(), QueueFull> {
        self.backlog.push_back(envelope)
    }

    fn try_dequeue(&self) -> Option<Envelope> {
        self.backlog.lock().pop_front()
    }

    fn requeue(&self, envelope: Envelope) {
        self.backlog.lock().push_front(envelope);
    }

    fn count(&self) -> usize {
        self.backlog.lock().len()
    }

    fn capacity(&self) -> Option<usize> {
        self.backlog.capacity
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Fifo
    }
}

/// Last in, first out
#[derive(Debug)]
pub struct LifoQueue {
    backlog: Backlog,
}

impl LifoQueue {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            backlog: Backlog::new(capacity),
        }
    }
}

impl Default for LifoQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueStrategy for LifoQueue {
    fn enqueue(&self, envelope: Envelope) -> Result<(), QueueFull> {
        self.backlog.push_back(envelope)
    }

    fn try_dequeue(&self) -> Option<Envelope> {
        self.backlog.lock().pop_back()
    }

    fn requeue(&self, envelope: Envelope) {
        self.backlog.lock().push_back(envelope);
    }

    fn count(&self) -> usize {
        self.backlog.lock().len()
    }

    fn capacity(&self) -> Option<usize> {
        self.backlog.capacity
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Lifo
    }
}

/// Construct the configured strategy
pub fn build_queue(kind: QueueKind, capacity: Option<usize>) -> Arc<dyn QueueStrategy> {
    match kind {
        QueueKind::Fifo => Arc::new(FifoQueue::with_capacity(capacity)),
        QueueKind::Lifo => Arc::new(LifoQueue::with_capacity(capacity)),
    }
}
