//! In-memory backlog of events waiting for dispatch
//!
//! The facade is the only producer and the dispatch loop the only consumer. Nothing here
//! survives a process restart; a durable store can be plugged in by implementing
//! [`QueueStrategy`].

pub mod envelope;
pub mod strategy;

pub use envelope::{DeliveryCallback, DeliveryReceipt, Envelope};
pub use strategy::{build_queue, FifoQueue, LifoQueue, QueueFull, QueueKind, QueueStrategy};
