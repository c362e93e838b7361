//! Event message types and topic construction
//!
//! This module defines the payload applications send and how its routing key maps to an
//! outbound broker topic.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
