//! Testing utilities and mock implementations
//!
//! Mocks for the session and credential seams, so the delivery pipeline can be driven
//! without a broker or an identity provider.

pub mod mocks;

pub use mocks::*;
