//! Connection supervision
//!
//! The [`ConnectionSupervisor`] owns the session for its whole life: it obtains credentials,
//! connects, watches for drops and reconnects under [`BackoffPolicy`]. Everything else only
//! asks it whether a session is up and sends through it.

pub mod backoff;
pub mod events;
pub mod supervisor;

pub use backoff::{Backoff, BackoffPolicy};
pub use events::ConnectionEvent;
pub use supervisor::ConnectionSupervisor;
