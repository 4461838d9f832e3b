//! `memsync-core` — shared building blocks for the write queue.
//!
//! This crate holds the pure primitives (identifiers, time source, errors) that
//! the queue crate builds on. It has no I/O and no async runtime dependency.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::EntryId;
