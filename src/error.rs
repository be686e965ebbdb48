//! Error types for the allocator's construction and fatal paths.
//!
//! The recoverable allocate/free paths (out of memory, pool cap exceeded,
//! free-side misuse) are not represented here: per the allocator's error
//! policy they return `Option`/`bool` and log through the [`log`] facade
//! instead of propagating a `Result`. See [`crate::driver`] for the
//! collaborator-side [`DriverError`].

use crate::driver::DriverError;

/// Errors surfaced by construction (`Arena::new`, `Pool::new`) and by the
/// fatal, unrecoverable driver-side free path.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("arena level {level} out of range [1, 32]")]
    LevelOutOfRange { level: u8 },

    #[error("invalid device index {gpu}")]
    InvalidDevice { gpu: i32 },

    #[error("driver allocation failed: {0}")]
    DriverOOM(#[source] DriverError),

    #[error("fatal driver error on free path: {0}")]
    DriverFatal(#[source] DriverError),
}
