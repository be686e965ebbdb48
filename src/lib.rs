//! A two-tier allocator for GPU-accelerated workloads: a binary buddy
//! allocator (`arena`) over a single contiguous region, fronted by a
//! per-caller pool (`pool`) that multiplexes and caches arenas through a
//! process-wide reservoir.
//!
//! Typical use: construct one [`pool::Pool`] per thread (or per logical
//! caller) bound to a [`location::Location`], call `alloc`/`free` on it, and
//! let it drop when the caller is done. The pool pulls arenas from, and
//! returns them to, a reservoir shared by every pool targeting the same
//! location. An [`Arena`](arena::Arena) can also be used directly without a
//! pool for callers that want to own exactly one region.

pub mod arena;
pub mod config;
pub mod driver;
pub mod error;
pub mod location;
pub mod pool;
mod reservoir;

pub use arena::Arena;
pub use driver::{install as install_driver, DeviceDriver, DriverError};
pub use error::AllocError;
pub use location::Location;
pub use pool::Pool;
