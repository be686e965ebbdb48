//! Target locations an arena or pool may be bound to.

use std::fmt;

/// Where a block of memory lives: pinned host (CPU) memory, or a specific
/// GPU device's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Host,
    Device(u32),
}

impl Location {
    /// Parses the `pool_new(gpu: int)` convention: negative selects `Host`,
    /// non-negative selects `Device(gpu)`. The caller is responsible for
    /// validating the device index against `D_MAX`/`device_count`.
    pub(crate) fn from_gpu_index(gpu: i32) -> Self {
        if gpu < 0 {
            Location::Host
        } else {
            Location::Device(gpu as u32)
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => write!(f, "host"),
            Location::Device(d) => write!(f, "device {d}"),
        }
    }
}
