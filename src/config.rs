//! Process-wide configuration: the two size exponents governing pool caps.
//!
//! No environment variables, no on-disk state — just a pair of atomics set
//! at most once before the first allocation; nothing here attempts to make
//! mutation after arenas already exist thread-safe.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::location::Location;

/// `log2` of the fixed arena size the reservoir constructs (256 MiB).
pub const ARENA_LEVEL: u8 = 28;

/// Upper bound on device indices the pool/reservoir machinery will address.
pub const D_MAX: u32 = 256;

static HOST_LEVEL_MAX: AtomicU8 = AtomicU8::new(0);
static DEVICE_LEVEL_MAX: [AtomicU8; D_MAX as usize] = {
    const ZERO: AtomicU8 = AtomicU8::new(0);
    [ZERO; D_MAX as usize]
};

/// Reads the per-location budget exponent. `0` means "disabled" (the
/// default): `Reservoir::get_block` will refuse to construct any arena.
pub fn level_max(location: Location) -> u8 {
    match location {
        Location::Host => HOST_LEVEL_MAX.load(Ordering::Acquire),
        Location::Device(d) => DEVICE_LEVEL_MAX[d as usize % D_MAX as usize].load(Ordering::Acquire),
    }
}

/// Publishes `max(ARENA_LEVEL, level)` as the budget for `location`. Growing
/// is always legal; shrinking only affects future `get_block` decisions
/// (`set_max_level`).
pub fn set_level_max(location: Location, level: u8) {
    let level = level.max(ARENA_LEVEL);
    match location {
        Location::Host => HOST_LEVEL_MAX.store(level, Ordering::Release),
        Location::Device(d) => DEVICE_LEVEL_MAX[d as usize % D_MAX as usize].store(level, Ordering::Release),
    }
}

/// Arena cap for `location`: `2^(level_max - ARENA_LEVEL)`, or `0` if
/// `level_max` is `0` (uninitialized) or smaller than `ARENA_LEVEL`.
pub fn arena_cap(location: Location) -> u64 {
    let level = level_max(location);
    if level < ARENA_LEVEL {
        0
    } else {
        1u64 << (level - ARENA_LEVEL)
    }
}
