//! The per-caller front-end bound to one target location.

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::arena::Arena;
use crate::config;
use crate::error::AllocError;
use crate::location::Location;
use crate::reservoir;

/// A per-caller (typically per-thread) front-end owning a sequence of arenas
/// drawn from the global reservoir for one [`Location`].
pub struct Pool {
    target: Location,
    local: RwLock<Vec<Arc<Arena>>>,
}

impl Pool {
    /// `gpu < 0` selects `Host`; `gpu ∈ [0, D)` selects `Device(gpu)`. Fails
    /// with `InvalidDevice` if `gpu` is out of range for either the build
    /// constant `D_MAX` or the installed driver's `device_count`.
    pub fn new(gpu: i32) -> Result<Self, AllocError> {
        if gpu >= 0 {
            let driver = crate::driver::installed();
            let count = driver.device_count().min(config::D_MAX);
            if gpu as u32 >= count {
                return Err(AllocError::InvalidDevice { gpu });
            }
        }

        Ok(Self { target: Location::from_gpu_index(gpu), local: RwLock::new(Vec::new()) })
    }

    pub fn target(&self) -> Location {
        self.target
    }

    pub fn arena_count(&self) -> usize {
        self.local.read().len()
    }

    /// Sum of `used_bytes` across every local arena; a debug/metrics
    /// accessor, not part of the allocation path.
    pub fn used_bytes(&self) -> u64 {
        self.local.read().iter().map(|a| a.used_bytes()).sum()
    }

    /// Allocates `size` bytes with no alignment constraint. Equivalent to
    /// `alloc_aligned(size, 1)`.
    pub fn alloc(&self, size: u64) -> Option<NonNull<u8>> {
        self.alloc_aligned(size, 1)
    }

    /// Scan-grow-scan: try every local arena, then pull a fresh one from the
    /// reservoir and retry.
    pub fn alloc_aligned(&self, size: u64, alignment: u64) -> Option<NonNull<u8>> {
        if size > (1u64 << config::ARENA_LEVEL) || config::arena_cap(self.target) == 0 {
            return None;
        }

        loop {
            let seen;
            {
                let local = self.local.read();
                seen = local.len();
                for arena in local.iter() {
                    if let Some(ptr) = arena.alloc_aligned(size, alignment) {
                        return Some(ptr);
                    }
                }
            }

            match reservoir::get_block(self.target) {
                Some(arena) => {
                    self.local.write().push(arena);
                    // retry: the new arena (or room freed by another thread
                    // meanwhile) may now satisfy the request
                }
                None => {
                    // another thread may have grown `local` between our scan
                    // and the failed reservoir call; only give up if not
                    if self.local.read().len() == seen {
                        return None;
                    }
                }
            }
        }
    }

    /// Routes the free to whichever local arena contains `ptr`.
    pub fn free(&self, ptr: Option<NonNull<u8>>) -> bool {
        let Some(p) = ptr else { return true };
        let local = self.local.read();
        for arena in local.iter() {
            if arena.contains(p) {
                return arena.free(Some(p));
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.local.read().iter().all(|a| a.is_empty())
    }

    /// Synchronizes once via any arena, then drains every now-empty arena
    /// back to the global reservoir. Non-empty arenas stay attached: that's
    /// safe at the allocator level, but leaks those arenas against the
    /// location's cap until process exit.
    pub fn release(&self) {
        let mut local = self.local.write();
        drain(&mut local);
    }
}

fn drain(local: &mut Vec<Arc<Arena>>) {
    if let Some(first) = local.first() {
        if let Err(e) = first.sync() {
            log::error!("device stream sync failed while releasing pool: {e}");
        }
    }

    let mut i = 0;
    while i < local.len() {
        if local[i].is_empty() {
            let arena = local.swap_remove(i);
            reservoir::return_block(arena);
        } else {
            i += 1;
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let local = self.local.get_mut();
        if local.iter().any(|a| !a.is_empty()) {
            log::warn!(
                "pool for {} dropped with live allocations; affected arenas will leak",
                self.target
            );
        }
        drain(local);
    }
}

/// Process-wide pool-size configuration.
pub fn set_device_pool_size(gpu: u32, level: u8) {
    config::set_level_max(Location::Device(gpu), level);
}

pub fn set_host_pool_size(level: u8) {
    config::set_level_max(Location::Host, level);
}

/// Destroys cached empty arenas for `gpu`'s location (`gpu < 0` selects
/// `Host`).
pub fn release_global_pool(gpu: i32) {
    reservoir::clear(Location::from_gpu_index(gpu));
}

/// Number of arenas currently cached (empty, not yet destroyed) for `gpu`'s
/// location.
pub fn cached_arena_count(gpu: i32) -> usize {
    reservoir::cached_count(Location::from_gpu_index(gpu))
}

/// Number of arenas currently charged against `gpu`'s location cap, whether
/// cached or on loan to a pool.
pub fn outstanding_arena_count(gpu: i32) -> u64 {
    reservoir::outstanding_count(Location::from_gpu_index(gpu))
}
