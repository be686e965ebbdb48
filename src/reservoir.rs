//! The process-wide, per-location cache of empty arenas.
//!
//! One reservoir exists per [`Location`] (one per device index, plus one for
//! host), created lazily on first access and never destroyed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::arena::Arena;
use crate::config;
use crate::location::Location;

struct ReservoirState {
    free_arenas: VecDeque<Arc<Arena>>,
    /// Arenas charged against the location's cap, whether sitting in
    /// `free_arenas` or out on loan to a pool. Only `clear` decrements this;
    /// `return_block` deliberately does not: cached arenas still count
    /// against the budget.
    allocated_count: u64,
}

struct Reservoir {
    state: Mutex<ReservoirState>,
}

static RESERVOIRS: Lazy<RwLock<HashMap<Location, Arc<Reservoir>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn reservoir_for(location: Location) -> Arc<Reservoir> {
    if let Some(r) = RESERVOIRS.read().get(&location) {
        return r.clone();
    }
    RESERVOIRS
        .write()
        .entry(location)
        .or_insert_with(|| {
            Arc::new(Reservoir {
                state: Mutex::new(ReservoirState { free_arenas: VecDeque::new(), allocated_count: 0 }),
            })
        })
        .clone()
}

/// Pops a cached arena, or constructs a fresh one at [`config::ARENA_LEVEL`]
/// if the location's cap allows it. Returns `None` (and logs) if the driver
/// allocation fails or the cap is already exhausted.
pub(crate) fn get_block(location: Location) -> Option<Arc<Arena>> {
    let reservoir = reservoir_for(location);
    let mut state = reservoir.state.lock();

    if let Some(arena) = state.free_arenas.pop_front() {
        return Some(arena);
    }

    let cap = config::arena_cap(location);
    if state.allocated_count >= cap {
        log::warn!("{location} pool full, increase size");
        return None;
    }

    match Arena::new(config::ARENA_LEVEL, location) {
        Ok(arena) => {
            state.allocated_count += 1;
            Some(Arc::new(arena))
        }
        Err(e) => {
            log::warn!("driver allocation failed constructing arena for {location}: {e}");
            None
        }
    }
}

/// Returns an emptied arena to the cache. Precondition: `arena.is_empty()`.
pub(crate) fn return_block(arena: Arc<Arena>) {
    debug_assert!(arena.is_empty(), "return_block precondition violated: arena is not empty");
    let reservoir = reservoir_for(arena.location());
    reservoir.state.lock().free_arenas.push_back(arena);
}

/// Destroys every cached (not outstanding) arena for `location`, releasing
/// driver memory and decrementing `allocated_count` accordingly. Arenas
/// still held by pools are unaffected.
pub(crate) fn clear(location: Location) {
    let reservoir = reservoir_for(location);
    let mut state = reservoir.state.lock();
    let destroyed = state.free_arenas.len() as u64;
    state.free_arenas.clear();
    state.allocated_count = state.allocated_count.saturating_sub(destroyed);
}

pub(crate) fn cached_count(location: Location) -> usize {
    reservoir_for(location).state.lock().free_arenas.len()
}

pub(crate) fn outstanding_count(location: Location) -> u64 {
    reservoir_for(location).state.lock().allocated_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    // starts well above the range pool.rs's tests claim, avoiding collisions
    // in the fixed-size `DEVICE_LEVEL_MAX` config array.
    static NEXT_DEVICE: AtomicU32 = AtomicU32::new(100);

    fn fresh_location(cap_shift: u8) -> Location {
        let d = NEXT_DEVICE.fetch_add(1, Ordering::Relaxed);
        let location = Location::Device(d);
        config::set_level_max(location, config::ARENA_LEVEL + cap_shift);
        location
    }

    #[test]
    fn get_block_constructs_until_cap_then_refuses() {
        let location = fresh_location(1);
        let a = get_block(location).expect("first arena within cap");
        let b = get_block(location).expect("second arena within cap");
        assert!(get_block(location).is_none());
        assert_eq!(outstanding_count(location), 2);
        return_block(a);
        return_block(b);
    }

    #[test]
    fn return_block_reuses_before_constructing() {
        let location = fresh_location(1);
        let a = get_block(location).unwrap();
        let addr = Arc::as_ptr(&a) as usize;
        return_block(a);
        assert_eq!(cached_count(location), 1);
        let reused = get_block(location).unwrap();
        assert_eq!(Arc::as_ptr(&reused) as usize, addr);
        assert_eq!(cached_count(location), 0);
        assert_eq!(outstanding_count(location), 1);
        return_block(reused);
    }

    #[test]
    fn return_block_does_not_decrement_allocated_count() {
        let location = fresh_location(0);
        let a = get_block(location).unwrap();
        return_block(a);
        assert_eq!(outstanding_count(location), 1);
    }

    #[test]
    fn clear_destroys_cached_arenas_and_decrements_count() {
        let location = fresh_location(1);
        let a = get_block(location).unwrap();
        return_block(a);
        assert_eq!(outstanding_count(location), 1);
        clear(location);
        assert_eq!(cached_count(location), 0);
        assert_eq!(outstanding_count(location), 0);
    }
}
