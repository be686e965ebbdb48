//! The buddy allocator's bit-packed binary-tree bookkeeping over a single
//! contiguous arena.
//!
//! Tree-node semantics: node `i` at depth `d` covers a contiguous sub-range
//! of length `2^(L-d)`. Children: left = `2i+1`, right = `2i+2`; parent =
//! `(i+1)/2 - 1`; sibling = `i + (i & 1)`. Nodes are packed two bits apiece,
//! breadth-first, into a byte array sized `2^(L-1)` for an arena of
//! `2^L` bytes.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::driver::{DeviceDriver, DriverError};
use crate::error::AllocError;
use crate::location::Location;

/// The four 2-bit states a tree node may be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Unused = 0b00,
    Used = 0b01,
    UsedWithAlignment = 0b10,
    Split = 0b11,
}

impl NodeState {
    #[inline]
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => NodeState::Unused,
            0b01 => NodeState::Used,
            0b10 => NodeState::UsedWithAlignment,
            _ => NodeState::Split,
        }
    }
}

/// Returns the smallest power of two `>= val`, treating `0` as `1`.
#[inline]
fn next_pow2(val: u64) -> u64 {
    if val <= 1 {
        1
    } else {
        1u64 << (u64::BITS - (val - 1).leading_zeros())
    }
}

/// Byte offset of node `index` at `level` within an arena of exponent `l_max`.
#[inline]
fn index_offset(index: u64, level: u32, l_max: u8) -> u64 {
    (index + 1 - (1u64 << level)) << (l_max as u32 - level)
}

/// Bit-packed 2-bits-per-node tree over `2^(l_max+1) - 1` nodes.
struct Tree {
    bits: Box<[u8]>,
}

impl Tree {
    fn new(l_max: u8) -> Self {
        // `2^(l_max-1)` bytes hold `2^(l_max+1) - 1` two-bit fields (rounded
        // up); zero-initialized, which is `NodeState::Unused` for every node.
        let len = 1usize << (l_max as u32 - 1);
        Self { bits: vec![0u8; len].into_boxed_slice() }
    }

    /// Reads the 2-bit state at `i`. Bit position is `6 - (i % 4) * 2` within
    /// `bits[i / 4]` (big-endian within the byte).
    #[inline]
    fn get(&self, i: u64) -> NodeState {
        let byte = self.bits[(i / 4) as usize];
        let shift = 6 - (i % 4) * 2;
        NodeState::from_bits((byte >> shift) & 0b11)
    }

    #[inline]
    fn set(&mut self, i: u64, state: NodeState) {
        let shift = 6 - (i % 4) * 2;
        let byte = &mut self.bits[(i / 4) as usize];
        *byte = (*byte & !(0b11 << shift)) | ((state as u8) << shift);
    }
}

struct ArenaState {
    tree: Tree,
    used_bytes: u64,
}

/// A `2^L`-byte contiguous region backed by one driver allocation, managed
/// by a buddy tree.
pub struct Arena {
    level_max: u8,
    location: Location,
    base: NonNull<u8>,
    driver: Arc<dyn DeviceDriver>,
    state: RwLock<ArenaState>,
}

// SAFETY: all mutable access to `tree`/`used_bytes` is funneled through
// `state`'s lock; `base` and `level_max` are immutable after construction.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("level_max", &self.level_max)
            .field("location", &self.location)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl Arena {
    /// Creates a new arena of `2^level` bytes backed by `location`, using
    /// the process-wide driver. Fails with `LevelOutOfRange` if `level` is
    /// not in `[1, 32]`, or `DriverOOM` if the underlying driver allocation
    /// fails.
    pub fn new(level: u8, location: Location) -> Result<Self, AllocError> {
        Self::with_driver(level, location, crate::driver::installed())
    }

    pub(crate) fn with_driver(
        level: u8,
        location: Location,
        driver: Arc<dyn DeviceDriver>,
    ) -> Result<Self, AllocError> {
        if level < 1 || level > 32 {
            return Err(AllocError::LevelOutOfRange { level });
        }

        let bytes = 1u64 << level;
        let base = match location {
            Location::Host => driver.alloc_host_pinned(bytes as usize),
            Location::Device(d) => driver.alloc_device(d, bytes as usize),
        }
        .map_err(AllocError::DriverOOM)?;

        Ok(Self {
            level_max: level,
            location,
            base,
            driver,
            state: RwLock::new(ArenaState { tree: Tree::new(level), used_bytes: 0 }),
        })
    }

    pub fn level(&self) -> u8 {
        self.level_max
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Total arena size in bytes.
    pub fn size(&self) -> u64 {
        1u64 << self.level_max
    }

    /// Synchronizes the device stream backing this arena. A no-op for host
    /// arenas.
    pub fn sync(&self) -> Result<(), DriverError> {
        match self.location {
            Location::Host => Ok(()),
            Location::Device(d) => match self.driver.stream_sync(d) {
                Ok(()) => Ok(()),
                Err(e) if e.is_unloading() => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    /// Whether `ptr` falls within `[base, base + 2^L)`. Lock-free: `base`
    /// and the arena's length are immutable after construction.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.base.as_ptr() as usize;
        let end = start + self.size() as usize;
        let p = ptr.as_ptr() as usize;
        p >= start && p < end
    }

    /// Whether every allocation in this arena has been freed.
    pub fn is_empty(&self) -> bool {
        self.state.read().used_bytes == 0
    }

    /// Sum of the nominal leaf-granularity sizes of all live allocations.
    pub fn used_bytes(&self) -> u64 {
        self.state.read().used_bytes
    }

    /// Allocates `size` bytes with no alignment constraint beyond natural
    /// placement. Equivalent to `alloc_aligned(size, 1)`.
    pub fn alloc(&self, size: u64) -> Option<NonNull<u8>> {
        self.alloc_aligned(size, 1)
    }

    /// Allocates `size` bytes at `alignment` (any value `>= 1`; `1` means
    /// unconstrained — `alignment` need not be a power of two). Returns
    /// `None` if the rounded request exceeds the arena, exceeds the 32-bit
    /// index-arithmetic cap, or no block is free.
    pub fn alloc_aligned(&self, size: u64, alignment: u64) -> Option<NonNull<u8>> {
        let size = size.max(1);
        let alignment = alignment.max(1);

        let requested = if alignment > 1 {
            size.checked_add(alignment - 1)?
        } else {
            size
        };
        // reject before `next_pow2`: for `requested > 2^63` the shift inside
        // `next_pow2` would itself overflow
        if requested > (1u64 << 32) {
            return None;
        }
        let s = next_pow2(requested);
        if s > self.size() {
            return None;
        }

        let mut state = self.state.write();
        let base_addr = self.base.as_ptr() as u64;
        let node = Self::walk_alloc(&mut state.tree, self.level_max, s)?;

        // the node's depth is purely a function of its size: `s = 2^(L-depth)`
        let depth = self.level_max - log2(s) as u8;
        let mut ptr = base_addr + index_offset(node, depth as u32, self.level_max);
        let is_aligned = alignment <= 1 || ptr % alignment == 0;
        if alignment > 1 && !is_aligned {
            // true round-up to the next multiple of `alignment`, which need
            // not be a power of two; `& !(alignment - 1)` only works for
            // power-of-two alignments and silently fails otherwise
            ptr = ptr.div_ceil(alignment) * alignment;
            state.tree.set(node, NodeState::UsedWithAlignment);
        } else {
            state.tree.set(node, NodeState::Used);
        }

        state.used_bytes += s;

        NonNull::new(ptr as *mut u8)
    }

    /// Top-down walk with explicit backtracking. Returns the claimed node's
    /// breadth-first index.
    fn walk_alloc(tree: &mut Tree, l_max: u8, s: u64) -> Option<u64> {
        let mut index = 0u64;
        let mut level = 0u32;
        let mut block_length = 1u64 << l_max;

        loop {
            if block_length == s {
                if tree.get(index) == NodeState::Unused {
                    return Some(index);
                }
                // fall through to backtrack
            } else {
                match tree.get(index) {
                    NodeState::Unused => {
                        tree.set(index, NodeState::Split);
                        tree.set(2 * index + 1, NodeState::Unused);
                        tree.set(2 * index + 2, NodeState::Unused);
                        index = 2 * index + 1;
                        level += 1;
                        block_length >>= 1;
                        continue;
                    }
                    NodeState::Split => {
                        index = 2 * index + 1;
                        level += 1;
                        block_length >>= 1;
                        continue;
                    }
                    NodeState::Used | NodeState::UsedWithAlignment => {
                        // fall through to backtrack
                    }
                }
            }

            // backtrack
            loop {
                if level == 0 {
                    return None;
                }
                if index % 2 == 1 {
                    // left child: move sideways to the sibling
                    index += 1;
                    break;
                } else {
                    // ascend
                    index = (index + 1) / 2 - 1;
                    level -= 1;
                    block_length <<= 1;
                }
            }
        }
    }

    /// Frees `ptr`. Returns `false` (no effect) if `ptr` is null, outside
    /// this arena, or fails a validity check; logs a diagnostic for the
    /// latter.
    pub fn free(&self, ptr: Option<NonNull<u8>>) -> bool {
        let Some(ptr) = ptr else {
            // freeing null is treated as silent success
            return true;
        };
        if !self.contains(ptr) {
            // not ours; expected when a pool routes across several arenas
            return false;
        }

        let mut state = self.state.write();
        let base_addr = self.base.as_ptr() as u64;
        let target = ptr.as_ptr() as u64 - base_addr;

        let mut index = 0u64;
        let mut left = 0u64;
        let mut block_length = self.size();

        loop {
            match state.tree.get(index) {
                NodeState::Unused => {
                    log::debug!("free of unallocated pointer at offset {target:#x}");
                    return false;
                }
                NodeState::Used => {
                    if left != target {
                        log::error!("cannot free pointer interior to a block at offset {target:#x}");
                        return false;
                    }
                    break;
                }
                NodeState::UsedWithAlignment => {
                    if left == target {
                        log::error!("cannot free base of a block allocated with alignment offset {target:#x}");
                        return false;
                    }
                    break;
                }
                NodeState::Split => {
                    let half = block_length / 2;
                    if target < left + half {
                        index = 2 * index + 1;
                    } else {
                        left += half;
                        index = 2 * index + 2;
                    }
                    block_length = half;
                    continue;
                }
            }
        }

        state.used_bytes -= block_length;
        Self::coalesce(&mut state.tree, index);
        true
    }

    /// Coalesces the freed node at `index` with free buddies, walking up
    /// toward the root.
    fn coalesce(tree: &mut Tree, mut index: u64) {
        while index != 0 {
            let sibling = sibling_of(index);
            if tree.get(sibling) != NodeState::Unused {
                break;
            }
            index = (index + 1) / 2 - 1;
        }

        tree.set(index, NodeState::Unused);

        // re-assert Split on every ancestor; a no-op on correct state, but
        // kept rather than elided so corruption upstream doesn't silently
        // propagate as a falsely-clean tree.
        let mut i = index;
        while i != 0 {
            i = (i + 1) / 2 - 1;
            tree.set(i, NodeState::Split);
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Location::Device(d) = self.location {
            if let Err(e) = self.driver.stream_sync(d) {
                if !e.is_unloading() {
                    log::error!("stream sync failed while destroying arena on {}: {e}", self.location);
                }
            }
        }

        let bytes = self.size() as usize;
        let result = match self.location {
            Location::Host => self.driver.free_host_pinned(self.base, bytes),
            Location::Device(d) => self.driver.free_device(d, self.base, bytes),
        };
        if let Err(e) = result {
            log::error!("fatal driver error freeing arena on {}: {e}", self.location);
            std::process::abort();
        }
    }
}

/// Sibling of `i`: the even-indexed node directly adjacent to an odd
/// (left-child) index, or the odd-indexed node directly adjacent to an even
/// (right-child) index — i.e. `i + 1` if `i` is odd, `i - 1` if `i` is even.
#[inline]
fn sibling_of(i: u64) -> u64 {
    if i % 2 == 1 {
        i + 1
    } else {
        i - 1
    }
}

#[inline]
fn log2(val: u64) -> u32 {
    debug_assert!(val.is_power_of_two());
    val.trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level3() -> Arena {
        Arena::new(3, Location::Host).unwrap()
    }

    fn offset(arena: &Arena, ptr: NonNull<u8>) -> u64 {
        ptr.as_ptr() as u64 - arena.base.as_ptr() as u64
    }

    #[test]
    fn s1_reclaims_freed_block() {
        let arena = level3();
        let p0 = arena.alloc(8).unwrap();
        assert_eq!(offset(&arena, p0), 0);
        assert!(arena.alloc(1).is_none());
        assert!(arena.free(Some(p0)));
        let p1 = arena.alloc(8).unwrap();
        assert_eq!(offset(&arena, p1), 0);
    }

    #[test]
    fn s2_buddy_split_leaves_no_size_2_block() {
        let arena = level3();
        let a = arena.alloc(4).unwrap();
        let _b = arena.alloc(4).unwrap();
        assert!(arena.alloc(2).is_none());
        assert!(arena.free(Some(a)));
        let c = arena.alloc(2).unwrap();
        assert_eq!(offset(&arena, c), 0);
    }

    #[test]
    fn s3_alignment_inflates_request_and_rounds_pointer() {
        let arena = level3();
        let p = arena.alloc_aligned(1, 3).unwrap();
        assert_eq!(p.as_ptr() as usize % 3, 0);
    }

    #[test]
    fn s4_double_free_is_rejected_and_state_unchanged() {
        let arena = level3();
        let p = arena.alloc(8).unwrap();
        assert!(arena.free(Some(p)));
        assert!(!arena.free(Some(p)));
        let q = arena.alloc(8).unwrap();
        assert_eq!(offset(&arena, q), 0);
    }

    #[test]
    fn s6_exhaustion_returns_none_without_state_change() {
        let arena = level3();
        let p = arena.alloc(8).unwrap();
        assert!(arena.alloc(1).is_none());
        assert!(arena.alloc(1).is_none());
        assert!(arena.free(Some(p)));
    }

    #[test]
    fn free_of_null_is_silent_success() {
        let arena = level3();
        assert!(arena.free(None));
    }

    #[test]
    fn free_outside_arena_fails_without_panicking() {
        let arena = level3();
        let bogus = NonNull::new((arena.base.as_ptr() as u64 + arena.size() + 8) as *mut u8).unwrap();
        assert!(!arena.free(Some(bogus)));
    }

    #[test]
    fn free_interior_pointer_is_rejected() {
        let arena = level3();
        let p = arena.alloc(8).unwrap();
        let interior = NonNull::new((p.as_ptr() as u64 + 1) as *mut u8).unwrap();
        assert!(!arena.free(Some(interior)));
        assert!(arena.free(Some(p)));
    }

    #[test]
    fn round_trip_empties_arena() {
        let arena = level3();
        let mut live = Vec::new();
        for _ in 0..4 {
            live.push(arena.alloc(2).unwrap());
        }
        assert!(arena.alloc(1).is_none());
        for p in live {
            assert!(arena.free(Some(p)));
        }
        assert!(arena.is_empty());
        assert_eq!(arena.used_bytes(), 0);
    }

    #[test]
    fn contains_reflects_byte_range() {
        let arena = level3();
        let p = arena.alloc(4).unwrap();
        assert!(arena.contains(p));
        let past_end = NonNull::new((arena.base.as_ptr() as u64 + arena.size()) as *mut u8).unwrap();
        assert!(!arena.contains(past_end));
    }

    #[test]
    fn coalesce_allows_full_reallocation_after_scattered_frees() {
        let arena = level3();
        let a = arena.alloc(2).unwrap();
        let b = arena.alloc(2).unwrap();
        let c = arena.alloc(2).unwrap();
        let d = arena.alloc(2).unwrap();
        assert!(arena.free(Some(a)));
        assert!(arena.free(Some(b)));
        assert!(arena.free(Some(c)));
        assert!(arena.free(Some(d)));
        // every leaf should have coalesced back into one free root block
        let whole = arena.alloc(8).unwrap();
        assert_eq!(offset(&arena, whole), 0);
    }

    // property 1 & 4: randomized alloc/free interleaving never returns
    // overlapping live blocks, and a failed alloc never mutates state.
    proptest::proptest! {
        #[test]
        fn interleaved_alloc_free_never_overlaps(ops in proptest::collection::vec(1u64..=8, 1..64)) {
            let arena = level3();
            let mut live: Vec<(NonNull<u8>, u64)> = Vec::new();
            for size in ops {
                if let Some(p) = arena.alloc(size) {
                    let start = offset(&arena, p);
                    let s = next_pow2(size.max(1));
                    for (q, qs) in &live {
                        let qstart = offset(&arena, *q);
                        let overlap = start < qstart + qs && qstart < start + s;
                        proptest::prop_assert!(!overlap);
                    }
                    live.push((p, s));
                } else if let Some((p, _)) = live.pop() {
                    arena.free(Some(p));
                }
            }
            for (p, _) in live {
                arena.free(Some(p));
            }
            proptest::prop_assert!(arena.is_empty());
        }

        #[test]
        fn aligned_alloc_pointer_always_satisfies_alignment(
            size in 1u64..=16,
            align_shift in 0u32..4,
        ) {
            let arena = Arena::new(5, Location::Host).unwrap();
            let alignment = 1u64 << align_shift;
            if let Some(p) = arena.alloc_aligned(size, alignment) {
                proptest::prop_assert_eq!(p.as_ptr() as u64 % alignment, 0);
            }
        }

        // property 2 holds for arbitrary alignments, not just powers of two
        #[test]
        fn non_power_of_two_alignment_is_still_honored(
            size in 1u64..=16,
            alignment in 1u64..=12,
        ) {
            let arena = Arena::new(5, Location::Host).unwrap();
            if let Some(p) = arena.alloc_aligned(size, alignment) {
                proptest::prop_assert_eq!(p.as_ptr() as u64 % alignment, 0);
            }
        }
    }
}
