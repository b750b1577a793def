//! Block set size classes for the local heap.
//!
//! Requests are bucketed by power of two: class 0 serves 1 to 16 bytes and
//! class `i` serves `[2^(i+3), 2^(i+4) - 1]` (class 1 starts at 17). Every
//! class gets its own block set, so a block only ever holds objects within a
//! factor of two of each other.

use crate::object_state::{HEADER_SIZE, ObjectState};
use crate::{ALIGNMENT, align_up};

/// Information about a single size class.
#[derive(Clone, Copy, Debug)]
pub struct SizeClassInfo {
    /// Smallest request served by this class.
    pub min_size: usize,
    /// Largest request served by this class.
    pub max_size: usize,
    /// Extent size requested from the arena when the class grows.
    pub extent_size: usize,
}

impl SizeClassInfo {
    /// Objects of `max_size` one fresh extent holds.
    pub const fn objects_per_extent(&self) -> usize {
        self.extent_size / ObjectState::needed_size(HEADER_SIZE, self.max_size, ALIGNMENT)
    }
}

/// Number of block sets. `find_block_set_id` returns this for oversized requests.
pub const NUM_BLOCK_SETS: usize = 17;

/// Largest request any block set serves.
pub const MAX_BLOCK_SET_SIZE: usize = (1 << (NUM_BLOCK_SETS + 3)) - 1;

const MIN_EXTENT_SIZE: usize = 256 * 1024; // 256 KiB
const EXTENT_GRANULE: usize = 64 * 1024; // 64 KiB
const OBJECTS_PER_EXTENT: usize = 8;

const fn class_bounds(id: usize) -> (usize, usize) {
    match id {
        0 => (1, 16),
        1 => (17, 31),
        _ => (1 << (id + 3), (1 << (id + 4)) - 1),
    }
}

const fn extent_size_for(max_size: usize) -> usize {
    let needed = OBJECTS_PER_EXTENT * ObjectState::needed_size(HEADER_SIZE, max_size, ALIGNMENT);
    let size = if needed > MIN_EXTENT_SIZE { needed } else { MIN_EXTENT_SIZE };
    align_up(size, EXTENT_GRANULE)
}

/// The size class table.
pub static SIZE_CLASSES: [SizeClassInfo; NUM_BLOCK_SETS] = const {
    let mut table = [SizeClassInfo { min_size: 0, max_size: 0, extent_size: 0 }; NUM_BLOCK_SETS];
    let mut id = 0;
    while id < NUM_BLOCK_SETS {
        let (min_size, max_size) = class_bounds(id);
        table[id] = SizeClassInfo { min_size, max_size, extent_size: extent_size_for(max_size) };
        id += 1;
    }
    table
};

/// Map a request size to its block set id.
/// Returns `NUM_BLOCK_SETS` for sizes no block set serves.
#[inline]
pub fn find_block_set_id(size: usize) -> usize {
    if size <= 16 {
        return 0;
    }
    let id = size.ilog2() as usize - 3;
    id.min(NUM_BLOCK_SETS)
}

/// Get the size class info for a given block set id.
#[inline]
pub fn class_info(id: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[id]
}
