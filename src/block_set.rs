//! Allocator block set: same size class blocks behind a spare-capacity index.
//!
//! Allocation goes to the *last block* first. Only when it cannot serve is the
//! index consulted, a sorted set of `(max_alloc_available, block index)` for
//! every other block that is not full. The block picked from the index becomes
//! the new last block, and the old one goes back into the index.
//!
//! Blocks live in a `Vec`, so structural changes can move their bookkeeping.
//! Callers holding raw block addresses are told through [`BlockSetHooks`].

use core::mem::size_of;
use core::ops::Range;

use crate::arena::Extent;
use crate::block::{Allocation, AllocatorBlock};
use crate::error::Violation;
use crate::flat_set::FlatSet;
use crate::verify;

/// Sentinel checked by the verifier to catch overwrites of the set itself.
pub const BLOCK_SET_MAGIC: u64 = 0x54a8_9202;

/// Block bookkeeping in `range` moved by `offset` bytes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlockMove {
    pub range: Range<usize>,
    pub offset: isize,
}

/// Callbacks bracketing structural changes to a block set.
pub trait BlockSetHooks {
    fn lock(&mut self) {}
    fn unlock(&mut self) {}
    fn moved(&mut self, _moved: BlockMove) {}
}

/// Hooks that do nothing.
#[derive(Clone, Copy, Default, Debug)]
pub struct NoHooks;

impl BlockSetHooks for NoHooks {}

/// Aggregate occupancy of a block set.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct BlockSetStats {
    pub blocks: usize,
    pub indexed_blocks: usize,
    pub empty_blocks: usize,
    pub primary_memory: usize,
    pub live_objects: usize,
    pub live_bytes: usize,
    pub free_bytes: usize,
    pub largest_available: usize,
}

#[derive(Debug)]
pub struct AllocatorBlockSet {
    magic: u64,
    blocks: Vec<AllocatorBlock>,
    available_blocks: FlatSet<(usize, usize)>,
    last_block: Option<usize>,
    min_size: usize,
    max_size: usize,
    num_destroyed_since_free: usize,
}

impl AllocatorBlockSet {
    /// A set serving requests of `min_size..=max_size` payload bytes.
    pub const fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            magic: BLOCK_SET_MAGIC,
            blocks: Vec::new(),
            available_blocks: FlatSet::new(),
            last_block: None,
            min_size,
            max_size,
            num_destroyed_since_free: 0,
        }
    }

    #[inline]
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[inline]
    pub fn blocks(&self) -> &[AllocatorBlock] {
        &self.blocks
    }

    /// Index contents, smallest spare capacity first.
    #[inline]
    pub fn available_blocks(&self) -> &[(usize, usize)] {
        self.available_blocks.as_slice()
    }

    pub(crate) fn available_index(&self) -> &FlatSet<(usize, usize)> {
        &self.available_blocks
    }

    #[inline]
    pub fn last_block_index(&self) -> Option<usize> {
        self.last_block
    }

    pub fn last_block(&self) -> Option<&AllocatorBlock> {
        self.last_block.and_then(|i| self.blocks.get(i))
    }

    #[inline]
    pub fn magic_ok(&self) -> bool {
        self.magic == BLOCK_SET_MAGIC
    }

    #[inline]
    pub fn num_destroyed_since_last_free(&self) -> usize {
        self.num_destroyed_since_free
    }

    /// True if some block's extent holds `ptr`.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.blocks.iter().any(|block| block.contains(ptr))
    }

    /// Pushing one more block will not reallocate the block list.
    #[inline]
    pub fn add_block_is_safe(&self) -> bool {
        self.blocks.len() < self.blocks.capacity()
    }

    // =========================================================================
    // Allocate / destroy
    // =========================================================================

    /// Serves `size` bytes from some block, or `None` if the set must grow.
    pub fn allocate(&mut self, size: usize) -> Option<Allocation> {
        if size < self.min_size || size > self.max_size {
            return None;
        }

        if let Some(last) = self.last_block {
            if let Some(allocation) = self.blocks[last].allocate(size) {
                verify::enforce_block_set(self);
                return Some(allocation);
            }
            self.last_block = None;
            let block = &self.blocks[last];
            if !block.full() {
                log::trace!("promoting block {last} ({} bytes) into the index", block.last_max_alloc_available());
                self.available_blocks.insert((block.last_max_alloc_available(), last));
            }
        }

        let pos = self.available_blocks.lower_bound(&(size, 0))?;
        let (indexed, index) = self.available_blocks.remove_at(pos);
        let Some(allocation) = self.blocks[index].allocate(size) else {
            let actual = self.blocks[index].max_alloc_available();
            verify::fatal(&Violation::IndexStale { block: index, indexed, actual });
        };
        self.last_block = Some(index);
        verify::enforce_block_set(self);
        Some(allocation)
    }

    /// Frees `ptr` in whichever block holds it. False if no block does.
    pub fn destroy(&mut self, ptr: *mut u8) -> bool {
        let Some(index) = self.blocks.iter().position(|block| block.contains(ptr)) else {
            return false;
        };
        let block = &mut self.blocks[index];
        let previous = block.last_max_alloc_available();
        let was_full = block.full();
        if !block.destroy(ptr) {
            return false;
        }
        self.num_destroyed_since_free += 1;

        if self.last_block != Some(index) {
            if !was_full {
                self.available_blocks.remove(&(previous, index));
            }
            let available = self.blocks[index].last_max_alloc_available();
            self.available_blocks.insert((available, index));
        }
        verify::enforce_block_set(self);
        true
    }

    // =========================================================================
    // Structure
    // =========================================================================

    /// Appends `block` and makes it the last block. Returns its index.
    pub fn add_block(&mut self, block: AllocatorBlock) -> usize {
        self.add_block_with(block, &mut NoHooks)
    }

    pub fn add_block_with(&mut self, block: AllocatorBlock, hooks: &mut impl BlockSetHooks) -> usize {
        hooks.lock();
        let index = self.blocks.len();
        let before = self.blocks.as_ptr().addr();
        self.blocks.push(block);
        let offset = self.blocks.as_ptr().addr().wrapping_sub(before) as isize;
        if index > 0 && offset != 0 {
            hooks.moved(BlockMove { range: 0..index, offset });
        }

        if let Some(previous) = self.last_block.replace(index) {
            let block = &self.blocks[previous];
            if !block.full() {
                self.available_blocks.insert((block.last_max_alloc_available(), previous));
            }
        }
        hooks.unlock();

        log::debug!(
            "block set [{}, {}]: added block {index} ({} bytes)",
            self.min_size,
            self.max_size,
            self.blocks[index].memory_size()
        );
        verify::enforce_block_set(self);
        index
    }

    /// Reserves room for `additional` more blocks, or for doubling when 0.
    ///
    /// Returns the byte offset the existing block bookkeeping moved by.
    pub fn grow_blocks(&mut self, additional: usize) -> isize {
        let additional = if additional == 0 { self.blocks.len().max(1) } else { additional };
        if self.blocks.is_empty() {
            self.blocks.reserve(additional);
            return 0;
        }
        let before = self.blocks.as_ptr().addr();
        self.blocks.reserve(additional);
        self.blocks.as_ptr().addr().wrapping_sub(before) as isize
    }

    /// Takes block `index` out of the set. Indices above it shift down by one.
    pub fn remove_block(&mut self, index: usize, hooks: &mut impl BlockSetHooks) -> Option<AllocatorBlock> {
        if index >= self.blocks.len() {
            return None;
        }
        hooks.lock();
        if self.last_block == Some(index) {
            self.last_block = None;
        }
        let available = self.blocks[index].last_max_alloc_available();
        self.available_blocks.remove(&(available, index));

        let block = self.blocks.remove(index);
        self.available_blocks
            .map_in_place(|(available, i)| (available, if i > index { i - 1 } else { i }));
        if let Some(last) = self.last_block.filter(|last| *last > index) {
            self.last_block = Some(last - 1);
        }
        let len = self.blocks.len();
        if index < len {
            hooks.moved(BlockMove { range: index..len, offset: -(size_of::<AllocatorBlock>() as isize) });
        }
        hooks.unlock();

        log::debug!("block set [{}, {}]: removed block {index}", self.min_size, self.max_size);
        verify::enforce_block_set(self);
        Some(block)
    }

    /// Removes empty blocks beyond the first `min_to_leave`, handing each
    /// extent to `collector`. Returns how many were removed.
    pub fn free_empty_blocks(
        &mut self,
        mut collector: impl FnMut(Extent),
        hooks: &mut impl BlockSetHooks,
        min_to_leave: usize,
    ) -> usize {
        let mut kept = 0;
        let mut released = 0;
        for index in (0..self.blocks.len()).rev() {
            if !self.blocks[index].is_empty() {
                continue;
            }
            if kept < min_to_leave {
                kept += 1;
                continue;
            }
            if let Some(block) = self.remove_block(index, hooks) {
                collector(block.extent());
                released += 1;
            }
        }
        self.num_destroyed_since_free = 0;
        released
    }

    /// Rebuilds the index from every block's cached availability.
    pub fn regenerate_available_blocks(&mut self) {
        let last = self.last_block;
        let entries = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(i, block)| Some(*i) != last && !block.full())
            .map(|(i, block)| (block.last_max_alloc_available(), i))
            .collect();
        self.available_blocks = FlatSet::from_unsorted(entries);
    }

    /// Collects every block and rebuilds the index.
    ///
    /// Returns the number of quasi-freed objects reconciled.
    pub fn do_maintenance(&mut self) -> usize {
        let mut num_quasifreed = 0;
        for block in &mut self.blocks {
            block.collect(&mut num_quasifreed);
        }
        self.regenerate_available_blocks();
        log::debug!(
            "block set [{}, {}]: maintenance over {} blocks reconciled {num_quasifreed} quasi-freed",
            self.min_size,
            self.max_size,
            self.blocks.len()
        );
        verify::enforce_block_set(self);
        num_quasifreed
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    /// Bytes of extent memory under management.
    pub fn primary_memory_used(&self) -> usize {
        self.blocks.iter().map(AllocatorBlock::memory_size).sum()
    }

    /// Heap bytes used by bookkeeping: the block list, the index and free sets.
    pub fn secondary_memory_used(&self) -> usize {
        self.blocks.capacity() * size_of::<AllocatorBlock>()
            + self.available_blocks.capacity() * size_of::<(usize, usize)>()
            + self.blocks.iter().map(AllocatorBlock::secondary_memory_used).sum::<usize>()
    }

    /// Trims the index and every free set. The block list is left alone so no block moves.
    pub fn shrink_secondary_memory_usage_to_fit(&mut self) {
        self.available_blocks.shrink_to_fit();
        for block in &mut self.blocks {
            block.shrink_secondary_memory_usage_to_fit();
        }
    }

    pub fn stats(&self) -> BlockSetStats {
        let mut stats = BlockSetStats {
            blocks: self.blocks.len(),
            indexed_blocks: self.available_blocks.len(),
            ..BlockSetStats::default()
        };
        for block in &self.blocks {
            let block_stats = block.stats();
            stats.empty_blocks += block.is_empty() as usize;
            stats.primary_memory += block_stats.memory_size;
            stats.live_objects += block_stats.live_objects;
            stats.live_bytes += block_stats.live_bytes;
            stats.free_bytes += block_stats.free_bytes + block_stats.tail_bytes;
            stats.largest_available = stats.largest_available.max(block_stats.max_alloc_available);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{ArenaProvider, MmapArena};
    use crate::object_state::{HEADER_SIZE, quasi_free};

    const SLOT: usize = HEADER_SIZE + 112;

    /// Hands out mmap extents and unmaps whatever is left at the end of a test.
    struct Extents {
        arena: MmapArena,
        live: Vec<Extent>,
    }

    impl Extents {
        fn new() -> Self {
            Self { arena: MmapArena::new(), live: Vec::new() }
        }

        /// A block with room for exactly `slots` allocations of 100 bytes.
        fn block(&mut self, slots: usize) -> AllocatorBlock {
            let extent = self.arena.allocate_extent(slots * SLOT, 0).unwrap();
            self.live.push(extent);
            unsafe { AllocatorBlock::new(Extent::new(extent.start(), slots * SLOT), 1, 100) }
        }
    }

    impl Drop for Extents {
        fn drop(&mut self) {
            for extent in self.live.drain(..) {
                unsafe { self.arena.release_extent(extent) };
            }
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        locks: usize,
        unlocks: usize,
        moves: Vec<BlockMove>,
    }

    impl BlockSetHooks for RecordingHooks {
        fn lock(&mut self) {
            self.locks += 1;
        }

        fn unlock(&mut self) {
            self.unlocks += 1;
        }

        fn moved(&mut self, moved: BlockMove) {
            self.moves.push(moved);
        }
    }

    #[test]
    fn test_last_block_then_index() {
        let mut extents = Extents::new();
        let mut set = AllocatorBlockSet::new(1, 100);
        assert!(set.allocate(50).is_none());

        let a = set.add_block(extents.block(4));
        let b = set.add_block(extents.block(4));
        assert_eq!(set.last_block_index(), Some(b));
        assert_eq!(set.available_blocks(), &[(4 * SLOT - HEADER_SIZE, a)]);

        for _ in 0..4 {
            let allocation = set.allocate(100).unwrap();
            assert!(set.blocks()[b].contains(allocation.as_ptr()));
        }
        // Last block is full: the index supplies block `a`, which becomes last.
        let allocation = set.allocate(100).unwrap();
        assert!(set.blocks()[a].contains(allocation.as_ptr()));
        assert_eq!(set.last_block_index(), Some(a));
        assert!(set.available_blocks().is_empty());
        verify::check_block_set(&set).unwrap();
    }

    #[test]
    fn test_rejects_sizes_outside_class() {
        let mut extents = Extents::new();
        let mut set = AllocatorBlockSet::new(17, 100);
        set.add_block(extents.block(2));
        assert!(set.allocate(16).is_none());
        assert!(set.allocate(101).is_none());
        assert!(set.allocate(17).is_some());
        assert!(set.allocate(100).is_some());
    }

    #[test]
    fn test_destroy_refreshes_index() {
        let mut extents = Extents::new();
        let mut set = AllocatorBlockSet::new(1, 100);
        let a = set.add_block(extents.block(2));
        let in_a: Vec<_> = (0..2).map(|_| set.allocate(100).unwrap()).collect();
        let b = set.add_block(extents.block(2));
        // `a` is full, so it stays out of the index.
        assert!(set.available_blocks().is_empty());

        assert!(set.destroy(in_a[1].as_ptr()));
        assert_eq!(set.available_blocks(), &[(112, a)]);
        assert!(set.destroy(in_a[0].as_ptr()));
        assert_eq!(set.available_blocks(), &[(2 * SLOT - HEADER_SIZE, a)]);
        assert!(set.blocks()[a].is_empty());
        assert_eq!(set.num_destroyed_since_last_free(), 2);

        // Destroys in the last block leave the index alone.
        let in_b = set.allocate(100).unwrap();
        assert_eq!(set.last_block_index(), Some(b));
        assert!(set.destroy(in_b.as_ptr()));
        assert_eq!(set.available_blocks().len(), 1);

        let mut stray = 0u8;
        assert!(!set.destroy(&mut stray));
        verify::check_block_set(&set).unwrap();
    }

    #[test]
    fn test_index_tracks_spare_capacity() {
        let mut extents = Extents::new();
        let mut set = AllocatorBlockSet::new(1, 100);
        for slots in [2, 3, 4] {
            set.add_block(extents.block(slots));
        }
        let mut live = Vec::new();
        for _ in 0..9 {
            live.push(set.allocate(100).unwrap());
            verify::check_block_set(&set).unwrap();
        }
        assert!(set.allocate(100).is_none());
        for allocation in live.iter().step_by(2) {
            assert!(set.destroy(allocation.as_ptr()));
            verify::check_block_set(&set).unwrap();
        }
        for &(available, index) in set.available_blocks() {
            assert_eq!(available, set.blocks()[index].max_alloc_available());
        }
    }

    #[test]
    fn test_remove_block_shifts_indices() {
        let mut extents = Extents::new();
        let mut set = AllocatorBlockSet::new(1, 100);
        for _ in 0..3 {
            set.add_block(extents.block(4));
        }
        // Blocks 0 and 1 indexed, 2 is last. Give block 0 less room than block 1.
        set.blocks[0].allocate(100).unwrap();
        set.regenerate_available_blocks();
        assert_eq!(set.available_blocks(), &[(3 * SLOT - HEADER_SIZE, 0), (4 * SLOT - HEADER_SIZE, 1)]);
        verify::check_block_set(&set).unwrap();

        let mut hooks = RecordingHooks::default();
        let removed = set.remove_block(0, &mut hooks).unwrap();
        assert_eq!(removed.memory_size(), 4 * SLOT);
        assert_eq!(set.len(), 2);
        assert_eq!((hooks.locks, hooks.unlocks), (1, 1));
        assert_eq!(hooks.moves, [BlockMove { range: 0..2, offset: -(size_of::<AllocatorBlock>() as isize) }]);
        assert_eq!(set.available_blocks(), &[(4 * SLOT - HEADER_SIZE, 0)]);
        assert_eq!(set.last_block_index(), Some(1));
        verify::check_block_set(&set).unwrap();

        assert!(set.remove_block(5, &mut hooks).is_none());
        set.remove_block(1, &mut hooks).unwrap();
        assert_eq!(set.last_block_index(), None);
        assert_eq!(set.available_blocks(), &[(4 * SLOT - HEADER_SIZE, 0)]);
        verify::check_block_set(&set).unwrap();
    }

    #[test]
    fn test_add_block_hooks_and_growth() {
        let mut extents = Extents::new();
        let mut set = AllocatorBlockSet::new(1, 100);
        let mut hooks = RecordingHooks::default();

        assert_eq!(set.grow_blocks(0), 0);
        assert!(set.add_block_is_safe());
        set.add_block_with(extents.block(1), &mut hooks);
        assert!(hooks.moves.is_empty());

        set.grow_blocks(16);
        let capacity = set.blocks.capacity();
        for _ in 1..capacity {
            assert!(set.add_block_is_safe());
            set.add_block_with(extents.block(1), &mut hooks);
        }
        // Reserved capacity means no pushes moved anything.
        assert!(hooks.moves.is_empty());
        assert!(!set.add_block_is_safe());
        assert_eq!((hooks.locks, hooks.unlocks), (capacity, capacity));

        set.add_block_with(extents.block(1), &mut hooks);
        for moved in &hooks.moves {
            assert_eq!(moved.range, 0..capacity);
            assert_ne!(moved.offset, 0);
        }
        assert_eq!(set.available_blocks().len(), set.len() - 1);
        verify::check_block_set(&set).unwrap();
    }

    #[test]
    fn test_free_empty_blocks() {
        let mut extents = Extents::new();
        let mut set = AllocatorBlockSet::new(1, 100);
        for _ in 0..4 {
            set.add_block(extents.block(2));
        }
        let live: Vec<_> = (0..8).map(|_| set.allocate(100).unwrap()).collect();
        // The first allocation came from the last block added.
        let keep = live[0];
        for allocation in &live[1..] {
            assert!(set.destroy(allocation.as_ptr()));
        }
        set.do_maintenance();

        let mut released = Vec::new();
        let removed = set.free_empty_blocks(|extent| released.push(extent), &mut NoHooks, 1);
        assert_eq!(removed, 2);
        assert_eq!(released.len(), 2);
        assert_eq!(set.len(), 2);
        assert_eq!(set.num_destroyed_since_last_free(), 0);
        assert!(set.owns(keep.as_ptr()));
        for extent in &released {
            assert!(!set.owns(extent.start().as_ptr().wrapping_add(HEADER_SIZE)));
        }
        verify::check_block_set(&set).unwrap();

        assert!(set.destroy(keep.as_ptr()));
        assert_eq!(set.free_empty_blocks(|_| {}, &mut NoHooks, 0), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn test_maintenance_reconciles_quasi_frees() {
        let mut extents = Extents::new();
        let mut set = AllocatorBlockSet::new(1, 100);
        set.add_block(extents.block(2));
        set.add_block(extents.block(2));
        let live: Vec<_> = (0..4).map(|_| set.allocate(100).unwrap()).collect();
        assert!(set.allocate(100).is_none());

        for allocation in &live {
            unsafe { quasi_free(allocation.as_ptr()) };
        }
        assert!(set.allocate(100).is_none());
        assert_eq!(set.do_maintenance(), 4);
        assert_eq!(set.do_maintenance(), 0);
        assert!(set.blocks().iter().all(AllocatorBlock::is_empty));
        assert_eq!(set.stats().empty_blocks, 2);
        assert!(set.allocate(100).is_some());
        verify::check_block_set(&set).unwrap();
    }

    #[test]
    fn test_accounting() {
        let mut extents = Extents::new();
        let mut set = AllocatorBlockSet::new(1, 100);
        set.add_block(extents.block(4));
        set.add_block(extents.block(2));
        let allocation = set.allocate(60).unwrap();

        assert_eq!(set.primary_memory_used(), 6 * SLOT);
        assert!(set.secondary_memory_used() >= 2 * size_of::<AllocatorBlock>());
        let stats = set.stats();
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.indexed_blocks, 1);
        assert_eq!(stats.live_objects, 1);
        assert_eq!(stats.live_bytes, allocation.size);
        assert_eq!(stats.largest_available, 4 * SLOT - HEADER_SIZE);
        set.shrink_secondary_memory_usage_to_fit();
        assert!(set.last_block().is_some());
    }

    #[test]
    fn test_verifier_catches_broken_index() {
        let mut extents = Extents::new();
        let mut set = AllocatorBlockSet::new(1, 100);
        let first = set.add_block(extents.block(2));
        let second = set.add_block(extents.block(2));
        verify::check_block_set(&set).unwrap();

        set.available_blocks.remove_at(0);
        set.available_blocks.insert((16, first));
        assert!(matches!(verify::check_block_set(&set), Err(Violation::IndexStale { .. })));

        set.regenerate_available_blocks();
        let available = set.blocks()[second].last_max_alloc_available();
        set.available_blocks.insert((available, second));
        assert_eq!(verify::check_block_set(&set), Err(Violation::LastBlockIndexed { block: second }));

        set.regenerate_available_blocks();
        set.available_blocks.insert((1, 7));
        assert_eq!(verify::check_block_set(&set), Err(Violation::IndexOutOfRange { block: 7 }));

        set.regenerate_available_blocks();
        set.magic = 0;
        assert_eq!(verify::check_block_set(&set), Err(Violation::BlockSetMagic));
        set.magic = BLOCK_SET_MAGIC;
    }
}
