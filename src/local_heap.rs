//! Local heap: the owner-thread allocator built on block sets.
//!
//! One block set per size class, grown from an [`ArenaProvider`] on a miss.
//! The heap itself is not shared. Other threads interact with it in two ways
//! only: they may [`quasi_free`](crate::object_state::quasi_free) objects it
//! handed out, and they may ask it to run maintenance through a
//! [`MaintenanceHandle`]. The request is picked up at the start of the next
//! `allocate`.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::arena::{ArenaProvider, MmapArena};
use crate::block::{Allocation, AllocatorBlock};
use crate::block_set::{AllocatorBlockSet, NoHooks};
use crate::error::HeapError;
use crate::object_state::{HEADER_SIZE, ObjectState};
use crate::size_class::{self, MAX_BLOCK_SET_SIZE, NUM_BLOCK_SETS};
use crate::ALIGNMENT;

/// Tuning knobs for a [`LocalHeap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalHeapConfig {
    /// Empty blocks each size class keeps through maintenance.
    pub min_free_blocks: usize,
    /// Lower bound on extent size requested from the arena.
    pub min_extent_size: usize,
}

impl Default for LocalHeapConfig {
    fn default() -> Self {
        Self {
            min_free_blocks: 1,
            min_extent_size: 0,
        }
    }
}

/// Cross-thread request for maintenance on one heap.
#[derive(Clone, Debug)]
pub struct MaintenanceHandle {
    flag: Arc<AtomicBool>,
}

impl MaintenanceHandle {
    /// The owner runs maintenance before its next allocation.
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Outcome of one maintenance pass.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub quasi_freed: usize,
    pub blocks_released: usize,
}

pub struct LocalHeap<A: ArenaProvider = MmapArena> {
    sets: [AllocatorBlockSet; NUM_BLOCK_SETS],
    arena: A,
    force_maintenance: Arc<AtomicBool>,
    config: LocalHeapConfig,
}

impl<A: ArenaProvider> LocalHeap<A> {
    pub fn new(arena: A) -> Self {
        Self::with_config(arena, LocalHeapConfig::default())
    }

    pub fn with_config(arena: A, config: LocalHeapConfig) -> Self {
        Self {
            sets: core::array::from_fn(|id| {
                let info = size_class::class_info(id);
                AllocatorBlockSet::new(info.min_size, info.max_size)
            }),
            arena,
            force_maintenance: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &LocalHeapConfig {
        &self.config
    }

    #[inline]
    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Block set for size class `id`.
    #[inline]
    pub fn block_set(&self, id: usize) -> &AllocatorBlockSet {
        &self.sets[id]
    }

    /// Allocate `size` bytes. Zero-sized requests get the smallest object.
    pub fn allocate(&mut self, size: usize) -> Result<Allocation, HeapError> {
        if self.force_maintenance.swap(false, Ordering::AcqRel) {
            self.do_maintenance();
        }

        let size = size.max(1);
        let id = size_class::find_block_set_id(size);
        if id >= NUM_BLOCK_SETS {
            return Err(HeapError::TooLarge { size, max: MAX_BLOCK_SET_SIZE });
        }
        if let Some(allocation) = self.sets[id].allocate(size) {
            return Ok(allocation);
        }
        // Slow path: a new block for this class
        self.grow(id)?;
        self.sets[id].allocate(size).ok_or(HeapError::Exhausted { size })
    }

    #[cold]
    fn grow(&mut self, id: usize) -> Result<(), HeapError> {
        let info = size_class::class_info(id);
        let min_size = ObjectState::needed_size(HEADER_SIZE, info.max_size, ALIGNMENT);
        let hint = info.extent_size.max(self.config.min_extent_size);
        let extent = self.arena.allocate_extent(min_size, hint)?;
        // SAFETY: the extent is fresh from the arena and owned by the block until released.
        let block = unsafe { AllocatorBlock::new(extent, info.min_size, info.max_size) };
        self.sets[id].add_block(block);
        Ok(())
    }

    /// Frees an allocation made by this heap. False if no block here holds `ptr`.
    pub fn destroy(&mut self, ptr: *mut u8) -> bool {
        self.sets.iter_mut().any(|set| set.destroy(ptr))
    }

    pub fn owns(&self, ptr: *const u8) -> bool {
        self.sets.iter().any(|set| set.owns(ptr))
    }

    /// Reconciles quasi-frees in every class and returns surplus empty blocks to the arena.
    pub fn do_maintenance(&mut self) -> MaintenanceReport {
        let Self { sets, arena, config, .. } = self;
        let mut report = MaintenanceReport::default();
        for set in sets.iter_mut().filter(|set| !set.is_empty()) {
            report.quasi_freed += set.do_maintenance();
            report.blocks_released += set.free_empty_blocks(
                // SAFETY: the block holding this extent has just been removed.
                |extent| unsafe { arena.release_extent(extent) },
                &mut NoHooks,
                config.min_free_blocks,
            );
        }
        log::debug!(
            "local heap maintenance: {} quasi-freed reconciled, {} blocks released",
            report.quasi_freed,
            report.blocks_released
        );
        report
    }

    /// Handle another thread can use to request maintenance.
    pub fn maintenance_handle(&self) -> MaintenanceHandle {
        MaintenanceHandle { flag: Arc::clone(&self.force_maintenance) }
    }

    pub fn set_force_maintenance(&self) {
        self.force_maintenance.store(true, Ordering::Release);
    }

    /// Extent bytes held across all classes.
    pub fn primary_memory_used(&self) -> usize {
        self.sets.iter().map(AllocatorBlockSet::primary_memory_used).sum()
    }

    pub fn secondary_memory_used(&self) -> usize {
        self.sets.iter().map(AllocatorBlockSet::secondary_memory_used).sum()
    }
}

impl<A: ArenaProvider> Drop for LocalHeap<A> {
    fn drop(&mut self) {
        let Self { sets, arena, .. } = self;
        for set in sets.iter_mut() {
            while let Some(block) = set.len().checked_sub(1).and_then(|last| set.remove_block(last, &mut NoHooks)) {
                // SAFETY: the heap is going away, so nothing can reach the block's objects.
                unsafe { arena.release_extent(block.extent()) };
            }
        }
    }
}
