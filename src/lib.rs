//! sparsealloc: a segregated-fit block allocator for managed-object runtimes.
//!
//! Memory is carved out of raw extents in three tiers:
//! - Object states (intrusive 16-byte aligned headers, no size field)
//! - Allocator blocks (bump tail + best-fit free set over one extent)
//! - Block sets (same size class blocks behind a spare-capacity index)
//!
//! A [`LocalHeap`] ties the tiers together for one owning thread: one block set
//! per size class, grown on demand from an [`ArenaProvider`].
//!
//! Frees coming from a foreign thread go through [`object_state::quasi_free`],
//! which only flips header bits. The owner reconciles them during maintenance.
//!
//! # Usage
//!
//! ```no_run
//! use sparsealloc::{LocalHeap, MmapArena};
//!
//! let mut heap = LocalHeap::new(MmapArena::new());
//! let allocation = heap.allocate(100).unwrap();
//! assert!(allocation.size >= 100);
//! assert!(heap.destroy(allocation.as_ptr()));
//! ```

pub mod error;
pub mod flat_set;
pub mod object_state;
pub mod verify;
pub mod block;
pub mod block_set;
pub mod arena;
pub mod size_class;
pub mod local_heap;

/// Alignment of every header and every payload.
pub const ALIGNMENT: usize = 16;

/// Rounds `x` up to the next multiple of `align`. `align` must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
    let mask = align - 1;
    (x + mask) & !mask
}

pub use arena::{ArenaProvider, Extent, MmapArena};
pub use block::{AllocatorBlock, Allocation, BlockStats};
pub use block_set::{AllocatorBlockSet, BlockMove, BlockSetHooks, BlockSetStats, NoHooks};
pub use error::{ArenaError, HeapError, Violation};
pub use local_heap::{LocalHeap, LocalHeapConfig, MaintenanceHandle, MaintenanceReport};
pub use object_state::{HEADER_SIZE, ObjectState};
