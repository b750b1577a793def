//! Error types.
//!
//! Running out of room in a block or block set is not an error: those paths
//! return `None` and the caller grows capacity. The enums here cover the arena
//! and heap layers, plus the invariant violations the verifier reports before
//! aborting.

use thiserror::Error;

/// Failure to obtain an extent from an arena provider.
#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("zero-sized extent requested")]
    ZeroSize,

    #[error("extent of {size} bytes overflows the address space")]
    TooLarge { size: usize },

    #[error("mmap of {size} bytes failed")]
    MapFailed {
        size: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of a [`LocalHeap`](crate::LocalHeap) allocation.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("allocation of {size} bytes exceeds the largest size class ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("fresh block could not serve {size} bytes")]
    Exhausted { size: usize },

    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// A broken allocator invariant. Reported with a stable identifier, then fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("header at {addr:#x} is not 16-byte aligned")]
    MisalignedHeader { addr: usize },

    #[error("extent {start:#x}+{len:#x} is not 16-byte aligned or too small for a header")]
    MisalignedExtent { start: usize, len: usize },

    #[error("header at {addr:#x} has a damaged magic sentinel")]
    BadMagic { addr: usize },

    #[error("header at {addr:#x} points at {next:#x}, overlapping its own payload")]
    ChainOverlap { addr: usize, next: usize },

    #[error("header at {addr:#x} points at {next:#x}, outside the block")]
    ChainEscapes { addr: usize, next: usize },

    #[error("untouched tail at {addr:#x} is not terminal")]
    TailNotTerminal { addr: usize },

    #[error("free set entry {addr:#x} is not a free header")]
    FreeEntryNotFree { addr: usize },

    #[error("free set entry {addr:#x} cached {cached} bytes, header spans {actual}")]
    FreeEntrySize { addr: usize, cached: usize, actual: usize },

    #[error("chain holds {chain} free headers, free set holds {listed}")]
    FreeCountMismatch { chain: usize, listed: usize },

    #[error("free successor {addr:#x} missing from the free set")]
    FreeEntryMissing { addr: usize },

    #[error("block cached {cached} bytes available, recomputed {actual}")]
    StaleAvailable { cached: usize, actual: usize },

    #[error("double free of {addr:#x}")]
    DoubleFree { addr: usize },

    #[error("quasi-free of {addr:#x}, which is not in use")]
    QuasiFreeNotInUse { addr: usize },

    #[error("block set magic prefix overwritten")]
    BlockSetMagic,

    #[error("index entry for block {block} holds {indexed} bytes, block reports {actual}")]
    IndexStale { block: usize, indexed: usize, actual: usize },

    #[error("index entry for block {block} points past the block list")]
    IndexOutOfRange { block: usize },

    #[error("indexed block {block} is full")]
    IndexedBlockFull { block: usize },

    #[error("available block index is not sorted")]
    IndexUnsorted,

    #[error("available block index contains duplicates")]
    IndexDuplicate,

    #[error("last block {block} is present in the index")]
    LastBlockIndexed { block: usize },
}

impl Violation {
    /// Stable identifier printed with the diagnostic.
    pub fn id(&self) -> &'static str {
        match self {
            Violation::MisalignedHeader { .. } => "os-misaligned",
            Violation::MisalignedExtent { .. } => "block-extent-misaligned",
            Violation::BadMagic { .. } => "os-magic",
            Violation::ChainOverlap { .. } => "block-chain-overlap",
            Violation::ChainEscapes { .. } => "block-chain-escapes",
            Violation::TailNotTerminal { .. } => "block-tail-not-terminal",
            Violation::FreeEntryNotFree { .. } => "block-free-entry-not-free",
            Violation::FreeEntrySize { .. } => "block-free-entry-size",
            Violation::FreeCountMismatch { .. } => "block-free-count",
            Violation::FreeEntryMissing { .. } => "block-free-entry-missing",
            Violation::StaleAvailable { .. } => "block-stale-available",
            Violation::DoubleFree { .. } => "block-double-free",
            Violation::QuasiFreeNotInUse { .. } => "os-quasi-free-not-in-use",
            Violation::BlockSetMagic => "abs-magic",
            Violation::IndexStale { .. } => "abs-index-stale",
            Violation::IndexOutOfRange { .. } => "abs-index-range",
            Violation::IndexedBlockFull { .. } => "abs-indexed-full",
            Violation::IndexUnsorted => "abs-index-unsorted",
            Violation::IndexDuplicate => "abs-index-duplicate",
            Violation::LastBlockIndexed { .. } => "abs-last-block-indexed",
        }
    }
}
