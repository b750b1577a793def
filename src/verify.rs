//! Consistency checks over headers, blocks and block sets.
//!
//! `check_*` functions are pure and always compiled: they walk the structure
//! and return the first [`Violation`] found. `enforce_*` wrappers run a check
//! and abort on failure; they are selected at compile time and collapse to
//! empty inline functions unless `debug_assertions` or the `debug` feature is on.

use crate::block::AllocatorBlock;
use crate::block_set::AllocatorBlockSet;
use crate::error::Violation;
use crate::object_state::ObjectState;

/// Prints the diagnostic and aborts the process.
#[cold]
#[inline(never)]
pub fn fatal(violation: &Violation) -> ! {
    log::error!("sparsealloc: {violation} [{}]", violation.id());
    eprintln!("sparsealloc: fatal: {violation} [{}]", violation.id());
    std::process::abort()
}

// =============================================================================
// Checks
// =============================================================================

pub fn check_object_state(state: &ObjectState) -> Result<(), Violation> {
    let addr = core::ptr::from_ref(state).addr();
    if addr % crate::ALIGNMENT != 0 {
        return Err(Violation::MisalignedHeader { addr });
    }
    if !state.magic_ok() {
        return Err(Violation::BadMagic { addr });
    }
    Ok(())
}

/// Walks the whole header chain of `block`.
pub fn check_block(block: &AllocatorBlock) -> Result<(), Violation> {
    let start = block.begin().addr();
    let end = block.end().addr();
    let mut free_in_chain = 0;

    for state in block.objects() {
        check_object_state(state)?;
        let addr = core::ptr::from_ref(state).addr();
        let word = state.load();
        let next = word.next().addr();
        if next < start || next > end {
            return Err(Violation::ChainEscapes { addr, next });
        }
        if word.next_valid() {
            if state.object_start().addr() >= next {
                return Err(Violation::ChainOverlap { addr, next });
            }
            if !word.not_available() {
                free_in_chain += 1;
            }
        } else if block.tail().map(|tail| tail.as_ptr().addr()) != Some(addr) || next != end {
            return Err(Violation::TailNotTerminal { addr });
        }
    }

    if let Some(tail) = block.tail() {
        let tail = unsafe { tail.as_ref() };
        check_object_state(tail)?;
        if tail.next_valid() || tail.in_use() || tail.object_end().addr() != end {
            return Err(Violation::TailNotTerminal { addr: core::ptr::from_ref(tail).addr() });
        }
    }

    let mut listed = 0;
    for (cached, state) in block.free_entries() {
        let state = unsafe { state.as_ref() };
        let addr = core::ptr::from_ref(state).addr();
        if state.not_available() || !state.next_valid() {
            return Err(Violation::FreeEntryNotFree { addr });
        }
        if state.object_size() != cached {
            return Err(Violation::FreeEntrySize { addr, cached, actual: state.object_size() });
        }
        listed += 1;
    }
    if listed != free_in_chain {
        return Err(Violation::FreeCountMismatch { chain: free_in_chain, listed });
    }

    let actual = block.max_alloc_available();
    if block.last_max_alloc_available() != actual {
        return Err(Violation::StaleAvailable { cached: block.last_max_alloc_available(), actual });
    }
    Ok(())
}

/// Checks the spare-capacity index against the blocks it describes.
pub fn check_block_set(set: &AllocatorBlockSet) -> Result<(), Violation> {
    if !set.magic_ok() {
        return Err(Violation::BlockSetMagic);
    }

    let index = set.available_blocks();
    for &(indexed, block) in index {
        let Some(b) = set.blocks().get(block) else {
            return Err(Violation::IndexOutOfRange { block });
        };
        if b.full() {
            return Err(Violation::IndexedBlockFull { block });
        }
        if b.last_max_alloc_available() != indexed {
            return Err(Violation::IndexStale { block, indexed, actual: b.last_max_alloc_available() });
        }
        let actual = b.max_alloc_available();
        if actual != indexed {
            return Err(Violation::IndexStale { block, indexed, actual });
        }
        if set.last_block_index() == Some(block) {
            return Err(Violation::LastBlockIndexed { block });
        }
    }

    if !set.available_index().is_strictly_sorted() {
        if index.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(Violation::IndexDuplicate);
        }
        return Err(Violation::IndexUnsorted);
    }
    Ok(())
}

// =============================================================================
// Enforcement
// =============================================================================

cfg_if::cfg_if! {
    if #[cfg(any(debug_assertions, feature = "debug"))] {
        #[inline]
        pub fn enforce_object_state(state: &ObjectState) {
            if let Err(violation) = check_object_state(state) {
                fatal(&violation);
            }
        }

        pub fn enforce_block(block: &AllocatorBlock) {
            if let Err(violation) = check_block(block) {
                fatal(&violation);
            }
        }

        pub fn enforce_block_set(set: &AllocatorBlockSet) {
            if let Err(violation) = check_block_set(set) {
                fatal(&violation);
            }
        }

        /// A destroy hit a header that is not in use.
        #[inline]
        pub fn enforce_not_double_free(addr: usize) {
            fatal(&Violation::DoubleFree { addr });
        }
    } else {
        #[inline(always)]
        pub fn enforce_object_state(_state: &ObjectState) {}

        #[inline(always)]
        pub fn enforce_block(_block: &AllocatorBlock) {}

        #[inline(always)]
        pub fn enforce_block_set(_set: &AllocatorBlockSet) {}

        #[inline(always)]
        pub fn enforce_not_double_free(_addr: usize) {}
    }
}
