//! Allocator block: one contiguous extent carved into header-prefixed objects.
//!
//! The extent is a chain of [`ObjectState`] headers, each one's payload running
//! up to the next header. Allocation tries the best-fit free set first and
//! falls back to bumping the untouched tail:
//!
//! ```text
//!   start                                                        end
//!   | H | live | H | free | H | live | H (tail) | untouched ...... |
//!                  ^ free set                  ^ next_alloc
//! ```
//!
//! Destroy only merges with the physical successor. Predecessor merges and
//! quasi-freed headers are handled by [`AllocatorBlock::collect`], which
//! rescans the whole chain.

use core::mem::size_of;
use core::ptr::{self, NonNull};

use crate::arena::Extent;
use crate::error::Violation;
use crate::flat_set::FlatSet;
use crate::object_state::{HEADER_SIZE, ObjectState};
use crate::{ALIGNMENT, verify};

/// Free set entry. Orders by payload size, ties broken by header address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct FreeEntry {
    size: usize,
    addr: usize,
}

/// A live allocation handed out by a block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Allocation {
    /// First payload byte. `ALIGNMENT` aligned.
    pub ptr: NonNull<u8>,
    /// Usable payload bytes, at least the requested size.
    pub size: usize,
    /// Header owning the payload.
    pub state: NonNull<ObjectState>,
}

impl Allocation {
    fn new(state: &ObjectState) -> Self {
        let state = NonNull::from(state);
        let header = unsafe { state.as_ref() };
        Self {
            // Payload of a header inside a non-null extent is never null.
            ptr: unsafe { NonNull::new_unchecked(header.object_start()) },
            size: header.object_size(),
            state,
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

/// Snapshot of a block's occupancy.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct BlockStats {
    pub memory_size: usize,
    pub live_objects: usize,
    pub live_bytes: usize,
    pub quasi_freed: usize,
    pub free_entries: usize,
    pub free_bytes: usize,
    pub tail_bytes: usize,
    pub max_alloc_available: usize,
}

// =============================================================================
// Block
// =============================================================================

pub struct AllocatorBlock {
    start: NonNull<u8>,
    len: usize,
    /// Untouched tail header, null once the tail has been handed out.
    next_alloc: *mut ObjectState,
    free_list: FlatSet<FreeEntry>,
    minimum_alloc_length: usize,
    maximum_alloc_length: usize,
    last_max_alloc_available: usize,
}

// SAFETY: the block exclusively owns its extent and every header in it. The
// only state other threads touch is a header's atomic `next` word, through
// `quasi_free`.
unsafe impl Send for AllocatorBlock {}

impl AllocatorBlock {
    /// Takes over `extent` for objects of `min_payload..=max_payload` bytes.
    ///
    /// Aborts if the extent is misaligned or cannot hold one minimum object.
    ///
    /// # Safety
    /// `extent` must be valid for reads and writes, and nothing else may
    /// access it while the block lives.
    pub unsafe fn new(extent: Extent, min_payload: usize, max_payload: usize) -> Self {
        let minimum_alloc_length = ObjectState::needed_size(HEADER_SIZE, min_payload.max(1), ALIGNMENT);
        let maximum_alloc_length = ObjectState::needed_size(HEADER_SIZE, max_payload, ALIGNMENT);
        let start = extent.start();
        let len = extent.len();
        if start.as_ptr().addr() % ALIGNMENT != 0 || len % ALIGNMENT != 0 || len < minimum_alloc_length {
            verify::fatal(&Violation::MisalignedExtent { start: start.as_ptr().addr(), len });
        }

        let tail = start.as_ptr().cast::<ObjectState>();
        let end = start.as_ptr().wrapping_add(len).cast::<ObjectState>();
        unsafe { ObjectState::write(tail, end, false, false) };

        let mut block = Self {
            start,
            len,
            next_alloc: tail,
            free_list: FlatSet::new(),
            minimum_alloc_length,
            maximum_alloc_length,
            last_max_alloc_available: 0,
        };
        block.last_max_alloc_available = block.max_alloc_available();
        block
    }

    #[inline]
    fn state_at(&self, addr: usize) -> *mut ObjectState {
        self.start.as_ptr().with_addr(addr).cast()
    }

    #[inline]
    fn end_state(&self) -> *mut ObjectState {
        self.end().cast()
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.start.as_ptr().wrapping_add(self.len)
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.start, self.len)
    }

    /// End of the touched region: the tail header, or the extent end.
    #[inline]
    pub fn current_end(&self) -> *mut u8 {
        if self.next_alloc.is_null() { self.end() } else { self.next_alloc.cast() }
    }

    /// Untouched tail header, if any of the tail is left.
    #[inline]
    pub fn tail(&self) -> Option<NonNull<ObjectState>> {
        NonNull::new(self.next_alloc)
    }

    #[inline]
    pub fn minimum_alloc_length(&self) -> usize {
        self.minimum_alloc_length
    }

    #[inline]
    pub fn maximum_alloc_length(&self) -> usize {
        self.maximum_alloc_length
    }

    /// True if `ptr` lies inside the extent, past the first header.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr.addr();
        addr > self.start.as_ptr().addr() && addr < self.end().addr()
    }

    /// Largest payload a single allocation could get right now.
    #[inline]
    pub fn max_alloc_available(&self) -> usize {
        let tail = match self.tail() {
            Some(tail) => unsafe { tail.as_ref() }.object_size(),
            None => 0,
        };
        let free = self.free_list.last().map_or(0, |entry| entry.size);
        tail.max(free)
    }

    /// Value of [`max_alloc_available`](Self::max_alloc_available) after the last mutation.
    #[inline]
    pub fn last_max_alloc_available(&self) -> usize {
        self.last_max_alloc_available
    }

    /// The whole extent is untouched tail. Can read false until `collect` has merged frees.
    #[inline]
    pub fn is_empty(&self) -> bool {
        ptr::eq(self.next_alloc.cast::<u8>(), self.begin())
    }

    /// No free entry and no tail left.
    #[inline]
    pub fn full(&self) -> bool {
        self.free_list.is_empty() && self.next_alloc.is_null()
    }

    #[inline]
    pub fn memory_size(&self) -> usize {
        self.len
    }

    /// Heap bytes held by the free set.
    pub fn secondary_memory_used(&self) -> usize {
        self.free_list.capacity() * size_of::<FreeEntry>()
    }

    pub fn shrink_secondary_memory_usage_to_fit(&mut self) {
        self.free_list.shrink_to_fit();
    }

    // =========================================================================
    // Allocate / destroy
    // =========================================================================

    /// Carves out `size` payload bytes, or `None` if this block cannot.
    pub fn allocate(&mut self, size: usize) -> Option<Allocation> {
        let needed = ObjectState::needed_size(HEADER_SIZE, size.max(1), ALIGNMENT);
        if needed == usize::MAX {
            return None;
        }
        let payload = needed - HEADER_SIZE;

        let allocation = match self.free_list.lower_bound(&FreeEntry { size: payload, addr: 0 }) {
            Some(pos) => self.allocate_from_free(pos, payload),
            None => self.allocate_from_tail(needed)?,
        };
        self.last_max_alloc_available = self.max_alloc_available();
        Some(allocation)
    }

    fn allocate_from_free(&mut self, pos: usize, payload: usize) -> Allocation {
        let entry = self.free_list.remove_at(pos);
        let state = unsafe { &*self.state_at(entry.addr) };
        state.verify_magic();

        if entry.size >= payload + self.minimum_alloc_length {
            let split = state.object_start().wrapping_add(payload).cast::<ObjectState>();
            let remainder = unsafe { &*ObjectState::write(split, state.next(), false, true) };
            self.free_list.insert(FreeEntry { size: remainder.object_size(), addr: split.addr() });
            state.set_all(split, true, true, false);
        } else {
            state.set_in_use(true);
        }
        Allocation::new(state)
    }

    fn allocate_from_tail(&mut self, needed: usize) -> Option<Allocation> {
        let tail_ptr = self.next_alloc;
        if tail_ptr.is_null() {
            return None;
        }
        let room = self.end().addr() - tail_ptr.addr();
        if needed > room {
            return None;
        }

        let tail = unsafe { &*tail_ptr };
        tail.verify_magic();
        if room - needed < self.minimum_alloc_length {
            tail.set_all(self.end_state(), true, true, false);
            self.next_alloc = ptr::null_mut();
        } else {
            let new_tail = tail_ptr.wrapping_byte_add(needed);
            unsafe { ObjectState::write(new_tail, self.end_state(), false, false) };
            tail.set_all(new_tail, true, true, false);
            self.next_alloc = new_tail;
        }
        Some(Allocation::new(tail))
    }

    /// Frees the allocation whose payload starts at `ptr`.
    ///
    /// Returns false if `ptr` is outside this block. A header that is not in
    /// use is a double free: fatal with verification on, false otherwise.
    pub fn destroy(&mut self, ptr: *mut u8) -> bool {
        if !self.contains(ptr) {
            return false;
        }
        let state_ptr = ObjectState::from_object_start(ptr, ALIGNMENT);
        if state_ptr.addr() < self.begin().addr() {
            return false;
        }
        let state = unsafe { &*state_ptr };
        state.verify_magic();
        if !state.in_use() {
            verify::enforce_not_double_free(ptr.addr());
            return false;
        }
        state.clear_user_data();

        let end = self.end_state();
        let mut next = state.next();
        if ptr::eq(next, self.next_alloc) {
            next = end;
        } else if !ptr::eq(next, end) {
            let successor = unsafe { &*next };
            successor.verify_magic();
            let word = successor.load();
            if word.next_valid() && !word.not_available() {
                let entry = FreeEntry { size: successor.object_size(), addr: next.addr() };
                if !self.free_list.remove(&entry) {
                    verify::fatal(&Violation::FreeEntryMissing { addr: next.addr() });
                }
                next = word.next();
            }
        }

        if ptr::eq(next, end) {
            state.set_all(end, false, false, false);
            self.next_alloc = state_ptr;
        } else {
            state.set_all(next, false, true, false);
            self.free_list.insert(FreeEntry { size: state.object_size(), addr: state_ptr.addr() });
        }
        self.last_max_alloc_available = self.max_alloc_available();
        true
    }

    /// Rebuilds the free set from a full scan of the chain.
    ///
    /// Quasi-freed headers become free (adding one to `num_quasifreed` each),
    /// every run of adjacent free headers merges into its first header, and a
    /// run reaching the touched end becomes the untouched tail.
    pub fn collect(&mut self, num_quasifreed: &mut usize) {
        self.free_list.clear();
        let current_end = self.current_end().addr();
        let mut cur = self.begin().cast::<ObjectState>();
        let mut run: Option<*mut ObjectState> = None;

        while cur.addr() < current_end {
            let state = unsafe { &*cur };
            state.verify_magic();
            let mut word = state.load();
            if word.quasi_freed() {
                state.set_quasi_freed(false);
                state.clear_user_data();
                *num_quasifreed += 1;
                word = state.load();
            }
            let next = word.next();
            if next.addr() <= cur.addr() {
                verify::fatal(&Violation::ChainOverlap { addr: cur.addr(), next: next.addr() });
            }

            if word.not_available() {
                if let Some(first) = run.take() {
                    self.close_run(first, cur);
                }
            } else if run.is_none() {
                run = Some(cur);
            }
            cur = next;
        }

        if let Some(first) = run {
            unsafe { &*first }.set_all(self.end_state(), false, false, false);
            self.next_alloc = first;
        }
        self.last_max_alloc_available = self.max_alloc_available();
        verify::enforce_block(self);
    }

    fn close_run(&mut self, first: *mut ObjectState, next: *mut ObjectState) {
        let state = unsafe { &*first };
        state.set_all(next, false, true, false);
        self.free_list.insert(FreeEntry { size: state.object_size(), addr: first.addr() });
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every header in address order, the untouched tail included.
    pub fn objects(&self) -> Objects<'_> {
        Objects { cur: self.begin().cast(), end: self.end_state(), _block: self }
    }

    /// Free set contents as `(payload size, header)`, smallest first.
    pub fn free_entries(&self) -> impl Iterator<Item = (usize, NonNull<ObjectState>)> + '_ {
        self.free_list.iter().filter_map(|entry| {
            NonNull::new(self.state_at(entry.addr)).map(|state| (entry.size, state))
        })
    }

    /// Header whose payload contains `addr`, tail excluded.
    pub fn find_address(&self, addr: *const u8) -> Option<NonNull<ObjectState>> {
        if !self.contains(addr) || addr.addr() >= self.current_end().addr() {
            return None;
        }
        self.objects()
            .find(|state| {
                state.next_valid()
                    && state.object_start().addr() <= addr.addr()
                    && addr.addr() < state.object_end().addr()
            })
            .map(NonNull::from)
    }

    pub fn stats(&self) -> BlockStats {
        let mut stats = BlockStats {
            memory_size: self.len,
            free_entries: self.free_list.len(),
            max_alloc_available: self.max_alloc_available(),
            ..BlockStats::default()
        };
        for state in self.objects() {
            let word = state.load();
            if !word.next_valid() {
                stats.tail_bytes = state.object_size();
            } else if word.in_use() {
                stats.live_objects += 1;
                stats.live_bytes += state.object_size();
            } else if word.quasi_freed() {
                stats.quasi_freed += 1;
            } else {
                stats.free_bytes += state.object_size();
            }
        }
        stats
    }
}

impl core::fmt::Debug for AllocatorBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AllocatorBlock")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("free_entries", &self.free_list.len())
            .field("last_max_alloc_available", &self.last_max_alloc_available)
            .finish()
    }
}

/// Iterator over a block's header chain.
pub struct Objects<'a> {
    cur: *mut ObjectState,
    end: *mut ObjectState,
    _block: &'a AllocatorBlock,
}

impl<'a> Iterator for Objects<'a> {
    type Item = &'a ObjectState;

    fn next(&mut self) -> Option<&'a ObjectState> {
        if self.cur.addr() >= self.end.addr() {
            return None;
        }
        let state = unsafe { &*self.cur };
        let next = state.next();
        // A chain that does not move forward is corrupt; stop rather than spin.
        self.cur = if next.addr() > self.cur.addr() { next } else { self.end };
        Some(state)
    }
}
