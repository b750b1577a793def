//! Object state: the header written in front of every allocation.
//!
//! Headers carry no size field. A payload runs from `object_start()` up to the
//! next header, so `next` must be valid for every header except the untouched
//! tail of a block.
//!
//! Two words are tagged pointers:
//!
//! ```text
//!   next:       [ next header address ......... | quasi | valid | in_use ]
//!   user_data:  [ user data address ........... |   user flags (3 bits)  ]
//! ```
//!
//! All bit twiddling on `next` lives in [`NextWord`]. Every field is an atomic
//! word so a foreign thread can flip the quasi-freed bit while the owner holds
//! shared references into the same chain.

use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Violation;
use crate::{ALIGNMENT, align_up, verify};

const IN_USE_BIT: usize = 1;
const NEXT_VALID_BIT: usize = 2;
const QUASI_FREED_BIT: usize = 4;
const TAG_MASK: usize = 7;

/// Sentinel written before the mutable words.
pub const PRE_MAGIC: usize = 0x2ab7_8593;
/// Sentinel written after the mutable words.
pub const POST_MAGIC: usize = 0x45a8_cda0;

/// Size of a header once padded to [`ALIGNMENT`].
pub const HEADER_SIZE: usize = align_up(size_of::<ObjectState>(), ALIGNMENT);

const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(core::mem::align_of::<ObjectState>() == ALIGNMENT);
const _: () = assert!(size_of::<ObjectState>() == 4 * size_of::<usize>());

// =============================================================================
// Tagged next word
// =============================================================================

/// Snapshot of a header's `next` word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NextWord(usize);

impl NextWord {
    #[inline]
    pub fn pack(next: *mut ObjectState, in_use: bool, next_valid: bool, quasi_freed: bool) -> Self {
        Self(
            next.expose_provenance()
                | in_use as usize
                | (next_valid as usize) << 1
                | (quasi_freed as usize) << 2,
        )
    }

    #[inline]
    pub fn bits(self) -> usize {
        self.0
    }

    #[inline]
    pub fn next(self) -> *mut ObjectState {
        ptr::with_exposed_provenance_mut(self.0 & !TAG_MASK)
    }

    #[inline]
    pub fn in_use(self) -> bool {
        self.0 & IN_USE_BIT != 0
    }

    #[inline]
    pub fn next_valid(self) -> bool {
        self.0 & NEXT_VALID_BIT != 0
    }

    #[inline]
    pub fn quasi_freed(self) -> bool {
        self.0 & QUASI_FREED_BIT != 0
    }

    /// In use or waiting for reconciliation.
    #[inline]
    pub fn not_available(self) -> bool {
        self.0 & (IN_USE_BIT | QUASI_FREED_BIT) != 0
    }

    #[inline]
    fn with_bit(self, bit: usize, value: bool) -> Self {
        Self((self.0 & !bit) | if value { bit } else { 0 })
    }

    /// Replaces the address and keeps only the in-use bit.
    #[inline]
    fn with_next(self, next: *mut ObjectState) -> Self {
        Self((next.expose_provenance() & !(IN_USE_BIT | NEXT_VALID_BIT)) | (self.0 & IN_USE_BIT))
    }
}

// =============================================================================
// Header
// =============================================================================

/// Per-allocation header. Plain data: placed with a raw write, never dropped.
#[repr(C, align(16))]
pub struct ObjectState {
    pre_magic: AtomicUsize,
    next: AtomicUsize,
    user_data: AtomicUsize,
    post_magic: AtomicUsize,
}

impl ObjectState {
    /// Total footprint of a header of `header_size` followed by `size` payload bytes.
    ///
    /// Returns `usize::MAX` when `size` is negative as a signed value or the sum overflows.
    pub const fn needed_size(header_size: usize, size: usize, alignment: usize) -> usize {
        if (size as isize) < 0 || (header_size as isize) < 0 {
            return usize::MAX;
        }
        let header = align_up(header_size, alignment);
        match header.checked_add(align_up(size, alignment)) {
            Some(total) => total,
            None => usize::MAX,
        }
    }

    /// Recovers the header that owns the payload starting at `ptr`.
    ///
    /// Pure address arithmetic. Aborts if the result is not header aligned.
    pub fn from_object_start(ptr: *const u8, alignment: usize) -> *mut ObjectState {
        let masked = ptr.addr() & !(alignment - 1);
        let header = masked.wrapping_sub(align_up(size_of::<ObjectState>(), alignment));
        if header % ALIGNMENT != 0 {
            verify::fatal(&Violation::MisalignedHeader { addr: header });
        }
        ptr.cast_mut()
            .wrapping_byte_sub(ptr.addr().wrapping_sub(header))
            .cast()
    }

    /// Writes a fresh header at `at` and returns `at`.
    ///
    /// # Safety
    /// `at` must be valid for writes of `HEADER_SIZE` bytes and `ALIGNMENT` aligned.
    pub unsafe fn write(at: *mut ObjectState, next: *mut ObjectState, in_use: bool, next_valid: bool) -> *mut ObjectState {
        unsafe {
            at.write(ObjectState {
                pre_magic: AtomicUsize::new(PRE_MAGIC),
                next: AtomicUsize::new(NextWord::pack(next, in_use, next_valid, false).bits()),
                user_data: AtomicUsize::new(0),
                post_magic: AtomicUsize::new(POST_MAGIC),
            });
        }
        at
    }

    #[inline]
    pub fn load(&self) -> NextWord {
        NextWord(self.next.load(Ordering::Acquire))
    }

    #[inline]
    fn store(&self, word: NextWord) {
        self.next.store(word.0, Ordering::Release);
    }

    /// Sets next, in use, next valid and quasi-freed at once, rewriting the magic words.
    #[inline]
    pub fn set_all(&self, next: *mut ObjectState, in_use: bool, next_valid: bool, quasi_freed: bool) {
        self.pre_magic.store(PRE_MAGIC, Ordering::Relaxed);
        self.store(NextWord::pack(next, in_use, next_valid, quasi_freed));
        self.post_magic.store(POST_MAGIC, Ordering::Relaxed);
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.load().in_use()
    }

    #[inline]
    pub fn set_in_use(&self, value: bool) {
        self.store(self.load().with_bit(IN_USE_BIT, value));
    }

    #[inline]
    pub fn not_available(&self) -> bool {
        self.load().not_available()
    }

    #[inline]
    pub fn next_valid(&self) -> bool {
        self.load().next_valid()
    }

    #[inline]
    pub fn set_next_valid(&self, value: bool) {
        self.store(self.load().with_bit(NEXT_VALID_BIT, value));
    }

    #[inline]
    pub fn quasi_freed(&self) -> bool {
        self.load().quasi_freed()
    }

    /// Owner-side setter. Quasi-freed and in-use are mutually exclusive.
    #[inline]
    pub fn set_quasi_freed(&self, value: bool) {
        debug_assert!(!(value && self.in_use()), "quasi-freed set on an in-use header");
        self.store(self.load().with_bit(QUASI_FREED_BIT, value));
    }

    /// Foreign-thread hand-off: clears in use and sets quasi-freed in one atomic step.
    ///
    /// Returns false if the header was not in use.
    pub fn mark_quasi_freed(&self) -> bool {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word & IN_USE_BIT != 0).then_some((word & !IN_USE_BIT) | QUASI_FREED_BIT)
            })
            .is_ok()
    }

    #[inline]
    pub fn next(&self) -> *mut ObjectState {
        self.load().next()
    }

    /// Replaces the next address. Keeps in use, clears next valid and quasi-freed.
    #[inline]
    pub fn set_next(&self, next: *mut ObjectState) {
        self.store(self.load().with_next(next));
    }

    #[inline]
    pub fn object_start(&self) -> *mut u8 {
        ptr::from_ref(self).cast_mut().cast::<u8>().wrapping_add(HEADER_SIZE)
    }

    /// Distance from the payload start to the next header.
    #[inline]
    pub fn object_size(&self) -> usize {
        self.next().addr().wrapping_sub(self.object_start().addr())
    }

    #[inline]
    pub fn object_end(&self) -> *mut u8 {
        self.next().cast()
    }

    pub fn user_data(&self) -> *mut () {
        ptr::with_exposed_provenance_mut(self.user_data.load(Ordering::Acquire) & !TAG_MASK)
    }

    /// User data must be at least 8-byte aligned. Flags are kept.
    pub fn set_user_data(&self, user_data: *mut ()) {
        debug_assert_eq!(user_data.addr() & TAG_MASK, 0, "user data must be 8-byte aligned");
        let flags = self.user_flags();
        self.user_data
            .store(user_data.expose_provenance() | flags, Ordering::Release);
    }

    pub fn user_flags(&self) -> usize {
        self.user_data.load(Ordering::Acquire) & TAG_MASK
    }

    pub fn set_user_flags(&self, flags: usize) {
        debug_assert!(flags < 8, "only 3 user flag bits");
        let data = self.user_data().expose_provenance();
        self.user_data.store(data | (flags & TAG_MASK), Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_user_data(&self) {
        self.user_data.store(0, Ordering::Relaxed);
    }

    /// True if both sentinels are intact.
    pub fn magic_ok(&self) -> bool {
        self.pre_magic.load(Ordering::Relaxed) == PRE_MAGIC
            && self.post_magic.load(Ordering::Relaxed) == POST_MAGIC
    }

    /// Aborts on a damaged sentinel. Compiled out unless verification is enabled.
    #[inline]
    pub fn verify_magic(&self) {
        verify::enforce_object_state(self);
    }
}

/// Defers a free from a thread that does not own the allocation.
///
/// Only flips header bits; the owning block reconciles it during `collect`.
/// Aborts if the allocation is not in use.
///
/// # Safety
/// `ptr` must be the payload pointer of a live allocation whose extent stays
/// mapped until the owner has run maintenance.
pub unsafe fn quasi_free(ptr: *mut u8) {
    let state = unsafe { &*ObjectState::from_object_start(ptr, ALIGNMENT) };
    state.verify_magic();
    if !state.mark_quasi_freed() {
        verify::fatal(&Violation::QuasiFreeNotInUse { addr: ptr.addr() });
    }
}
