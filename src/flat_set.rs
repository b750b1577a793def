//! Sorted, duplicate-free vector set.
//!
//! Backs both the per-block free set (ordered by size, then address) and the
//! block set's spare-capacity index (ordered by bytes available, then block).
//! Lookups are binary searches; inserts and removals shift the tail.

/// Ordered set stored contiguously.
#[derive(Debug, Clone, Default)]
pub struct FlatSet<T> {
    items: Vec<T>,
}

impl<T: Ord + Copy> FlatSet<T> {
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Builds a set from arbitrary items, sorting and dropping duplicates.
    pub fn from_unsorted(mut items: Vec<T>) -> Self {
        items.sort_unstable();
        items.dedup();
        Self { items }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns false if the value was already present.
    pub fn insert(&mut self, value: T) -> bool {
        match self.items.binary_search(&value) {
            Ok(_) => false,
            Err(pos) => {
                self.items.insert(pos, value);
                true
            }
        }
    }

    /// Returns false if the value was not present.
    pub fn remove(&mut self, value: &T) -> bool {
        match self.items.binary_search(value) {
            Ok(pos) => {
                self.items.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Position of the first item not less than `value`.
    #[inline]
    pub fn lower_bound(&self, value: &T) -> Option<usize> {
        let pos = self.items.partition_point(|item| item < value);
        (pos < self.items.len()).then_some(pos)
    }

    #[inline]
    pub fn remove_at(&mut self, pos: usize) -> T {
        self.items.remove(pos)
    }

    #[inline]
    pub fn last(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Rewrites every item in place. `f` must be strictly monotone.
    pub fn map_in_place(&mut self, mut f: impl FnMut(T) -> T) {
        for item in &mut self.items {
            *item = f(*item);
        }
    }

    /// True if every item is strictly less than its successor.
    pub fn is_strictly_sorted(&self) -> bool {
        self.items.windows(2).all(|pair| pair[0] < pair[1])
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn shrink_to_fit(&mut self) {
        self.items.shrink_to_fit();
    }
}
