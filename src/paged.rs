//! Two-level paged cell storage.
//!
//! A [`PagedVec`] holds a power-of-two number of cells as a list of
//! fixed-size boxed pages, so a table holding millions of entries is backed
//! by many 4096-cell allocations instead of one huge array. The shape is
//! fixed at construction; the owning table grows by building a fresh
//! `PagedVec` and draining the old one into it, and pages themselves never
//! reallocate or move.

use std::collections::TryReserveError;

/// Maximum number of cells in a single page.
pub(crate) const PAGE_LEN: usize = 4096;

/// `log2(PAGE_LEN)`.
pub(crate) const PAGE_SHIFT: u32 = 12;

/// Fixed-shape paged cell array.
///
/// Capacities at or below [`PAGE_LEN`] use a single short page; larger
/// capacities use `len / PAGE_LEN` full pages. A cell index splits into
/// `(index >> PAGE_SHIFT, index & inner_mask)`.
#[derive(Clone)]
pub(crate) struct PagedVec<T> {
    pages: Vec<Box<[T]>>,
    /// `min(len, PAGE_LEN) - 1`; selects the offset within a page.
    inner_mask: usize,
    /// Total cell count. Always a power of two.
    len: usize,
}

impl<T> PagedVec<T> {
    /// Allocate `len` cells, each initialized with `fill`.
    ///
    /// `len` must be a power of two.
    pub(crate) fn with_capacity(len: usize, mut fill: impl FnMut() -> T) -> Self {
        assert!(len.is_power_of_two(), "paged capacity must be a power of two");
        let page_len = len.min(PAGE_LEN);
        let mut pages = Vec::with_capacity(Self::page_count_for(len));
        for _ in 0..Self::page_count_for(len) {
            pages.push((0..page_len).map(|_| fill()).collect());
        }
        Self {
            pages,
            inner_mask: page_len - 1,
            len,
        }
    }

    /// Like [`PagedVec::with_capacity`], but every allocation is fallible.
    ///
    /// On failure nothing is leaked and nothing half-built escapes; growth
    /// uses this so an allocation error leaves the old table untouched.
    pub(crate) fn try_with_capacity(
        len: usize,
        mut fill: impl FnMut() -> T,
    ) -> Result<Self, TryReserveError> {
        assert!(len.is_power_of_two(), "paged capacity must be a power of two");
        let page_len = len.min(PAGE_LEN);
        let page_count = Self::page_count_for(len);
        let mut pages = Vec::new();
        pages.try_reserve_exact(page_count)?;
        for _ in 0..page_count {
            let mut page = Vec::new();
            page.try_reserve_exact(page_len)?;
            page.extend((0..page_len).map(|_| fill()));
            pages.push(page.into_boxed_slice());
        }
        Ok(Self {
            pages,
            inner_mask: page_len - 1,
            len,
        })
    }

    #[inline]
    fn page_count_for(len: usize) -> usize {
        if len <= PAGE_LEN {
            1
        } else {
            len >> PAGE_SHIFT
        }
    }

    /// Total cell count.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Number of backing pages.
    #[inline]
    pub(crate) fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> &T {
        debug_assert!(index < self.len, "cell index {} out of range", index);
        &self.pages[index >> PAGE_SHIFT][index & self.inner_mask]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, index: usize) -> &mut T {
        debug_assert!(index < self.len, "cell index {} out of range", index);
        &mut self.pages[index >> PAGE_SHIFT][index & self.inner_mask]
    }

    /// Mutable page-major traversal of every cell.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.pages.iter_mut().flat_map(|page| page.iter_mut())
    }

    /// Consume the storage, yielding cells in page-major index order.
    pub(crate) fn into_cells(self) -> impl Iterator<Item = T> {
        self.pages.into_iter().flat_map(|page| page.into_vec())
    }
}
