//! # Page-Table Frame Pool
//!
//! Hands out 4 KiB page-table pages from a pre-reserved, contiguous region
//! ("page space") of at most [`MAX_POOL_PAGES`] pages. Occupancy is tracked
//! by a 32-bit bitmap, one bit per slot: bit set = slot in use.
//!
//! Tables refer to each other by physical address, as the hardware requires.
//! The pool resolves such an address back into a [`TableSlot`] with
//! [`FramePool::slot_of`], which bounds-checks it against the region and the
//! bitmap. A table page is therefore only ever reachable through an index
//! into the pool's own page slice.
//!
//! ## Example
//!
//! ```rust
//! # use kernel_paging::{FramePool, PhysicalAddress, TablePage};
//! let mut pages = vec![TablePage::zeroed(); 32];
//! let mut pool =
//!     FramePool::with_bitmap(&mut pages, PhysicalAddress::new(0x20_0000), 0xffff_fff7).unwrap();
//!
//! let slot = pool.allocate().unwrap();
//! assert_eq!(pool.offset_of(slot), 0x3000);
//! assert_eq!(pool.bitmap(), 0xffff_ffff);
//! assert!(pool.allocate().is_none());
//! ```

use crate::addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use crate::error::PagingError;
use crate::{ENTRIES_PER_TABLE, MAX_POOL_PAGES, TABLE_PAGE_SIZE};
use log::trace;

/// One raw 4 KiB page of pool storage.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct TablePage([u64; ENTRIES_PER_TABLE]);

const _: () = {
    assert!(size_of::<TablePage>() == TABLE_PAGE_SIZE);
    assert!(align_of::<TablePage>() == TABLE_PAGE_SIZE);
};

impl TablePage {
    /// A page with every entry non-present.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self([0; ENTRIES_PER_TABLE])
    }
}

impl Default for TablePage {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Index of an allocated page inside a [`FramePool`].
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableSlot(u8);

impl TableSlot {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Typed tables that may be overlaid on a [`TablePage`].
///
/// # Safety
/// Implementors must be `repr(C, align(4096))`, exactly 4096 bytes large and
/// valid for every bit pattern (512 `repr(transparent)` `u64` entries).
pub(crate) unsafe trait TableStorage: Sized {}

/// Allocator for page-table pages backed by a fixed page slice.
pub struct FramePool<'a> {
    pages: &'a mut [TablePage],
    base: PhysicalPage<Size4K>,
    bitmap: u32,
}

impl<'a> FramePool<'a> {
    /// Create a pool over `pages`, which live at physical address `base`.
    ///
    /// All slots start out free.
    ///
    /// # Errors
    /// - [`PagingError::InvalidPoolSize`] if `pages` is empty or longer than 32 pages.
    /// - [`PagingError::MisalignedPool`] if `base` is not 4 KiB aligned.
    pub fn new(pages: &'a mut [TablePage], base: PhysicalAddress) -> Result<Self, PagingError> {
        Self::with_bitmap(pages, base, 0)
    }

    /// Create a pool with a caller-initialized allocation bitmap.
    ///
    /// Bits beyond the pool's capacity are kept as given but never handed out.
    ///
    /// # Errors
    /// Same as [`FramePool::new`].
    pub fn with_bitmap(
        pages: &'a mut [TablePage],
        base: PhysicalAddress,
        bitmap: u32,
    ) -> Result<Self, PagingError> {
        if pages.is_empty() || pages.len() > MAX_POOL_PAGES {
            return Err(PagingError::InvalidPoolSize(pages.len()));
        }
        if !base.is_aligned(Size4K::SIZE) {
            return Err(PagingError::MisalignedPool(base));
        }
        Ok(Self {
            pages,
            base: base.page(),
            bitmap,
        })
    }

    /// The current allocation bitmap.
    #[inline]
    #[must_use]
    pub const fn bitmap(&self) -> u32 {
        self.bitmap
    }

    /// Number of pages backing this pool.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.pages.len()
    }

    /// Physical base of the pool region.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base.base()
    }

    /// Number of slots that can still be allocated.
    #[inline]
    #[must_use]
    pub const fn free_slots(&self) -> usize {
        (!self.bitmap & self.capacity_mask()).count_ones() as usize
    }

    /// Number of slots in use.
    #[inline]
    #[must_use]
    pub const fn used_slots(&self) -> usize {
        (self.bitmap & self.capacity_mask()).count_ones() as usize
    }

    /// Allocate one zeroed table page.
    ///
    /// Scans the bitmap from bit 0 upward for the first clear bit. Returns
    /// `None` if the pool is exhausted.
    #[allow(clippy::cast_possible_truncation)]
    pub fn allocate(&mut self) -> Option<TableSlot> {
        let free = !self.bitmap & self.capacity_mask();
        if free == 0 {
            return None;
        }

        let index = free.trailing_zeros();
        self.bitmap |= 1 << index;
        self.pages[index as usize] = TablePage::zeroed();

        let slot = TableSlot(index as u8);
        trace!("pool: allocated slot {index} at {}", self.physical_page(slot));
        Some(slot)
    }

    /// Return a page to the pool.
    ///
    /// The slot must have been handed out by [`FramePool::allocate`] (or
    /// resolved by [`FramePool::slot_of`]) on this pool.
    pub fn deallocate(&mut self, slot: TableSlot) {
        debug_assert!(self.is_allocated(slot.index()), "double free of {slot:?}");
        self.bitmap &= !(1 << slot.0);
        trace!("pool: released slot {}", slot.0);
    }

    /// Physical page backing `slot`.
    #[inline]
    #[must_use]
    pub fn physical_page(&self, slot: TableSlot) -> PhysicalPage<Size4K> {
        (self.base.base() + self.offset_of(slot)).page()
    }

    /// Byte offset of `slot` from the start of the pool.
    #[inline]
    #[must_use]
    pub const fn offset_of(&self, slot: TableSlot) -> u64 {
        slot.0 as u64 * TABLE_PAGE_SIZE as u64
    }

    /// Resolve the physical page stored in a child pointer into a slot.
    ///
    /// # Errors
    /// [`PagingError::ForeignTable`] if the page lies outside the pool or its
    /// slot is not allocated.
    #[allow(clippy::cast_possible_truncation)]
    pub fn slot_of(&self, page: PhysicalPage<Size4K>) -> Result<TableSlot, PagingError> {
        let foreign = PagingError::ForeignTable(page.base());
        let offset = page
            .base()
            .as_u64()
            .checked_sub(self.base.base().as_u64())
            .ok_or(foreign)?;

        let index = offset / TABLE_PAGE_SIZE as u64;
        if index >= self.capacity() as u64 || !self.is_allocated(index as usize) {
            return Err(foreign);
        }
        Ok(TableSlot(index as u8))
    }

    /// Borrow the page in `slot` as table type `T`.
    #[inline]
    pub(crate) fn table<T: TableStorage>(&self, slot: TableSlot) -> &T {
        const { assert!(size_of::<T>() == size_of::<TablePage>()) };
        const { assert!(align_of::<T>() == align_of::<TablePage>()) };
        let page: *const TablePage = &self.pages[slot.index()];
        // SAFETY: `T: TableStorage` has the layout of a `TablePage` and accepts
        // any bit pattern; the borrow is tied to `&self`.
        unsafe { &*page.cast::<T>() }
    }

    /// Mutably borrow the page in `slot` as table type `T`.
    #[inline]
    pub(crate) fn table_mut<T: TableStorage>(&mut self, slot: TableSlot) -> &mut T {
        const { assert!(size_of::<T>() == size_of::<TablePage>()) };
        const { assert!(align_of::<T>() == align_of::<TablePage>()) };
        let page: *mut TablePage = &mut self.pages[slot.index()];
        // SAFETY: as in `table`; the borrow is tied to `&mut self`.
        unsafe { &mut *page.cast::<T>() }
    }

    #[inline]
    const fn is_allocated(&self, index: usize) -> bool {
        self.bitmap & (1 << index) != 0
    }

    #[inline]
    const fn capacity_mask(&self) -> u32 {
        if self.pages.len() >= MAX_POOL_PAGES {
            u32::MAX
        } else {
            (1 << self.pages.len()) - 1
        }
    }
}
