//! # x86-64 Page Table (PT / L1)
//!
//! This module models the lowest paging level (L1, Page Table).
//!
//! - [`PtEntry`]: a PT entry (PTE). Every present entry maps one 4 KiB page.
//! - [`Pte`]: bitfield view of a PTE.
//! - [`PageTable`]: a 4 KiB-aligned array of 512 PTEs.
//!
//! ## Semantics
//!
//! - L1 does **not** point to another table. Bit 7 is the PAT selector, not `PS`.
//! - The base address stored in a PTE is 4 KiB-aligned (hardware requirement).

use crate::ENTRIES_PER_TABLE;
use crate::addresses::{
    PageGranularity, PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};
use crate::attributes::EntryAttributes;
use crate::error::PagingError;
use crate::page_table::{LeafLevel, Level, Mapping, PRESENT_BIT, Span};
use crate::pool::{FramePool, TableSlot, TableStorage};
use bitfield_struct::bitfield;

/// L1 **PTE**: maps a single 4 KiB page.
#[bitfield(u64)]
pub struct Pte {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User (bit 2).
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5).
    pub accessed: bool,
    /// Dirty (bit 6): set by CPU on first write.
    pub dirty: bool,
    /// PAT selector for 4 KiB pages (bit 7).
    pub pat_small: bool,
    /// Global (bit 8).
    pub global: bool,
    /// OS-available low (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// Page base physical address (bits 12..51).
    #[bits(40)]
    phys_addr_51_12: u64,
    /// OS-available high (bits 52..58).
    #[bits(7)]
    pub os_available_high: u8,
    /// Protection Key / OS use (59..62).
    #[bits(4)]
    pub protection_key: u8,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

impl Pte {
    /// Set the 4 KiB page base.
    #[inline]
    #[must_use]
    pub const fn with_physical_page(mut self, phys: PhysicalPage<Size4K>) -> Self {
        self.set_phys_addr_51_12(phys.base().as_u64() >> 12);
        self
    }

    /// Get the 4 KiB page base.
    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.phys_addr_51_12() << 12))
    }
}

/// A single Page Table entry (PTE).
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct PtEntry(u64);

impl core::fmt::Debug for PtEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.page_4k() {
            Some((page, attrs)) => write!(f, "PtEntry({page}, {attrs:?})"),
            None => f.write_str("PtEntry(absent)"),
        }
    }
}

impl PtEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Construct from a raw 64-bit value (no validation).
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Return the raw 64-bit value (flags + address).
    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & PRESENT_BIT != 0
    }

    /// Typed bitfield view.
    #[inline]
    #[must_use]
    pub const fn view(self) -> Pte {
        Pte::from_bits(self.0)
    }

    /// Create a present 4 KiB leaf mapping `page` with `attrs`.
    #[inline]
    #[must_use]
    pub const fn present_with(attrs: EntryAttributes, page: PhysicalPage<Size4K>) -> Self {
        let pte = Pte::from_bits(attrs.entry_bits())
            .with_present(true)
            .with_physical_page(page);
        Self(pte.into_bits())
    }

    /// If present, return the mapped 4 KiB page and its attributes.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<(PhysicalPage<Size4K>, EntryAttributes)> {
        if !self.is_present() {
            return None;
        }
        Some((
            self.view().physical_page(),
            EntryAttributes::from_entry_bits(self.0),
        ))
    }
}

/// The Page Table (L1): 512 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES_PER_TABLE],
}

// SAFETY: 512 transparent `u64`s, 4 KiB aligned; every bit pattern is an entry.
unsafe impl TableStorage for PageTable {}

impl PageTable {
    /// Create a fully zeroed Page Table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    /// Read the entry at `i`.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PtEntry {
        self.entries[i]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: usize, e: PtEntry) {
        self.entries[i] = e;
    }
}

impl Level for PageTable {
    const NAME: &'static str = "PT";
    const SHIFT: u32 = 12;

    fn tables_needed(
        _pool: &FramePool<'_>,
        _table: Option<TableSlot>,
        _span: Span,
        _phys: PhysicalAddress,
        _attrs: EntryAttributes,
    ) -> Result<usize, PagingError> {
        Ok(0)
    }

    fn map_region(
        pool: &mut FramePool<'_>,
        table: TableSlot,
        span: Span,
        phys: PhysicalAddress,
        attrs: EntryAttributes,
    ) -> Result<(), PagingError> {
        let pt = pool.table_mut::<Self>(table);
        let mut phys = phys;
        for i in span.bounds(Self::SHIFT).indices() {
            pt.set(i, PtEntry::present_with(attrs, phys.page()));
            phys += Size4K::SIZE;
        }
        Ok(())
    }

    fn unmap_tables_needed(
        _pool: &FramePool<'_>,
        _table: Option<TableSlot>,
        _span: Span,
    ) -> Result<usize, PagingError> {
        Ok(0)
    }

    fn unmap_region(
        pool: &mut FramePool<'_>,
        table: TableSlot,
        span: Span,
    ) -> Result<(), PagingError> {
        let pt = pool.table_mut::<Self>(table);
        for i in span.bounds(Self::SHIFT).indices() {
            pt.set(i, PtEntry::zero());
        }
        Ok(())
    }

    fn lookup(
        pool: &FramePool<'_>,
        table: TableSlot,
        va: VirtualAddress,
    ) -> Result<Mapping, PagingError> {
        let entry = pool.table::<Self>(table).get(va.table_index(Self::SHIFT));
        let (page, attributes) = entry.page_4k().ok_or(PagingError::Unmapped(va))?;
        Ok(Mapping {
            frame: page.base(),
            granularity: PageGranularity::Size4K,
            attributes,
        })
    }

    fn clear_all(pool: &mut FramePool<'_>, table: TableSlot) {
        *pool.table_mut::<Self>(table) = Self::zeroed();
    }
}

impl LeafLevel for PageTable {
    type Page = Size4K;

    #[inline]
    fn set_leaf(&mut self, i: usize, page: PhysicalPage<Size4K>, attrs: EntryAttributes) {
        self.set(i, PtEntry::present_with(attrs, page));
    }

    #[inline]
    fn set_absent(&mut self, i: usize) {
        self.set(i, PtEntry::zero());
    }

    #[inline]
    fn is_present(&self, i: usize) -> bool {
        self.get(i).is_present()
    }

    fn is_uniform(
        pool: &FramePool<'_>,
        table: TableSlot,
        base: PhysicalAddress,
        attrs: EntryAttributes,
    ) -> bool {
        let pt = pool.table::<Self>(table);
        (0..ENTRIES_PER_TABLE).all(|i| {
            pt.get(i).page_4k().is_some_and(|(page, a)| {
                page.base() == base + i as u64 * Size4K::SIZE && a == attrs
            })
        })
    }
}
