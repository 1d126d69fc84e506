//! # x86-64 Page Directory Pointer Table (PDPT / L3)
//!
//! - [`PdptEntry`]: a PDPT entry that is either a pointer to a PD (`PS=0`) or a 1 GiB leaf (`PS=1`).
//! - [`PdptEntryKind`]: decoded view of an entry.
//! - [`PageDirectoryPointerTable`]: a 4 KiB-aligned array of 512 entries.
//!
//! ## Semantics
//!
//! - `PS=0`: entry points to a Page Directory; bits 12..51 hold its base.
//! - `PS=1`: entry maps a 1 GiB page; bits 30..51 hold its base, bit 12 is PAT.

use crate::ENTRIES_PER_TABLE;
use crate::addresses::{PhysicalAddress, PhysicalPage, Size1G, Size4K, VirtualAddress};
use crate::attributes::EntryAttributes;
use crate::error::PagingError;
use crate::page_table::pd::PageDirectory;
use crate::page_table::{
    EntryState, HugeLevel, LeafLevel, Level, Mapping, PRESENT_BIT, PS_BIT, Span, clear_huge,
    count_huge, count_unmap_huge, is_uniform_huge, lookup_huge, map_huge, unmap_huge,
};
use crate::pool::{FramePool, TableSlot, TableStorage};
use bitfield_struct::bitfield;

/// L3 **PDPTE**: pointer to a **Page Directory** (non-leaf; PS **= 0**).
///
/// Setting PS here would mean a 1 GiB leaf; use [`Pdpte1G`] for that.
#[bitfield(u64)]
pub struct Pdpte {
    /// Present (bit 0): valid entry if set.
    pub present: bool,
    /// Writable (bit 1): write permission.
    pub writable: bool,
    /// User (bit 2): user-mode access if set.
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5).
    pub accessed: bool,
    /// Dirty (bit 6): **ignored** in non-leaf form.
    #[bits(1)]
    __d_ignored: u8,
    /// PS (bit 7): **must be 0** in non-leaf.
    #[bits(1)]
    __ps_must_be_0: u8,
    /// Global (bit 8): **ignored** in non-leaf.
    #[bits(1)]
    __g_ignored: u8,
    /// OS-available low (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// Next-level table physical address (bits 12..51, 4 KiB-aligned).
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

/// L3 **PDPTE (1 GiB leaf)**: maps a single 1 GiB page (`PS = 1`).
#[bitfield(u64)]
pub struct Pdpte1G {
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
    /// **Dirty** (bit 6): set by CPU on first write to this 1 GiB page.
    pub dirty: bool,
    /// **Page Size** (bit 7): **must be 1** for 1 GiB leaf.
    #[bits(default = true)]
    page_size: bool,
    /// **Global** (bit 8): TLB entry not flushed on CR3 reload.
    pub global: bool,
    /// OS-available low (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// **PAT** selector for 1 GiB mappings (bit 12).
    pub pat_large: bool,
    /// Reserved (bits 13..29): must be 0.
    #[bits(17)]
    __res_13_29: u32,
    /// Physical address bits **51:30** (1 GiB-aligned base).
    #[bits(22)]
    phys_addr_51_30: u32,
    /// OS-available high (bits 52..58).
    #[bits(7)]
    pub os_available_high: u8,
    /// Protection Key / OS use (59..62).
    #[bits(4)]
    pub protection_key: u8,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

impl Pdpte {
    /// Set the Page Directory base (4 KiB-aligned).
    #[inline]
    #[must_use]
    pub const fn with_physical_page(mut self, phys: PhysicalPage<Size4K>) -> Self {
        self.set_phys_addr_51_12(phys.base().as_u64() >> 12);
        self
    }

    /// Get the Page Directory base (4 KiB-aligned).
    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.phys_addr_51_12() << 12))
    }
}

impl Pdpte1G {
    /// Set the 1 GiB page base.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_physical_page(mut self, phys: PhysicalPage<Size1G>) -> Self {
        self.set_phys_addr_51_30((phys.base().as_u64() >> 30) as u32);
        self.set_page_size(true);
        self
    }

    /// Get the 1 GiB page base.
    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size1G> {
        PhysicalPage::from_addr(PhysicalAddress::new((self.phys_addr_51_30() as u64) << 30))
    }
}

/// Decoded PDPTE kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PdptEntryKind {
    NextPageDirectory(PhysicalPage<Size4K>, EntryAttributes),
    Leaf1GiB(PhysicalPage<Size1G>, EntryAttributes),
}

/// A single Page Directory Pointer Table entry (PDPTE).
#[doc(alias = "PDPTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct PdptEntry(u64);

impl PdptEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

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

    /// Create a non-leaf PDPTE that points to a Page Directory (`PS=0`).
    #[inline]
    #[must_use]
    pub const fn present_next_with(attrs: EntryAttributes, page: PhysicalPage<Size4K>) -> Self {
        let e = Pdpte::from_bits(attrs.entry_bits())
            .with_present(true)
            .with_physical_page(page);
        Self(e.into_bits())
    }

    /// Create a 1 GiB leaf PDPTE (`PS=1`).
    #[inline]
    #[must_use]
    pub const fn present_leaf_with(attrs: EntryAttributes, page: PhysicalPage<Size1G>) -> Self {
        let e = Pdpte1G::from_bits(attrs.entry_bits())
            .with_present(true)
            .with_physical_page(page);
        Self(e.into_bits())
    }

    /// Decode the entry into its semantic kind, or `None` if not present.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdptEntryKind> {
        if !self.is_present() {
            return None;
        }

        let attrs = EntryAttributes::from_entry_bits(self.0);
        Some(if self.0 & PS_BIT != 0 {
            PdptEntryKind::Leaf1GiB(Pdpte1G::from_bits(self.0).physical_page(), attrs)
        } else {
            PdptEntryKind::NextPageDirectory(Pdpte::from_bits(self.0).physical_page(), attrs)
        })
    }
}

/// The Page Directory Pointer Table (L3): 512 entries, 4 KiB-aligned.
#[doc(alias = "PDPT")]
#[repr(C, align(4096))]
pub struct PageDirectoryPointerTable {
    entries: [PdptEntry; ENTRIES_PER_TABLE],
}

// SAFETY: 512 transparent `u64`s, 4 KiB aligned; every bit pattern is an entry.
unsafe impl TableStorage for PageDirectoryPointerTable {}

impl PageDirectoryPointerTable {
    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PdptEntry {
        self.entries[i]
    }

    #[inline]
    pub const fn set(&mut self, i: usize, e: PdptEntry) {
        self.entries[i] = e;
    }
}

impl Level for PageDirectoryPointerTable {
    const NAME: &'static str = "PDPT";
    const SHIFT: u32 = 30;

    fn tables_needed(
        pool: &FramePool<'_>,
        table: Option<TableSlot>,
        span: Span,
        phys: PhysicalAddress,
        attrs: EntryAttributes,
    ) -> Result<usize, PagingError> {
        count_huge::<Self>(pool, table, span, phys, attrs)
    }

    fn map_region(
        pool: &mut FramePool<'_>,
        table: TableSlot,
        span: Span,
        phys: PhysicalAddress,
        attrs: EntryAttributes,
    ) -> Result<(), PagingError> {
        map_huge::<Self>(pool, table, span, phys, attrs)
    }

    fn unmap_tables_needed(
        pool: &FramePool<'_>,
        table: Option<TableSlot>,
        span: Span,
    ) -> Result<usize, PagingError> {
        count_unmap_huge::<Self>(pool, table, span)
    }

    fn unmap_region(
        pool: &mut FramePool<'_>,
        table: TableSlot,
        span: Span,
    ) -> Result<(), PagingError> {
        unmap_huge::<Self>(pool, table, span)
    }

    fn lookup(
        pool: &FramePool<'_>,
        table: TableSlot,
        va: VirtualAddress,
    ) -> Result<Mapping, PagingError> {
        lookup_huge::<Self>(pool, table, va)
    }

    fn clear_all(pool: &mut FramePool<'_>, table: TableSlot) {
        clear_huge::<Self>(pool, table);
    }
}

impl LeafLevel for PageDirectoryPointerTable {
    type Page = Size1G;

    #[inline]
    fn set_leaf(&mut self, i: usize, page: PhysicalPage<Size1G>, attrs: EntryAttributes) {
        self.set(i, PdptEntry::present_leaf_with(attrs, page));
    }

    #[inline]
    fn set_absent(&mut self, i: usize) {
        self.set(i, PdptEntry::zero());
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
        is_uniform_huge::<Self>(pool, table, base, attrs)
    }
}

impl HugeLevel for PageDirectoryPointerTable {
    type Child = PageDirectory;

    #[inline]
    fn state(&self, i: usize) -> EntryState<Size1G> {
        match self.get(i).kind() {
            None => EntryState::Absent,
            Some(PdptEntryKind::Leaf1GiB(base, attributes)) => EntryState::Leaf { base, attributes },
            Some(PdptEntryKind::NextPageDirectory(page, attributes)) => {
                EntryState::Table { page, attributes }
            }
        }
    }

    #[inline]
    fn set_table(&mut self, i: usize, page: PhysicalPage<Size4K>) {
        self.set(i, PdptEntry::present_next_with(EntryAttributes::TABLE_POINTER, page));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageGranularity;
    use crate::pool::TablePage;

    const GIB: u64 = 1 << 30;
    const MIB2: u64 = 1 << 21;

    #[test]
    fn pdpt_table_vs_1g() {
        let pd = PhysicalAddress::new(0x5000).page();
        let e = PdptEntry::present_next_with(EntryAttributes::USER_RW, pd);
        assert_eq!(
            e.kind(),
            Some(PdptEntryKind::NextPageDirectory(pd, EntryAttributes::USER_RW))
        );

        let g = PhysicalAddress::new(3 * GIB + 0x1234).page::<Size1G>();
        let e = PdptEntry::present_leaf_with(EntryAttributes::KERNEL_RO, g);
        assert_eq!(e.into_bits(), 3 * GIB | PS_BIT | 1);
        assert_eq!(
            e.kind(),
            Some(PdptEntryKind::Leaf1GiB(g, EntryAttributes::KERNEL_RO))
        );
    }

    #[test]
    fn aligned_gigabyte_becomes_one_entry() {
        let mut storage = vec![TablePage::zeroed(); 4];
        let mut pool = FramePool::new(&mut storage, PhysicalAddress::new(0)).unwrap();
        let pdpt = pool.allocate().unwrap();

        let span = Span::new(VirtualAddress::new(GIB), 2 * GIB);
        let phys = PhysicalAddress::new(4 * GIB);
        assert_eq!(
            PageDirectoryPointerTable::tables_needed(
                &pool,
                Some(pdpt),
                span,
                phys,
                EntryAttributes::KERNEL_RW
            ),
            Ok(0)
        );
        PageDirectoryPointerTable::map_region(&mut pool, pdpt, span, phys, EntryAttributes::KERNEL_RW)
            .unwrap();
        assert_eq!(pool.used_slots(), 1);

        let va = VirtualAddress::new(2 * GIB + 0x12_3456);
        let m = PageDirectoryPointerTable::lookup(&pool, pdpt, va).unwrap();
        assert_eq!(m.granularity, PageGranularity::Size1G);
        assert_eq!(m.translate(va).as_u64(), 5 * GIB + 0x12_3456);
    }

    #[test]
    fn two_mib_aligned_gigabyte_uses_a_directory() {
        let mut storage = vec![TablePage::zeroed(); 4];
        let mut pool = FramePool::new(&mut storage, PhysicalAddress::new(0)).unwrap();
        let pdpt = pool.allocate().unwrap();

        let span = Span::new(VirtualAddress::new(0), GIB);
        let phys = PhysicalAddress::new(GIB + MIB2);
        PageDirectoryPointerTable::map_region(&mut pool, pdpt, span, phys, EntryAttributes::KERNEL_RW)
            .unwrap();
        assert_eq!(pool.used_slots(), 2);

        let m = PageDirectoryPointerTable::lookup(&pool, pdpt, VirtualAddress::new(MIB2)).unwrap();
        assert_eq!(m.granularity, PageGranularity::Size2M);
        assert_eq!(m.frame.as_u64(), GIB + 2 * MIB2);
    }

    #[test]
    fn directory_of_contiguous_big_pages_collapses() {
        let mut storage = vec![TablePage::zeroed(); 4];
        let mut pool = FramePool::new(&mut storage, PhysicalAddress::new(0)).unwrap();
        let pdpt = pool.allocate().unwrap();
        let attrs = EntryAttributes::USER_RW;

        // First half, then second half of a 1 GiB-aligned gigabyte.
        let first = Span::new(VirtualAddress::new(0), GIB / 2);
        PageDirectoryPointerTable::map_region(&mut pool, pdpt, first, PhysicalAddress::new(GIB), attrs)
            .unwrap();
        assert_eq!(pool.used_slots(), 2);

        let second = Span::new(VirtualAddress::new(GIB / 2), GIB / 2);
        let phys = PhysicalAddress::new(GIB + GIB / 2);
        PageDirectoryPointerTable::map_region(&mut pool, pdpt, second, phys, attrs).unwrap();
        assert_eq!(pool.used_slots(), 1);
        assert_eq!(
            pool.table::<PageDirectoryPointerTable>(pdpt).state(0),
            EntryState::Leaf {
                base: PhysicalAddress::new(GIB).page(),
                attributes: attrs
            }
        );
    }

    #[test]
    fn clear_all_releases_every_level() {
        let mut storage = vec![TablePage::zeroed(); 8];
        let mut pool = FramePool::new(&mut storage, PhysicalAddress::new(0)).unwrap();
        let pdpt = pool.allocate().unwrap();

        let span = Span::new(VirtualAddress::new(0x1000), 2 * GIB);
        PageDirectoryPointerTable::map_region(
            &mut pool,
            pdpt,
            span,
            PhysicalAddress::new(0x1000),
            EntryAttributes::KERNEL_RW,
        )
        .unwrap();
        assert!(pool.used_slots() > 1);

        PageDirectoryPointerTable::clear_all(&mut pool, pdpt);
        assert_eq!(pool.bitmap(), 0b1);
        assert!(pool.table::<PageDirectoryPointerTable>(pdpt).is_empty());

        // Idempotent.
        PageDirectoryPointerTable::clear_all(&mut pool, pdpt);
        assert_eq!(pool.bitmap(), 0b1);
    }
}
