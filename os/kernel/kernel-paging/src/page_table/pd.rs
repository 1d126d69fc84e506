//! # x86-64 Page Directory (PD / L2)
//!
//! This module models the second paging level (L2, Page Directory):
//!
//! - [`PdEntry`]: a PD entry that is either a pointer to a PT (`PS=0`) or a 2 MiB leaf (`PS=1`).
//! - [`PdEntryKind`]: decoded view of an entry (next PT vs 2 MiB leaf).
//! - [`PageDirectory`]: a 4 KiB-aligned array of 512 PD entries.
//!
//! ## Semantics
//!
//! At L2, the `PS` bit selects the role of an entry:
//! - `PS=0`: entry points to a next-level Page Table (PT), whose base is 4 KiB-aligned.
//! - `PS=1`: entry is a 2 MiB leaf mapping; base is 2 MiB-aligned.
//!
//! [`PdEntry::present_leaf_with`] takes a [`PhysicalPage<Size2M>`], so the
//! low 21 address bits of a leaf are always zero.

use crate::ENTRIES_PER_TABLE;
use crate::addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress};
use crate::attributes::EntryAttributes;
use crate::error::PagingError;
use crate::page_table::pt::PageTable;
use crate::page_table::{
    EntryState, HugeLevel, LeafLevel, Level, Mapping, PRESENT_BIT, PS_BIT, Span, clear_huge,
    count_huge, count_unmap_huge, is_uniform_huge, lookup_huge, map_huge, unmap_huge,
};
use crate::pool::{FramePool, TableSlot, TableStorage};
use bitfield_struct::bitfield;

/// L2 **PDE**: pointer to a **Page Table** (non-leaf; PS **= 0**).
#[bitfield(u64)]
pub struct Pde {
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
    /// Dirty (bit 6): **ignored** in non-leaf.
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
    /// **Next-level table physical address** (bits 12..51, 4 KiB-aligned).
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

impl Pde {
    /// Set the Page Table base (4 KiB-aligned).
    #[inline]
    #[must_use]
    pub const fn with_physical_page(mut self, phys: PhysicalPage<Size4K>) -> Self {
        self.set_phys_addr_51_12(phys.base().as_u64() >> 12);
        self
    }

    /// Get the Page Table base.
    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.phys_addr_51_12() << 12))
    }
}

/// L2 **PDE (2 MiB leaf)**: maps a single 2 MiB page (`PS = 1`).
///
/// - **PAT** selector lives at bit **12** in this form.
/// - Physical address uses bits **51:21**.
#[bitfield(u64)]
pub struct Pde2M {
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
    /// **Dirty** (bit 6): set by CPU on first write to this 2 MiB page.
    pub dirty: bool,
    /// **Page Size** (bit 7): **must be 1** for 2 MiB leaf.
    #[bits(default = true)]
    pub(crate) page_size: bool,
    /// **Global** (bit 8): TLB entry not flushed on CR3 reload.
    pub global: bool,
    /// OS-available low (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// **PAT** selector for 2 MiB mappings (bit 12).
    pub pat_large: bool,
    /// Reserved (bits 13..20): must be 0.
    #[bits(8)]
    __res13_20: u8,
    /// Physical address bits **51:21** (2 MiB-aligned base).
    #[bits(31)]
    phys_addr_51_21: u32,
    /// OS-available high (bits 52..58).
    #[bits(7)]
    pub os_available_high: u8,
    /// Protection Key / OS use (59..62).
    #[bits(4)]
    pub protection_key: u8,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

impl Pde2M {
    /// Set the 2 MiB page base.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_physical_page(mut self, phys: PhysicalPage<Size2M>) -> Self {
        self.set_phys_addr_51_21((phys.base().as_u64() >> 21) as u32);
        self.set_page_size(true);
        self
    }

    /// Get the 2 MiB page base.
    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size2M> {
        PhysicalPage::from_addr(PhysicalAddress::new((self.phys_addr_51_21() as u64) << 21))
    }
}

/// Decoded PDE kind.
///
/// - [`NextPageTable`](PdEntryKind::NextPageTable): non-leaf (`PS=0`), contains the 4 KiB-aligned PT base.
/// - [`Leaf2MiB`](PdEntryKind::Leaf2MiB): leaf (`PS=1`), contains the 2 MiB-aligned large-page base.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PdEntryKind {
    NextPageTable(PhysicalPage<Size4K>, EntryAttributes),
    Leaf2MiB(PhysicalPage<Size2M>, EntryAttributes),
}

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct PdEntry(u64);

impl PdEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Construct from raw `bits` (no validation).
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

    /// Create a non-leaf PDE that points to a Page Table (`PS=0`).
    #[inline]
    #[must_use]
    pub const fn present_next_with(attrs: EntryAttributes, page: PhysicalPage<Size4K>) -> Self {
        let pde = Pde::from_bits(attrs.entry_bits())
            .with_present(true)
            .with_physical_page(page);
        Self(pde.into_bits())
    }

    /// Create a 2 MiB leaf PDE (`PS=1`).
    #[inline]
    #[must_use]
    pub const fn present_leaf_with(attrs: EntryAttributes, page: PhysicalPage<Size2M>) -> Self {
        let pde = Pde2M::from_bits(attrs.entry_bits())
            .with_present(true)
            .with_physical_page(page);
        Self(pde.into_bits())
    }

    /// Decode the entry into its semantic kind, or `None` if not present.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdEntryKind> {
        if !self.is_present() {
            return None;
        }

        let attrs = EntryAttributes::from_entry_bits(self.0);
        Some(if self.0 & PS_BIT != 0 {
            PdEntryKind::Leaf2MiB(Pde2M::from_bits(self.0).physical_page(), attrs)
        } else {
            PdEntryKind::NextPageTable(Pde::from_bits(self.0).physical_page(), attrs)
        })
    }
}

/// The Page Directory (L2): 512 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES_PER_TABLE],
}

// SAFETY: 512 transparent `u64`s, 4 KiB aligned; every bit pattern is an entry.
unsafe impl TableStorage for PageDirectory {}

impl PageDirectory {
    /// Read the entry at `i`.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PdEntry {
        self.entries[i]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: usize, e: PdEntry) {
        self.entries[i] = e;
    }
}

impl Level for PageDirectory {
    const NAME: &'static str = "PD";
    const SHIFT: u32 = 21;

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

impl LeafLevel for PageDirectory {
    type Page = Size2M;

    #[inline]
    fn set_leaf(&mut self, i: usize, page: PhysicalPage<Size2M>, attrs: EntryAttributes) {
        self.set(i, PdEntry::present_leaf_with(attrs, page));
    }

    #[inline]
    fn set_absent(&mut self, i: usize) {
        self.set(i, PdEntry::zero());
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

impl HugeLevel for PageDirectory {
    type Child = PageTable;

    #[inline]
    fn state(&self, i: usize) -> EntryState<Size2M> {
        match self.get(i).kind() {
            None => EntryState::Absent,
            Some(PdEntryKind::Leaf2MiB(base, attributes)) => EntryState::Leaf { base, attributes },
            Some(PdEntryKind::NextPageTable(page, attributes)) => {
                EntryState::Table { page, attributes }
            }
        }
    }

    #[inline]
    fn set_table(&mut self, i: usize, page: PhysicalPage<Size4K>) {
        self.set(i, PdEntry::present_next_with(EntryAttributes::TABLE_POINTER, page));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TablePage;

    #[test]
    fn pd_table_vs_2m() {
        let pt = PhysicalAddress::new(0x3000_0000).page();
        let e_tbl = PdEntry::present_next_with(EntryAttributes::KERNEL_RW, pt);
        assert_eq!(e_tbl.into_bits() & PS_BIT, 0, "must be PS=0");
        assert_eq!(
            e_tbl.kind(),
            Some(PdEntryKind::NextPageTable(pt, EntryAttributes::KERNEL_RW))
        );

        let m2 = PhysicalAddress::new(0x4000_0000).page();
        let e_2m = PdEntry::present_leaf_with(EntryAttributes::USER_RO, m2);
        assert_ne!(e_2m.into_bits() & PS_BIT, 0, "must be PS=1");
        assert_eq!(
            e_2m.kind(),
            Some(PdEntryKind::Leaf2MiB(m2, EntryAttributes::USER_RO))
        );
        assert_eq!(PdEntry::zero().kind(), None);
    }

    #[test]
    fn leaf_address_is_masked_to_2m() {
        let page = PhysicalAddress::new(0x4012_3000).page::<Size2M>();
        let e = PdEntry::present_leaf_with(EntryAttributes::KERNEL_RW, page);
        assert_eq!(e.into_bits(), 0x4000_0000 | PS_BIT | 0b11);
    }

    fn pool_with_pd(storage: &mut [TablePage]) -> (FramePool<'_>, TableSlot) {
        let mut pool = FramePool::new(storage, PhysicalAddress::new(0x10_0000)).unwrap();
        let pd = pool.allocate().unwrap();
        (pool, pd)
    }

    #[test]
    fn partial_write_expands_big_page() {
        let mut storage = vec![TablePage::zeroed(); 4];
        let (mut pool, pd) = pool_with_pd(&mut storage);
        let attrs = EntryAttributes::KERNEL_RW;

        let full = Span::new(VirtualAddress::new(0), 0x20_0000);
        PageDirectory::map_region(&mut pool, pd, full, PhysicalAddress::new(0x20_0000), attrs)
            .unwrap();
        assert_eq!(pool.used_slots(), 1);

        // Remap one 4 KiB page elsewhere: the 2 MiB page has to be split.
        let one = Span::new(VirtualAddress::new(0x5000), 0x1000);
        assert_eq!(
            PageDirectory::tables_needed(&pool, Some(pd), one, PhysicalAddress::new(0x90_0000), attrs),
            Ok(1)
        );
        PageDirectory::map_region(&mut pool, pd, one, PhysicalAddress::new(0x90_0000), attrs)
            .unwrap();
        assert_eq!(pool.used_slots(), 2);

        let split = PageDirectory::lookup(&pool, pd, VirtualAddress::new(0x5000)).unwrap();
        assert_eq!(split.frame.as_u64(), 0x90_0000);
        let kept = PageDirectory::lookup(&pool, pd, VirtualAddress::new(0x6abc)).unwrap();
        assert_eq!(kept.translate(VirtualAddress::new(0x6abc)).as_u64(), 0x20_6abc);
        assert_eq!(kept.granularity, crate::PageGranularity::Size4K);
    }

    #[test]
    fn restoring_the_page_collapses_again() {
        let mut storage = vec![TablePage::zeroed(); 4];
        let (mut pool, pd) = pool_with_pd(&mut storage);
        let attrs = EntryAttributes::USER_RW;

        let full = Span::new(VirtualAddress::new(0), 0x20_0000);
        PageDirectory::map_region(&mut pool, pd, full, PhysicalAddress::new(0x20_0000), attrs)
            .unwrap();
        let one = Span::new(VirtualAddress::new(0x5000), 0x1000);
        PageDirectory::map_region(&mut pool, pd, one, PhysicalAddress::new(0x90_0000), attrs)
            .unwrap();
        assert_eq!(pool.used_slots(), 2);

        PageDirectory::map_region(&mut pool, pd, one, PhysicalAddress::new(0x20_5000), attrs)
            .unwrap();
        assert_eq!(pool.used_slots(), 1);
        assert_eq!(
            pool.table::<PageDirectory>(pd).state(0),
            EntryState::Leaf {
                base: PhysicalAddress::new(0x20_0000).page(),
                attributes: attrs
            }
        );
    }

    #[test]
    fn unaligned_physical_range_uses_page_tables() {
        let mut storage = vec![TablePage::zeroed(); 4];
        let (mut pool, pd) = pool_with_pd(&mut storage);

        let full = Span::new(VirtualAddress::new(0x20_0000), 0x20_0000);
        let phys = PhysicalAddress::new(0x30_1000);
        PageDirectory::map_region(&mut pool, pd, full, phys, EntryAttributes::KERNEL_RO).unwrap();
        assert!(matches!(
            pool.table::<PageDirectory>(pd).state(1),
            EntryState::Table { .. }
        ));

        let va = VirtualAddress::new(0x3F_FFFF);
        let m = PageDirectory::lookup(&pool, pd, va).unwrap();
        assert_eq!(m.translate(va).as_u64(), 0x50_0FFF);
    }

    #[test]
    fn partial_unmap_of_big_page_keeps_the_rest() {
        let mut storage = vec![TablePage::zeroed(); 4];
        let (mut pool, pd) = pool_with_pd(&mut storage);
        let attrs = EntryAttributes::KERNEL_RW;

        let full = Span::new(VirtualAddress::new(0), 0x20_0000);
        PageDirectory::map_region(&mut pool, pd, full, PhysicalAddress::new(0), attrs).unwrap();

        let hole = Span::new(VirtualAddress::new(0x1000), 0x1000);
        PageDirectory::unmap_region(&mut pool, pd, hole).unwrap();
        assert!(PageDirectory::lookup(&pool, pd, VirtualAddress::new(0x1000)).is_err());
        assert!(PageDirectory::lookup(&pool, pd, VirtualAddress::new(0x2000)).is_ok());

        PageDirectory::unmap_region(&mut pool, pd, full).unwrap();
        assert!(pool.table::<PageDirectory>(pd).is_empty());
        assert_eq!(pool.used_slots(), 1);
    }
}
