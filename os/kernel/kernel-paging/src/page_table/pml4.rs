//! # x86-64 Page Map Level 4 (PML4 / L4)
//!
//! - [`Pml4Entry`]: a PML4 entry; when present it always points to a PDPT.
//! - [`PageMapLevel4`]: the root table, 512 entries, 4 KiB-aligned.
//!
//! Index bits are `[47:39]` of a canonical virtual address. Entries 0..=255
//! cover the lower (user) half, 256..=511 the higher (kernel) half.
//! There is no big-page form at this level; `PS` must be 0.

use crate::ENTRIES_PER_TABLE;
use crate::addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use crate::attributes::EntryAttributes;
use crate::error::PagingError;
use crate::page_table::pdpt::PageDirectoryPointerTable;
use crate::page_table::{LeafLevel, Level, Mapping, PRESENT_BIT, Span, release};
use crate::pool::{FramePool, TableSlot, TableStorage};
use bitfield_struct::bitfield;
use log::{debug, warn};

/// **PML4E**: pointer to a **Page Directory Pointer Table**.
#[bitfield(u64)]
pub struct Pml4e {
    /// **Present** (bit 0): valid entry if set.
    pub present: bool,
    /// **Writable** (bit 1): allows writes in the covered 512 GiB region.
    pub writable: bool,
    /// **User/Supervisor** (bit 2): if set, user mode may access the region.
    pub user: bool,
    /// **Write-Through** (bit 3).
    pub write_through: bool,
    /// **Cache Disable** (bit 4).
    pub cache_disable: bool,
    /// **Accessed** (bit 5): set by the CPU on first access.
    pub accessed: bool,
    /// Dirty (bit 6): **ignored** at this level.
    #[bits(1)]
    __d_ignored: u8,
    /// Page Size (bit 7): **must be 0**.
    #[bits(1)]
    __ps_must_be_0: u8,
    /// Global (bit 8): **ignored** at this level.
    #[bits(1)]
    __g_ignored: u8,
    /// **OS-available low** (bits 9..11): not interpreted by hardware.
    #[bits(3)]
    pub os_available_low: u8,
    /// **Next-level table physical address** (bits 12..51).
    #[bits(40)]
    phys_addr_51_12: u64,
    /// **OS-available high** (bits 52..58): not interpreted by hardware.
    #[bits(7)]
    pub os_available_high: u8,
    /// **Protection Key / OS use** (bits 59..62).
    #[bits(4)]
    pub protection_key: u8,
    /// **No-Execute** (bit 63).
    pub no_execute: bool,
}

impl Pml4e {
    /// Set the PDPT base (4 KiB-aligned).
    #[inline]
    #[must_use]
    pub const fn with_physical_page(mut self, phys: PhysicalPage<Size4K>) -> Self {
        self.set_phys_addr_51_12(phys.base().as_u64() >> 12);
        self
    }

    /// Get the PDPT base.
    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.phys_addr_51_12() << 12))
    }
}

/// A single PML4 entry.
#[doc(alias = "PML4E")]
#[repr(transparent)]
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct Pml4Entry(u64);

impl Pml4Entry {
    /// Create a zero (non-present) entry with all bits cleared.
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

    /// Create a present entry pointing at the PDPT in `page`.
    #[inline]
    #[must_use]
    pub const fn present_with(attrs: EntryAttributes, page: PhysicalPage<Size4K>) -> Self {
        let e = Pml4e::from_bits(attrs.entry_bits())
            .with_present(true)
            .with_physical_page(page);
        Self(e.into_bits())
    }

    /// If present, return the PDPT base and the entry's attributes.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<(PhysicalPage<Size4K>, EntryAttributes)> {
        if !self.is_present() {
            return None;
        }
        Some((
            Pml4e::from_bits(self.0).physical_page(),
            EntryAttributes::from_entry_bits(self.0),
        ))
    }
}

/// The root page-table (PML4).
#[doc(alias = "PML4")]
#[repr(C, align(4096))]
pub struct PageMapLevel4 {
    entries: [Pml4Entry; ENTRIES_PER_TABLE],
}

// SAFETY: 512 transparent `u64`s, 4 KiB aligned; every bit pattern is an entry.
unsafe impl TableStorage for PageMapLevel4 {}

impl PageMapLevel4 {
    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> Pml4Entry {
        self.entries[i]
    }

    #[inline]
    pub const fn set(&mut self, i: usize, e: Pml4Entry) {
        self.entries[i] = e;
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }

    /// Resolve the PDPT behind entry `i`, allocating it if the entry is absent.
    fn ensure_child(
        pool: &mut FramePool<'_>,
        table: TableSlot,
        i: usize,
    ) -> Result<TableSlot, PagingError> {
        if let Some((page, _)) = pool.table::<Self>(table).get(i).next_table() {
            return pool.slot_of(page);
        }

        let slot = pool.allocate().ok_or(PagingError::PoolExhausted)?;
        let page = pool.physical_page(slot);
        pool.table_mut::<Self>(table)
            .set(i, Pml4Entry::present_with(EntryAttributes::TABLE_POINTER, page));
        Ok(slot)
    }
}

impl Level for PageMapLevel4 {
    const NAME: &'static str = "PML4";
    const SHIFT: u32 = 39;

    fn tables_needed(
        pool: &FramePool<'_>,
        table: Option<TableSlot>,
        span: Span,
        mut phys: PhysicalAddress,
        attrs: EntryAttributes,
    ) -> Result<usize, PagingError> {
        let mut needed = 0;
        let mut rest = span;
        for i in span.bounds(Self::SHIFT).indices() {
            let (chunk, _) = rest.head(Self::SHIFT);
            let next = table.and_then(|t| pool.table::<Self>(t).get(i).next_table());
            needed += match next {
                Some((page, _)) => PageDirectoryPointerTable::tables_needed(
                    pool,
                    Some(pool.slot_of(page)?),
                    chunk,
                    phys,
                    attrs,
                )?,
                None => 1 + PageDirectoryPointerTable::tables_needed(pool, None, chunk, phys, attrs)?,
            };
            rest = rest.skip(chunk.len);
            phys += chunk.len;
        }
        Ok(needed)
    }

    fn map_region(
        pool: &mut FramePool<'_>,
        table: TableSlot,
        span: Span,
        mut phys: PhysicalAddress,
        attrs: EntryAttributes,
    ) -> Result<(), PagingError> {
        let mut rest = span;
        for i in span.bounds(Self::SHIFT).indices() {
            let (chunk, _) = rest.head(Self::SHIFT);
            let child = Self::ensure_child(pool, table, i)?;
            PageDirectoryPointerTable::map_region(pool, child, chunk, phys, attrs)?;
            rest = rest.skip(chunk.len);
            phys += chunk.len;
        }
        Ok(())
    }

    fn unmap_tables_needed(
        pool: &FramePool<'_>,
        table: Option<TableSlot>,
        span: Span,
    ) -> Result<usize, PagingError> {
        let Some(table) = table else {
            return Ok(0);
        };

        let mut needed = 0;
        let mut rest = span;
        for i in span.bounds(Self::SHIFT).indices() {
            let (chunk, partial) = rest.head(Self::SHIFT);
            if let Some((page, _)) = pool.table::<Self>(table).get(i).next_table() {
                let child = pool.slot_of(page)?;
                if partial {
                    needed += PageDirectoryPointerTable::unmap_tables_needed(pool, Some(child), chunk)?;
                }
            }
            rest = rest.skip(chunk.len);
        }
        Ok(needed)
    }

    fn unmap_region(
        pool: &mut FramePool<'_>,
        table: TableSlot,
        span: Span,
    ) -> Result<(), PagingError> {
        let mut rest = span;
        for i in span.bounds(Self::SHIFT).indices() {
            let (chunk, partial) = rest.head(Self::SHIFT);
            if let Some((page, _)) = pool.table::<Self>(table).get(i).next_table() {
                let child = pool.slot_of(page)?;
                if partial {
                    PageDirectoryPointerTable::unmap_region(pool, child, chunk)?;
                }
                if !partial || pool.table::<PageDirectoryPointerTable>(child).is_empty() {
                    pool.table_mut::<Self>(table).set(i, Pml4Entry::zero());
                    release::<PageDirectoryPointerTable>(pool, child);
                    debug!("{}[{i}]: released child table", Self::NAME);
                }
            }
            rest = rest.skip(chunk.len);
        }
        Ok(())
    }

    fn lookup(
        pool: &FramePool<'_>,
        table: TableSlot,
        va: VirtualAddress,
    ) -> Result<Mapping, PagingError> {
        let entry = pool.table::<Self>(table).get(va.table_index(Self::SHIFT));
        let (page, attributes) = entry.next_table().ok_or(PagingError::Unmapped(va))?;
        let child = pool.slot_of(page)?;
        Ok(PageDirectoryPointerTable::lookup(pool, child, va)?.restricted_by(attributes))
    }

    fn clear_all(pool: &mut FramePool<'_>, table: TableSlot) {
        for i in 0..ENTRIES_PER_TABLE {
            let Some((page, _)) = pool.table::<Self>(table).get(i).next_table() else {
                continue;
            };
            match pool.slot_of(page) {
                Ok(child) => release::<PageDirectoryPointerTable>(pool, child),
                Err(_) => warn!(
                    "{}[{i}]: child table at {page} is not part of the pool, dropping reference",
                    Self::NAME
                ),
            }
            pool.table_mut::<Self>(table).set(i, Pml4Entry::zero());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TablePage;

    #[test]
    fn entry_round_trip() {
        let page = PhysicalAddress::new(0x0000_000F_FFFF_F000).page();
        let e = Pml4Entry::present_with(EntryAttributes::TABLE_POINTER, page);
        assert_eq!(e.into_bits(), 0x0000_000F_FFFF_F007);
        assert_eq!(e.next_table(), Some((page, EntryAttributes::USER_RW)));
        assert_eq!(Pml4Entry::zero().next_table(), None);
    }

    #[test]
    fn higher_half_uses_upper_entries() {
        let mut storage = vec![TablePage::zeroed(); 8];
        let mut pool = FramePool::new(&mut storage, PhysicalAddress::new(0x80_0000)).unwrap();
        let root = pool.allocate().unwrap();

        let span = Span::new(VirtualAddress::new(0xFFFF_8000_0000_0000), 0x1000);
        PageMapLevel4::map_region(
            &mut pool,
            root,
            span,
            PhysicalAddress::new(0x1000),
            EntryAttributes::KERNEL_RW,
        )
        .unwrap();

        let pml4 = pool.table::<PageMapLevel4>(root);
        assert_eq!(pml4.present_entries(), 1);
        assert!(pml4.get(256).is_present());
        assert_eq!(pool.used_slots(), 4);
    }

    #[test]
    fn walk_restricts_permissions() {
        let mut storage = vec![TablePage::zeroed(); 8];
        let mut pool = FramePool::new(&mut storage, PhysicalAddress::new(0)).unwrap();
        let root = pool.allocate().unwrap();

        let va = VirtualAddress::new(0x40_0000);
        let span = Span::new(va, 0x1000);
        PageMapLevel4::map_region(&mut pool, root, span, PhysicalAddress::new(0), EntryAttributes::USER_RW)
            .unwrap();
        assert_eq!(
            PageMapLevel4::lookup(&pool, root, va).unwrap().attributes,
            EntryAttributes::USER_RW
        );

        // Demote the root entry to supervisor-only, read-only.
        let pml4 = pool.table_mut::<PageMapLevel4>(root);
        let (page, _) = pml4.get(0).next_table().unwrap();
        pml4.set(0, Pml4Entry::present_with(EntryAttributes::KERNEL_RO, page));

        let m = PageMapLevel4::lookup(&pool, root, va).unwrap();
        assert!(!m.attributes.user());
        assert!(!m.attributes.writable());
    }

    #[test]
    fn unmapping_everything_releases_intermediate_tables() {
        let mut storage = vec![TablePage::zeroed(); 8];
        let mut pool = FramePool::new(&mut storage, PhysicalAddress::new(0)).unwrap();
        let root = pool.allocate().unwrap();

        let span = Span::new(VirtualAddress::new(0x7000), 0x3000);
        PageMapLevel4::map_region(&mut pool, root, span, PhysicalAddress::new(0x7000), EntryAttributes::USER_RO)
            .unwrap();
        assert_eq!(pool.used_slots(), 4);

        assert_eq!(PageMapLevel4::unmap_tables_needed(&pool, Some(root), span), Ok(0));
        PageMapLevel4::unmap_region(&mut pool, root, span).unwrap();
        assert_eq!(pool.bitmap(), 0b1);
        assert_eq!(pool.table::<PageMapLevel4>(root).present_entries(), 0);
    }
}
