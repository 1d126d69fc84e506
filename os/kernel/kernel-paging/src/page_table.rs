//! # Memory Page Table
//!
//! The four typed paging levels and the recursive algorithms shared by them.
//!
//! | Level | Type | Index bits | Big page |
//! |-------|------|------------|----------|
//! | L4 | [`PageMapLevel4`](pml4::PageMapLevel4) | 47..39 | – |
//! | L3 | [`PageDirectoryPointerTable`](pdpt::PageDirectoryPointerTable) | 38..30 | 1 GiB |
//! | L2 | [`PageDirectory`](pd::PageDirectory) | 29..21 | 2 MiB |
//! | L1 | [`PageTable`](pt::PageTable) | 20..12 | 4 KiB (always leaf) |
//!
//! ## Entry states
//!
//! Entries of the big-page capable levels (PDPT, PD) are in one of three
//! states (see [`EntryState`]): absent, a big-page leaf, or a pointer to a
//! child table. The `PS` bit (bit 7) tells leaf and pointer apart.
//!
//! ```text
//!            full aligned write               partial write
//!   Absent ───────────────────▶ Leaf    Absent ─────────────▶ Table
//!   Table  ───────────────────▶ Leaf    Leaf   ──(expand)───▶ Table
//!   Leaf   ───────────────────▶ Leaf    Table  ──(collapse)─▶ Leaf, if uniform
//! ```
//!
//! Tables reference their children by physical address. Every walk resolves
//! that address through [`FramePool::slot_of`], so a pointer outside the pool
//! surfaces as [`PagingError::ForeignTable`] instead of being dereferenced.

pub mod pd;
pub mod pdpt;
pub mod pml4;
pub mod pt;

use crate::ENTRIES_PER_TABLE;
use crate::addresses::{
    PageGranularity, PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};
use crate::attributes::EntryAttributes;
use crate::bounds::EntryBounds;
use crate::error::PagingError;
use crate::pool::{FramePool, TableSlot, TableStorage};
use log::{debug, warn};

/// Hardware **Present** bit position shared across levels (bit 0).
const PRESENT_BIT: u64 = 1 << 0;

/// Hardware **Page Size** (PS) bit position shared across levels (bit 7).
///
/// - In non-leaf entries: PS **must be 0**.
/// - In large leaf entries (L3 1 GiB / L2 2 MiB): PS **must be 1**.
/// - In L1 4 KiB PTEs: bit 7 is **PAT** (not PS).
const PS_BIT: u64 = 1 << 7;

/// The translation found for one virtual address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Mapping {
    /// Base of the mapped frame, aligned to `granularity`.
    pub frame: PhysicalAddress,
    /// Size of the page the walk ended in.
    pub granularity: PageGranularity,
    /// Effective attributes: `writable` and `user` are the AND over all
    /// entries on the walk, caching bits are the leaf's.
    pub attributes: EntryAttributes,
}

impl Mapping {
    /// Physical address of `va` inside this mapping.
    #[inline]
    #[must_use]
    pub const fn translate(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(self.frame.as_u64() | va.offset_in(self.granularity.bytes()))
    }

    #[inline]
    pub(crate) const fn restricted_by(self, parent: EntryAttributes) -> Self {
        Self {
            attributes: self.attributes.restricted_by(parent),
            ..self
        }
    }
}

/// Decoded state of an entry at a big-page capable level.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryState<S: PageSize> {
    /// Not present; owns nothing.
    Absent,
    /// Big-page mapping of one frame of size `S`.
    Leaf {
        base: PhysicalPage<S>,
        attributes: EntryAttributes,
    },
    /// Pointer to a child table page.
    Table {
        page: PhysicalPage<Size4K>,
        attributes: EntryAttributes,
    },
}

impl<S: PageSize> EntryState<S> {
    /// `true` if this entry is a leaf that already maps `va` to `phys` with `attrs`.
    #[inline]
    fn covers(&self, va: VirtualAddress, phys: PhysicalAddress, attrs: EntryAttributes) -> bool {
        match *self {
            Self::Leaf { base, attributes } => {
                attributes == attrs && base.base().as_u64() + va.offset_in(S::SIZE) == phys.as_u64()
            }
            _ => false,
        }
    }
}

/// A contiguous virtual range being worked on by one level.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Span {
    pub start: VirtualAddress,
    pub len: u64,
}

impl Span {
    #[inline]
    pub const fn new(start: VirtualAddress, len: u64) -> Self {
        Self { start, len }
    }

    /// Entries of the table at `shift` touched by this span.
    #[inline]
    pub const fn bounds(self, shift: u32) -> EntryBounds {
        EntryBounds::new(self.start, self.len, shift)
    }

    /// The leading part of the span that falls into the entry containing
    /// `start`, and whether it covers that entry only partially.
    #[inline]
    pub const fn head(self, shift: u32) -> (Self, bool) {
        let size = 1u64 << shift;
        let offset = self.start.offset_in(size);
        let room = size - offset;
        let len = if self.len < room { self.len } else { room };
        (Self::new(self.start, len), offset != 0 || len < size)
    }

    /// Drop the first `n` bytes.
    #[inline]
    pub const fn skip(self, n: u64) -> Self {
        Self::new(self.start.wrapping_add(n), self.len - n)
    }
}

/// One paging level: a 4 KiB table of 512 entries in the pool.
///
/// All operations take the table by [`TableSlot`] and the pool explicitly,
/// so a level can allocate children while it is being walked.
pub(crate) trait Level: TableStorage {
    /// Short name used in log messages.
    const NAME: &'static str;

    /// Position of this level's 9 index bits in a virtual address.
    const SHIFT: u32;

    /// Upper bound of table pages [`Level::map_region`] would allocate.
    ///
    /// `None` stands for a table that does not exist yet (fresh, or about to
    /// be expanded from a big page). Walks the tree read-only and resolves
    /// every child pointer the mutation would follow.
    fn tables_needed(
        pool: &FramePool<'_>,
        table: Option<TableSlot>,
        span: Span,
        phys: PhysicalAddress,
        attrs: EntryAttributes,
    ) -> Result<usize, PagingError>;

    /// Map `span` to the physical range starting at `phys`.
    ///
    /// The span never extends beyond this table.
    fn map_region(
        pool: &mut FramePool<'_>,
        table: TableSlot,
        span: Span,
        phys: PhysicalAddress,
        attrs: EntryAttributes,
    ) -> Result<(), PagingError>;

    /// Upper bound of table pages [`Level::unmap_region`] would allocate to
    /// expand big pages. `None` stands for a table expanded from a big page.
    fn unmap_tables_needed(
        pool: &FramePool<'_>,
        table: Option<TableSlot>,
        span: Span,
    ) -> Result<usize, PagingError>;

    /// Remove all mappings in `span`, releasing child tables that end up empty.
    fn unmap_region(pool: &mut FramePool<'_>, table: TableSlot, span: Span)
    -> Result<(), PagingError>;

    /// Walk down from this table to the leaf mapping `va`.
    fn lookup(
        pool: &FramePool<'_>,
        table: TableSlot,
        va: VirtualAddress,
    ) -> Result<Mapping, PagingError>;

    /// Clear every entry, releasing all descendant table pages.
    fn clear_all(pool: &mut FramePool<'_>, table: TableSlot);
}

/// A level whose entries can map frames directly (PT, PD, PDPT).
pub(crate) trait LeafLevel: Level {
    /// Size of the frame mapped by one leaf entry.
    type Page: PageSize;

    fn set_leaf(&mut self, i: usize, page: PhysicalPage<Self::Page>, attrs: EntryAttributes);

    fn set_absent(&mut self, i: usize);

    fn is_present(&self, i: usize) -> bool;

    /// `true` if the table encodes exactly one contiguous mapping of
    /// `512 * Page::SIZE` bytes starting at `base` with `attrs`, i.e. it can
    /// be replaced by a single big page in the parent.
    fn is_uniform(
        pool: &FramePool<'_>,
        table: TableSlot,
        base: PhysicalAddress,
        attrs: EntryAttributes,
    ) -> bool;

    /// Replicate one parent big page starting at `base` over all entries.
    fn fill(&mut self, base: PhysicalAddress, attrs: EntryAttributes) {
        for i in 0..ENTRIES_PER_TABLE {
            self.set_leaf(i, (base + i as u64 * Self::Page::SIZE).page(), attrs);
        }
    }

    fn is_empty(&self) -> bool {
        (0..ENTRIES_PER_TABLE).all(|i| !self.is_present(i))
    }
}

/// A level whose entries are either big pages or child pointers (PD, PDPT).
pub(crate) trait HugeLevel: LeafLevel {
    type Child: LeafLevel;

    fn state(&self, i: usize) -> EntryState<Self::Page>;

    /// Install a pointer to the child table at `page`.
    fn set_table(&mut self, i: usize, page: PhysicalPage<Size4K>);
}

/// Release a child table and everything below it back to the pool.
pub(crate) fn release<C: Level>(pool: &mut FramePool<'_>, child: TableSlot) {
    C::clear_all(pool, child);
    pool.deallocate(child);
}

/// Return the child table of entry `i`, allocating or expanding it if needed.
fn ensure_child<L: HugeLevel>(
    pool: &mut FramePool<'_>,
    table: TableSlot,
    i: usize,
    state: EntryState<L::Page>,
) -> Result<TableSlot, PagingError> {
    let slot = match state {
        EntryState::Table { page, .. } => return pool.slot_of(page),
        EntryState::Absent => pool.allocate().ok_or(PagingError::PoolExhausted)?,
        EntryState::Leaf { base, attributes } => {
            let slot = pool.allocate().ok_or(PagingError::PoolExhausted)?;
            pool.table_mut::<L::Child>(slot).fill(base.base(), attributes);
            debug!(
                "{}[{i}]: expanded {} page at {} into a child table",
                L::NAME,
                L::Page::GRANULARITY,
                base.base()
            );
            slot
        }
    };

    let page = pool.physical_page(slot);
    pool.table_mut::<L>(table).set_table(i, page);
    Ok(slot)
}

/// Replace the child of entry `i` by a single big page if the child encodes
/// exactly the big page implied by mapping `va` to `phys`.
fn collapse_if_uniform<L: HugeLevel>(
    pool: &mut FramePool<'_>,
    table: TableSlot,
    i: usize,
    child: TableSlot,
    va: VirtualAddress,
    phys: PhysicalAddress,
    attrs: EntryAttributes,
) {
    let Some(base) = phys.checked_sub(va.offset_in(L::Page::SIZE)) else {
        return;
    };
    if !base.is_aligned(L::Page::SIZE) || !L::Child::is_uniform(pool, child, base, attrs) {
        return;
    }

    pool.table_mut::<L>(table).set_leaf(i, base.page(), attrs);
    release::<L::Child>(pool, child);
    debug!(
        "{}[{i}]: collapsed child table into a {} page at {base}",
        L::NAME,
        L::Page::GRANULARITY
    );
}

pub(crate) fn count_huge<L: HugeLevel>(
    pool: &FramePool<'_>,
    table: Option<TableSlot>,
    span: Span,
    mut phys: PhysicalAddress,
    attrs: EntryAttributes,
) -> Result<usize, PagingError> {
    let mut needed = 0;
    let mut rest = span;
    for i in span.bounds(L::SHIFT).indices() {
        let (chunk, partial) = rest.head(L::SHIFT);
        let state = table.map(|t| pool.table::<L>(t).state(i));

        if !partial && phys.is_aligned(L::Page::SIZE) {
            if let Some(EntryState::Table { page, .. }) = state {
                pool.slot_of(page)?;
            }
        } else {
            needed += match state {
                Some(EntryState::Table { page, .. }) => {
                    L::Child::tables_needed(pool, Some(pool.slot_of(page)?), chunk, phys, attrs)?
                }
                Some(s) if s.covers(chunk.start, phys, attrs) => 0,
                _ => 1 + L::Child::tables_needed(pool, None, chunk, phys, attrs)?,
            };
        }

        rest = rest.skip(chunk.len);
        phys += chunk.len;
    }
    Ok(needed)
}

pub(crate) fn map_huge<L: HugeLevel>(
    pool: &mut FramePool<'_>,
    table: TableSlot,
    span: Span,
    mut phys: PhysicalAddress,
    attrs: EntryAttributes,
) -> Result<(), PagingError> {
    let mut rest = span;
    for i in span.bounds(L::SHIFT).indices() {
        let (chunk, partial) = rest.head(L::SHIFT);
        let state = pool.table::<L>(table).state(i);

        if !partial && phys.is_aligned(L::Page::SIZE) {
            let replaced = match state {
                EntryState::Table { page, .. } => Some(pool.slot_of(page)?),
                _ => None,
            };
            pool.table_mut::<L>(table).set_leaf(i, phys.page(), attrs);
            if let Some(child) = replaced {
                release::<L::Child>(pool, child);
                debug!(
                    "{}[{i}]: replaced child table by a {} page",
                    L::NAME,
                    L::Page::GRANULARITY
                );
            }
        } else if !state.covers(chunk.start, phys, attrs) {
            let child = ensure_child::<L>(pool, table, i, state)?;
            L::Child::map_region(pool, child, chunk, phys, attrs)?;
            collapse_if_uniform::<L>(pool, table, i, child, chunk.start, phys, attrs);
        }

        rest = rest.skip(chunk.len);
        phys += chunk.len;
    }
    Ok(())
}

pub(crate) fn count_unmap_huge<L: HugeLevel>(
    pool: &FramePool<'_>,
    table: Option<TableSlot>,
    span: Span,
) -> Result<usize, PagingError> {
    let mut needed = 0;
    let mut rest = span;
    for i in span.bounds(L::SHIFT).indices() {
        let (chunk, partial) = rest.head(L::SHIFT);
        needed += match table.map(|t| pool.table::<L>(t).state(i)) {
            Some(EntryState::Absent) => 0,
            Some(EntryState::Table { page, .. }) => {
                let child = pool.slot_of(page)?;
                if partial {
                    L::Child::unmap_tables_needed(pool, Some(child), chunk)?
                } else {
                    0
                }
            }
            Some(EntryState::Leaf { .. }) | None if partial => {
                1 + L::Child::unmap_tables_needed(pool, None, chunk)?
            }
            Some(EntryState::Leaf { .. }) | None => 0,
        };
        rest = rest.skip(chunk.len);
    }
    Ok(needed)
}

pub(crate) fn unmap_huge<L: HugeLevel>(
    pool: &mut FramePool<'_>,
    table: TableSlot,
    span: Span,
) -> Result<(), PagingError> {
    let mut rest = span;
    for i in span.bounds(L::SHIFT).indices() {
        let (chunk, partial) = rest.head(L::SHIFT);

        match pool.table::<L>(table).state(i) {
            EntryState::Absent => {}
            EntryState::Leaf { .. } if !partial => pool.table_mut::<L>(table).set_absent(i),
            EntryState::Table { page, .. } if !partial => {
                let child = pool.slot_of(page)?;
                pool.table_mut::<L>(table).set_absent(i);
                release::<L::Child>(pool, child);
            }
            state => {
                let child = ensure_child::<L>(pool, table, i, state)?;
                L::Child::unmap_region(pool, child, chunk)?;
                if pool.table::<L::Child>(child).is_empty() {
                    pool.table_mut::<L>(table).set_absent(i);
                    pool.deallocate(child);
                    debug!("{}[{i}]: released empty child table", L::NAME);
                }
            }
        }

        rest = rest.skip(chunk.len);
    }
    Ok(())
}

pub(crate) fn lookup_huge<L: HugeLevel>(
    pool: &FramePool<'_>,
    table: TableSlot,
    va: VirtualAddress,
) -> Result<Mapping, PagingError> {
    match pool.table::<L>(table).state(va.table_index(L::SHIFT)) {
        EntryState::Absent => Err(PagingError::Unmapped(va)),
        EntryState::Leaf { base, attributes } => Ok(Mapping {
            frame: base.base(),
            granularity: L::Page::GRANULARITY,
            attributes,
        }),
        EntryState::Table { page, attributes } => {
            let child = pool.slot_of(page)?;
            Ok(L::Child::lookup(pool, child, va)?.restricted_by(attributes))
        }
    }
}

pub(crate) fn is_uniform_huge<L: HugeLevel>(
    pool: &FramePool<'_>,
    table: TableSlot,
    base: PhysicalAddress,
    attrs: EntryAttributes,
) -> bool {
    let entries = pool.table::<L>(table);
    (0..ENTRIES_PER_TABLE).all(|i| {
        let expected = base + i as u64 * L::Page::SIZE;
        match entries.state(i) {
            EntryState::Absent => false,
            EntryState::Leaf { base: frame, attributes } => {
                frame.base() == expected && attributes == attrs
            }
            EntryState::Table { page, attributes } => {
                attrs.restricted_by(attributes) == attrs
                    && pool
                        .slot_of(page)
                        .is_ok_and(|child| L::Child::is_uniform(pool, child, expected, attrs))
            }
        }
    })
}

pub(crate) fn clear_huge<L: HugeLevel>(pool: &mut FramePool<'_>, table: TableSlot) {
    for i in 0..ENTRIES_PER_TABLE {
        match pool.table::<L>(table).state(i) {
            EntryState::Absent => continue,
            EntryState::Leaf { .. } => {}
            EntryState::Table { page, .. } => match pool.slot_of(page) {
                Ok(child) => release::<L::Child>(pool, child),
                Err(_) => warn!(
                    "{}[{i}]: child table at {page} is not part of the pool, dropping reference",
                    L::NAME
                ),
            },
        }
        pool.table_mut::<L>(table).set_absent(i);
    }
}
