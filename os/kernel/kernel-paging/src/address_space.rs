//! # Address Space (x86-64, PML4-rooted)
//!
//! Builds and manipulates a **single** virtual address space: a tree rooted
//! at a PML4 whose table pages all come from one [`FramePool`].
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_region`] maps any 4 KiB-aligned range, choosing 1 GiB
//!   and 2 MiB pages wherever virtual and physical alignment allow, splitting
//!   big pages on partial overlap and merging child tables back into big
//!   pages once they are uniform again.
//! - [`AddressSpace::translate`] resolves a virtual address, optionally
//!   checking that user mode may access it.
//! - [`AddressSpace::clear_all`] releases every table below the root.
//! - [`AddressSpace::set_as_current`] loads the root into the paging hardware.
//!
//! ## Failure atomicity
//!
//! Before touching any table, [`AddressSpace::map_region`] and
//! [`AddressSpace::unmap_region`] walk the tree read-only and compute an upper
//! bound of the table pages they will allocate. If the pool cannot supply
//! them the call fails with [`PagingError::PoolExhausted`] and neither the
//! tables nor the allocation bitmap change.
//!
//! ## TLB
//!
//! Mutations return a [`TlbFlush`]. Flushing it against the hardware reloads
//! the root if this space is the active one.

use crate::addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, align_up};
use crate::attributes::EntryAttributes;
use crate::error::PagingError;
use crate::page_table::pml4::PageMapLevel4;
use crate::page_table::{Level, Mapping, Span};
use crate::platform::{PagingHardware, TlbFlush};
use crate::pool::FramePool;
use log::{debug, warn};

/// Privilege level of a memory access being translated.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Access {
    /// Kernel-mode access (CPL0); the user bit is not checked.
    Supervisor,
    /// User-mode access (CPL3); every entry on the walk must allow user access.
    User,
}

/// Handle to a single, concrete address space.
///
/// The handle only remembers the physical page of its PML4; the tables
/// themselves live in the [`FramePool`] passed to every call.
#[derive(Debug, Eq, PartialEq)]
pub struct AddressSpace {
    root: PhysicalPage<Size4K>,
}

impl AddressSpace {
    /// Allocate and zero a new PML4.
    ///
    /// # Errors
    /// [`PagingError::PoolExhausted`] if the pool has no free slot.
    pub fn create(pool: &mut FramePool<'_>) -> Result<Self, PagingError> {
        let slot = pool.allocate().ok_or_else(|| {
            warn!("cannot create address space: page-table pool exhausted");
            PagingError::PoolExhausted
        })?;
        let root = pool.physical_page(slot);
        debug!("created address space with root {root}");
        Ok(Self { root })
    }

    /// Adopt an existing PML4 that lives in `pool`.
    ///
    /// # Errors
    /// [`PagingError::ForeignTable`] if `root` is not an allocated page of `pool`.
    pub fn from_root(pool: &FramePool<'_>, root: PhysicalPage<Size4K>) -> Result<Self, PagingError> {
        pool.slot_of(root)?;
        Ok(Self { root })
    }

    /// The address space currently loaded into `hw`.
    ///
    /// # Errors
    /// [`PagingError::ForeignTable`] if the active root is not part of `pool`.
    pub fn current<H: PagingHardware + ?Sized>(
        pool: &FramePool<'_>,
        hw: &H,
    ) -> Result<Self, PagingError> {
        Self::from_root(pool, hw.active_root())
    }

    /// Physical page of the PML4.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Map `[virt, virt + len)` to `[phys, phys + len)` with `attrs`.
    ///
    /// `len` is rounded up to whole 4 KiB pages; a zero length maps nothing.
    /// Existing mappings in the range are replaced; mappings outside it are
    /// left untouched.
    ///
    /// # Errors
    /// - [`PagingError::Misaligned`] if `virt` or `phys` is not 4 KiB aligned.
    /// - [`PagingError::NonCanonical`] if the range is not canonical or wraps.
    /// - [`PagingError::PhysicalOutOfRange`] if the physical range exceeds 52 bits.
    /// - [`PagingError::PoolExhausted`] if the pool cannot supply the needed
    ///   tables; nothing is modified in that case.
    /// - [`PagingError::ForeignTable`] if the tree references a table outside `pool`.
    pub fn map_region(
        &self,
        pool: &mut FramePool<'_>,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        len: u64,
        attrs: EntryAttributes,
    ) -> Result<TlbFlush, PagingError> {
        let root = pool.slot_of(self.root)?;
        if len == 0 {
            return Ok(TlbFlush::new(self.root));
        }

        let len = validate_virtual(virt, len)?;
        if !phys.is_aligned(Size4K::SIZE) {
            return Err(PagingError::Misaligned(phys.as_u64()));
        }
        match phys.as_u64().checked_add(len - 1) {
            Some(last) if last < PhysicalAddress::LIMIT => {}
            _ => return Err(PagingError::PhysicalOutOfRange(phys)),
        }

        let span = Span::new(virt, len);
        let needed = PageMapLevel4::tables_needed(pool, Some(root), span, phys, attrs)?;
        self.reserve(pool, needed)?;

        PageMapLevel4::map_region(pool, root, span, phys, attrs)?;
        debug!(
            "mapped {virt}+{len:#x} -> {phys} ({attrs:?}), {} table pages in use",
            pool.used_slots()
        );
        Ok(TlbFlush::new(self.root))
    }

    /// Remove every mapping in `[virt, virt + len)`.
    ///
    /// Big pages that are only partly covered are split first; tables that
    /// end up empty are released. Unmapped parts of the range are skipped.
    ///
    /// # Errors
    /// - [`PagingError::Misaligned`] / [`PagingError::NonCanonical`] as for
    ///   [`map_region`](Self::map_region).
    /// - [`PagingError::PoolExhausted`] if splitting big pages needs more
    ///   tables than available; nothing is modified in that case.
    pub fn unmap_region(
        &self,
        pool: &mut FramePool<'_>,
        virt: VirtualAddress,
        len: u64,
    ) -> Result<TlbFlush, PagingError> {
        let root = pool.slot_of(self.root)?;
        if len == 0 {
            return Ok(TlbFlush::new(self.root));
        }

        let len = validate_virtual(virt, len)?;
        let span = Span::new(virt, len);
        let needed = PageMapLevel4::unmap_tables_needed(pool, Some(root), span)?;
        self.reserve(pool, needed)?;

        PageMapLevel4::unmap_region(pool, root, span)?;
        debug!(
            "unmapped {virt}+{len:#x}, {} table pages in use",
            pool.used_slots()
        );
        Ok(TlbFlush::new(self.root))
    }

    /// The leaf mapping covering `virt`.
    ///
    /// # Errors
    /// - [`PagingError::NonCanonical`] for non-canonical addresses.
    /// - [`PagingError::Unmapped`] if the walk reaches a non-present entry.
    pub fn lookup(&self, pool: &FramePool<'_>, virt: VirtualAddress) -> Result<Mapping, PagingError> {
        if !virt.is_canonical() {
            return Err(PagingError::NonCanonical(virt));
        }
        let root = pool.slot_of(self.root)?;
        PageMapLevel4::lookup(pool, root, virt)
    }

    /// Translate `virt` to its physical address.
    ///
    /// For [`Access::User`] the user bit must be set on every entry of the walk.
    ///
    /// # Errors
    /// As [`lookup`](Self::lookup), plus [`PagingError::PermissionDenied`]
    /// for user accesses to supervisor-only memory.
    pub fn translate(
        &self,
        pool: &FramePool<'_>,
        virt: VirtualAddress,
        access: Access,
    ) -> Result<PhysicalAddress, PagingError> {
        let mapping = self.lookup(pool, virt)?;
        if access == Access::User && !mapping.attributes.user() {
            return Err(PagingError::PermissionDenied(virt));
        }
        Ok(mapping.translate(virt))
    }

    /// Release every table below the root and clear the root.
    ///
    /// The root page itself stays allocated; see [`destroy`](Self::destroy).
    ///
    /// # Errors
    /// [`PagingError::ForeignTable`] if the root is not part of `pool`.
    pub fn clear_all(&self, pool: &mut FramePool<'_>) -> Result<TlbFlush, PagingError> {
        let root = pool.slot_of(self.root)?;
        PageMapLevel4::clear_all(pool, root);
        debug!(
            "cleared address space {}, {} table pages in use",
            self.root,
            pool.used_slots()
        );
        Ok(TlbFlush::new(self.root))
    }

    /// Clear the address space and release its root page.
    ///
    /// The space must not be active on any CPU.
    ///
    /// # Errors
    /// [`PagingError::ForeignTable`] if the root is not part of `pool`.
    pub fn destroy(self, pool: &mut FramePool<'_>) -> Result<(), PagingError> {
        let root = pool.slot_of(self.root)?;
        PageMapLevel4::clear_all(pool, root);
        pool.deallocate(root);
        debug!("destroyed address space {}", self.root);
        Ok(())
    }

    /// Load this address space into `hw`.
    ///
    /// # Safety
    /// The tables must map all code, data and stacks the CPU uses after the
    /// switch (typically the shared kernel half).
    pub unsafe fn set_as_current<H: PagingHardware + ?Sized>(&self, hw: &mut H) {
        debug!("activating address space {}", self.root);
        unsafe { hw.load_root(self.root) }
    }

    /// `true` if `hw` currently uses this address space.
    #[inline]
    #[must_use]
    pub fn is_current<H: PagingHardware + ?Sized>(&self, hw: &H) -> bool {
        hw.active_root() == self.root
    }

    fn reserve(&self, pool: &FramePool<'_>, needed: usize) -> Result<(), PagingError> {
        if needed > pool.free_slots() {
            warn!(
                "address space {}: need {needed} table pages, only {} free",
                self.root,
                pool.free_slots()
            );
            return Err(PagingError::PoolExhausted);
        }
        Ok(())
    }
}

/// Check alignment and canonicality of `[virt, virt + len)`, returning the
/// length rounded up to whole pages. `len` must be non-zero.
fn validate_virtual(virt: VirtualAddress, len: u64) -> Result<u64, PagingError> {
    if !virt.is_aligned(Size4K::SIZE) {
        return Err(PagingError::Misaligned(virt.as_u64()));
    }

    let len = align_up(len, Size4K::SIZE).ok_or(PagingError::NonCanonical(virt))?;
    let last = virt
        .checked_add(len - 1)
        .ok_or(PagingError::NonCanonical(virt))?;
    if !virt.is_canonical() || !last.is_canonical() || virt.is_higher_half() != last.is_higher_half()
    {
        return Err(PagingError::NonCanonical(virt));
    }
    Ok(len)
}
