//! # Paging Hardware
//!
//! The register that selects the active address space (CR3 on x86-64) sits
//! behind [`PagingHardware`]. The kernel uses [`Cr3Register`]; tests and host
//! tools use [`MockHardware`].
//!
//! Mutating operations on an [`AddressSpace`](crate::AddressSpace) return a
//! [`TlbFlush`] token. Translations cached by the CPU stay stale until the
//! token is flushed against the hardware that may have the space loaded.

use crate::addresses::{PhysicalAddress, PhysicalPage, Size4K};
use bitfield_struct::bitfield;
use log::trace;

/// CR3: Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical base address of the PML4 table and cache-control flags
/// for PML4 walks.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    /// Bits 0–2: Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3: PWT: Page-level Write-Through for PML4.
    pub pwt: bool,

    /// Bit 4: PCD: Page-level Cache Disable for PML4.
    pub pcd: bool,

    /// Bits 5–11: Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52–63: Reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// A `Cr3` value selecting the PML4 in `root`, with write-back caching.
    #[inline]
    #[must_use]
    pub const fn from_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_pml4_base_4k(root.base().as_u64() >> 12)
    }

    /// The PML4 page selected by this value.
    #[inline]
    #[must_use]
    pub const fn root(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.pml4_base_4k() << 12))
    }

    /// Read the current CR3 value.
    ///
    /// # Safety
    /// Privileged instruction: must run at CPL0.
    #[cfg(all(feature = "asm", target_arch = "x86_64"))]
    #[inline]
    #[must_use]
    pub unsafe fn load() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }

    /// Write CR3, switching address spaces and flushing non-global TLB entries.
    ///
    /// # Safety
    /// Must run at CPL0. The new PML4 must map the currently executing code,
    /// the stack and everything else the CPU touches after the switch.
    #[cfg(all(feature = "asm", target_arch = "x86_64"))]
    #[inline]
    pub unsafe fn store(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

/// Access to the register holding the active address-space root.
pub trait PagingHardware {
    /// Make `root` the active PML4.
    ///
    /// # Safety
    /// `root` must be a valid PML4 mapping everything the CPU executes and
    /// touches after the switch.
    unsafe fn load_root(&mut self, root: PhysicalPage<Size4K>);

    /// The PML4 currently in use.
    fn active_root(&self) -> PhysicalPage<Size4K>;

    /// Invalidate all cached non-global translations.
    ///
    /// The default reloads the active root.
    fn flush_all(&mut self) {
        let root = self.active_root();
        // SAFETY: the root is already active; reloading it changes no mapping.
        unsafe { self.load_root(root) }
    }
}

/// The real CR3 register of the executing CPU.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[derive(Debug)]
pub struct Cr3Register {
    _private: (),
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl Cr3Register {
    /// # Safety
    /// Must only be constructed in kernel mode (CPL0) with long-mode paging
    /// enabled; every method executes privileged instructions.
    #[inline]
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl PagingHardware for Cr3Register {
    unsafe fn load_root(&mut self, root: PhysicalPage<Size4K>) {
        // SAFETY: CPL0 is guaranteed by construction, the root by the caller.
        unsafe { Cr3::from_root(root).store() }
    }

    fn active_root(&self) -> PhysicalPage<Size4K> {
        // SAFETY: CPL0 is guaranteed by construction.
        unsafe { Cr3::load() }.root()
    }
}

/// In-memory stand-in for CR3 that records every root load and TLB flush.
#[derive(Debug, Default)]
pub struct MockHardware {
    cr3: Cr3,
    loads: usize,
    flushes: usize,
}

impl MockHardware {
    /// Mock with CR3 = 0 and no recorded activity.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cr3: Cr3::new(),
            loads: 0,
            flushes: 0,
        }
    }

    /// The raw CR3 value last loaded.
    #[must_use]
    pub const fn cr3(&self) -> Cr3 {
        self.cr3
    }

    /// Number of [`PagingHardware::load_root`] calls.
    #[must_use]
    pub const fn loads(&self) -> usize {
        self.loads
    }

    /// Number of [`PagingHardware::flush_all`] calls.
    #[must_use]
    pub const fn flushes(&self) -> usize {
        self.flushes
    }
}

impl PagingHardware for MockHardware {
    unsafe fn load_root(&mut self, root: PhysicalPage<Size4K>) {
        self.cr3 = Cr3::from_root(root);
        self.loads += 1;
    }

    fn active_root(&self) -> PhysicalPage<Size4K> {
        self.cr3.root()
    }

    fn flush_all(&mut self) {
        self.flushes += 1;
    }
}

/// A pending TLB flush for a whole address space.
///
/// Returned by every operation that changes page tables. Call
/// [`flush`](Self::flush) with the hardware the space may be active on, or
/// [`ignore`](Self::ignore) if it is known not to be loaded anywhere.
#[must_use = "TLB flush is pending; call .flush() or .ignore()"]
#[derive(Debug, PartialEq, Eq)]
pub struct TlbFlush {
    root: PhysicalPage<Size4K>,
}

impl TlbFlush {
    #[inline]
    pub(crate) const fn new(root: PhysicalPage<Size4K>) -> Self {
        Self { root }
    }

    /// Root of the address space that was changed.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Flush `hw`'s TLB if the changed address space is the active one.
    ///
    /// Returns `true` if a flush was issued.
    #[allow(clippy::must_use_candidate)]
    pub fn flush<H: PagingHardware + ?Sized>(self, hw: &mut H) -> bool {
        if hw.active_root() != self.root {
            return false;
        }
        trace!("flushing TLB for address space {}", self.root);
        hw.flush_all();
        true
    }

    /// Drop the flush, e.g. for an address space that was never loaded.
    #[inline]
    pub fn ignore(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr3_layout() {
        let root = PhysicalAddress::new(0x0000_0001_2345_6000).page();
        let cr3 = Cr3::from_root(root).with_pcd(true);
        assert_eq!(cr3.into_bits(), 0x0000_0001_2345_6010);
        assert_eq!(cr3.root(), root);
    }

    #[test]
    fn mock_records_loads_and_flushes() {
        let mut hw = MockHardware::new();
        let root = PhysicalAddress::new(0x7000).page();
        unsafe { hw.load_root(root) };
        assert_eq!(hw.active_root(), root);
        assert_eq!(hw.loads(), 1);

        assert!(TlbFlush::new(root).flush(&mut hw));
        assert!(!TlbFlush::new(PhysicalAddress::new(0x8000).page()).flush(&mut hw));
        assert_eq!(hw.flushes(), 1);
        assert_eq!(hw.loads(), 1);
    }
}
