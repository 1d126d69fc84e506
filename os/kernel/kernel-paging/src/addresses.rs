//! # Virtual and Physical Memory Addresses
//!
//! Thin `u64` newtypes that keep virtual and physical addresses apart, plus
//! the page-size markers used to talk about page-aligned frames.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | An address translated by the page tables. |
//! | [`PhysicalAddress`] | A machine bus address (RAM, MMIO, table pages). |
//! | [`PhysicalPage<S>`] | A physical base aligned to page size `S`. |
//! | [`PageGranularity`] | Runtime form of the page size of a mapping. |

use crate::{PHYSICAL_ADDRESS_BITS, VIRTUAL_ADDRESS_BITS};
use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
    /// Runtime counterpart of the marker.
    const GRANULARITY: PageGranularity;
}

/// 4 KiB page (4096 bytes).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;
    const GRANULARITY: PageGranularity = PageGranularity::Size4K;
}

/// 2 MiB page (`2_097_152` bytes).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;
impl sealed::Sealed for Size2M {}
impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;
    const GRANULARITY: PageGranularity = PageGranularity::Size2M;
}

/// 1 GiB page (`1_073_741_824` bytes).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size1G;
impl sealed::Sealed for Size1G {}
impl PageSize for Size1G {
    const SIZE: u64 = 1024 * 1024 * 1024;
    const SHIFT: u32 = 30;
    const GRANULARITY: PageGranularity = PageGranularity::Size1G;
}

/// The size of the page a translation ended in.
///
/// 4 KiB pages are mapped through the PT level; 2 MiB and 1 GiB are
/// "big pages" that terminate early at PD or PDPT.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageGranularity {
    /// 4 KiB page mapped by a PTE (PT leaf).
    Size4K,
    /// 2 MiB page mapped by a PDE with `PS=1` (PD leaf).
    Size2M,
    /// 1 GiB page mapped by a PDPTE with `PS=1` (PDPT leaf).
    Size1G,
}

impl PageGranularity {
    /// Page size in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => Size4K::SIZE,
            Self::Size2M => Size2M::SIZE,
            Self::Size1G => Size1G::SIZE,
        }
    }
}

impl fmt::Display for PageGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Size4K => "4K",
            Self::Size2M => "2M",
            Self::Size1G => "1G",
        })
    }
}

/// A **virtual** memory address.
///
/// Carries no alignment or canonicality guarantee by itself; use
/// [`VirtualAddress::is_canonical`] where it matters.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// `true` if bits 63..47 are all equal (sign extension of bit 47).
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let high = self.0 >> (VIRTUAL_ADDRESS_BITS - 1);
        high == 0 || high == (u64::MAX >> (VIRTUAL_ADDRESS_BITS - 1))
    }

    /// `true` if the address lies in the upper (kernel) canonical half.
    #[inline]
    #[must_use]
    pub const fn is_higher_half(self) -> bool {
        (self.0 >> 63) != 0
    }

    /// Offset of this address within a naturally aligned block of `size` bytes.
    #[inline]
    #[must_use]
    pub const fn offset_in(self, size: u64) -> u64 {
        self.0 & (size - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, size: u64) -> bool {
        self.offset_in(size) == 0
    }

    /// The 9-bit table index selected by the address bits starting at `shift`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_index(self, shift: u32) -> usize {
        ((self.0 >> shift) & 0x1FF) as usize
    }

    /// Wrapping add, used when stepping past the very top of the address space.
    #[inline]
    #[must_use]
    pub const fn wrapping_add(self, rhs: u64) -> Self {
        Self(self.0.wrapping_add(rhs))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

/// A **physical** memory address.
///
/// When stored in a page-table entry the low 12, 21 or 30 bits are dropped
/// depending on the level; see [`PhysicalPage`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    /// One past the highest address representable in a page-table entry.
    pub const LIMIT: u64 = 1 << PHYSICAL_ADDRESS_BITS;

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, size: u64) -> bool {
        self.0 & (size - 1) == 0
    }

    /// The page of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::from_addr(self)
    }

    #[inline]
    #[must_use]
    pub const fn checked_sub(self, rhs: u64) -> Option<Self> {
        match self.0.checked_sub(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

/// Physical page base for size `S`.
///
/// The low `S::SHIFT` bits of the base are always zero: construction masks
/// them off, which is how big-page entries keep their alignment invariant.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    value: u64,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// Page containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: PhysicalAddress) -> Self {
        Self {
            value: addr.as_u64() & !(S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.value)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalPage<{:?}>({:#018X})",
            S::GRANULARITY,
            self.value
        )
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.value, S::GRANULARITY)
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage<S>) -> Self {
        value.base()
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_paging::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_paging::align_up;
/// assert_eq!(align_up(0,    4096), Some(0));
/// assert_eq!(align_up(1,    4096), Some(4096));
/// assert_eq!(align_up(4097, 4096), Some(8192));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_addresses() {
        assert!(VirtualAddress::new(0).is_canonical());
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_FFFF).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0xFFFF_7FFF_FFFF_FFFF).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(VirtualAddress::new(u64::MAX).is_canonical());
    }

    #[test]
    fn table_indices() {
        let va = VirtualAddress::new(0xFFFF_8888_0123_4567);
        assert_eq!(va.table_index(39), 0x111);
        assert_eq!(va.table_index(30), 0x020);
        assert_eq!(va.table_index(21), 0x009);
        assert_eq!(va.table_index(12), 0x034);
        assert_eq!(va.offset_in(Size4K::SIZE), 0x567);
    }

    #[test]
    fn physical_pages_mask_low_bits() {
        let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
        assert_eq!(pa.page::<Size4K>().base().as_u64(), 0x0000_0008_1234_5000);
        assert_eq!(pa.page::<Size2M>().base().as_u64(), 0x0000_0008_1220_0000);
        assert_eq!(pa.page::<Size1G>().base().as_u64(), 0x0000_0008_0000_0000);
    }

    #[test]
    fn granularity_bytes() {
        assert_eq!(PageGranularity::Size4K.bytes(), 4096);
        assert_eq!(PageGranularity::Size2M.bytes(), 1 << 21);
        assert_eq!(PageGranularity::Size1G.bytes(), 1 << 30);
    }
}
