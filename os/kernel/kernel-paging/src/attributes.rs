//! # Entry Attributes
//!
//! The attribute set carried by every mapping, independent of the level it
//! ends up at. Two entries *match* only if all four attributes are equal;
//! hardware-maintained bits (accessed, dirty) are not part of the set.
//!
//! ## Hardware bit layout (all levels)
//!
//! | Bits   | Name | Meaning |
//! |--------|------|---------|
//! | 0      | P    | Present |
//! | 1      | RW   | Writable ([`EntryAttributes::writable`]) |
//! | 2      | US   | User accessible ([`EntryAttributes::user`]) |
//! | 3      | PWT  | Write-through ([`EntryAttributes::write_through`]) |
//! | 4      | PCD  | Cache disable ([`EntryAttributes::cache_disable`]) |
//! | 5      | A    | Accessed |
//! | 6      | D    | Dirty (leaf only) |
//! | 7      | PS   | Page size at L3/L2, PAT at L1 |
//! | 8      | G    | Global (leaf only) |
//! | 12..51 | -    | Physical address |
//! | 63     | NX   | No-execute |

use bitfield_struct::bitfield;

/// Attribute set attached to a mapping.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct EntryAttributes {
    /// Writes are allowed through this mapping.
    pub writable: bool,

    /// User mode (CPL=3) may access this mapping.
    pub user: bool,

    /// Write-through caching instead of write-back.
    pub write_through: bool,

    /// Caching disabled (MMIO).
    pub cache_disable: bool,

    #[bits(4)]
    __reserved: u8,
}

impl EntryAttributes {
    /// Supervisor-only, read-only (kernel code, rodata).
    pub const KERNEL_RO: Self = Self::new();

    /// Supervisor-only, writable (kernel data, stacks, heap).
    pub const KERNEL_RW: Self = Self::new().with_writable(true);

    /// User accessible, read-only (user code).
    pub const USER_RO: Self = Self::new().with_user(true);

    /// User accessible, writable (user data, stacks).
    pub const USER_RW: Self = Self::new().with_writable(true).with_user(true);

    /// Supervisor-only, writable, uncached (device registers).
    pub const MMIO: Self = Self::new()
        .with_writable(true)
        .with_write_through(true)
        .with_cache_disable(true);

    /// Attributes of a child-table pointer: permissive, since the effective
    /// permission is the intersection along the walk.
    pub(crate) const TABLE_POINTER: Self = Self::USER_RW;

    /// Hardware bits 1..4 of an entry carrying these attributes.
    #[inline]
    #[must_use]
    pub(crate) const fn entry_bits(self) -> u64 {
        ((self.into_bits() & 0xF) as u64) << 1
    }

    /// Attributes encoded in bits 1..4 of a raw entry.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn from_entry_bits(entry: u64) -> Self {
        Self::from_bits(((entry >> 1) & 0xF) as u8)
    }

    /// Intersect the permission bits with those of a parent entry.
    ///
    /// Caching bits are a property of the leaf and are kept as-is.
    #[inline]
    #[must_use]
    pub const fn restricted_by(self, parent: Self) -> Self {
        self.with_writable(self.writable() && parent.writable())
            .with_user(self.user() && parent.user())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_differ() {
        assert_ne!(EntryAttributes::KERNEL_RW, EntryAttributes::USER_RW);
        assert!(EntryAttributes::USER_RW.user());
        assert!(EntryAttributes::USER_RW.writable());
        assert!(!EntryAttributes::KERNEL_RO.writable());
        assert!(EntryAttributes::MMIO.cache_disable());
    }

    #[test]
    fn restriction_intersects_permissions_only() {
        let leaf = EntryAttributes::USER_RW.with_cache_disable(true);
        let restricted = leaf.restricted_by(EntryAttributes::KERNEL_RO);
        assert!(!restricted.user());
        assert!(!restricted.writable());
        assert!(restricted.cache_disable());
    }

    #[test]
    fn hardware_positions() {
        assert_eq!(EntryAttributes::KERNEL_RW.entry_bits(), 1 << 1);
        assert_eq!(EntryAttributes::USER_RO.entry_bits(), 1 << 2);
        assert_eq!(EntryAttributes::MMIO.entry_bits(), (1 << 1) | (1 << 3) | (1 << 4));

        // Present, accessed and dirty do not leak into the attribute set.
        let raw = 0x8000_0000_0012_3067;
        assert_eq!(EntryAttributes::from_entry_bits(raw), EntryAttributes::USER_RW);
    }
}
