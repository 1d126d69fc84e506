//! # Entry Bounds
//!
//! Computes which entries of one table a region `[va, va + len)` touches.
//! When the region continues past the end of the table, the range is clamped
//! to entry 511; the parent level hands the continuation to the next table.

use crate::ENTRIES_PER_TABLE;
use crate::addresses::VirtualAddress;
use core::ops::RangeInclusive;

/// Bits of virtual address consumed by one table level.
const INDEX_BITS: u32 = 9;

/// Inclusive index range `[first, last]` of one table touched by a region.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EntryBounds {
    first: usize,
    last: usize,
}

impl EntryBounds {
    /// Bounds for the region starting at `va` of `len` bytes at the level
    /// whose index starts at bit `shift` (12, 21, 30 or 39).
    ///
    /// A zero length is treated as touching the single entry containing `va`.
    #[must_use]
    pub const fn new(va: VirtualAddress, len: u64, shift: u32) -> Self {
        let start = va.as_u64();
        let end = start.saturating_add(if len == 0 { 0 } else { len - 1 });

        let first = va.table_index(shift);
        let group = shift + INDEX_BITS;
        let last = if (start >> group) != (end >> group) {
            ENTRIES_PER_TABLE - 1
        } else {
            VirtualAddress::new(end).table_index(shift)
        };

        Self { first, last }
    }

    /// First touched index.
    #[inline]
    #[must_use]
    pub const fn first(&self) -> usize {
        self.first
    }

    /// Last touched index (inclusive).
    #[inline]
    #[must_use]
    pub const fn last(&self) -> usize {
        self.last
    }

    /// Number of touched entries (at least one).
    #[inline]
    #[must_use]
    pub const fn count(&self) -> usize {
        self.last - self.first + 1
    }

    #[inline]
    #[must_use]
    pub const fn indices(&self) -> RangeInclusive<usize> {
        self.first..=self.last
    }
}
