//! # Paging Errors

use crate::addresses::{PhysicalAddress, VirtualAddress};

/// Error returned by page-table operations.
///
/// None of these are fatal at this layer; callers (task creation, syscall
/// argument validation) decide whether to abort or report a fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PagingError {
    /// No free table-page slot is left in the pool.
    #[error("page-table pool exhausted")]
    PoolExhausted,

    /// The walk reached a non-present entry.
    #[error("{0} is not mapped")]
    Unmapped(VirtualAddress),

    /// A user-mode access hit a supervisor-only mapping.
    #[error("user access to supervisor mapping at {0}")]
    PermissionDenied(VirtualAddress),

    /// A start address is not 4 KiB aligned.
    #[error("address {0:#x} is not 4 KiB aligned")]
    Misaligned(u64),

    /// The virtual range is not canonical, crosses the canonical hole, or wraps.
    #[error("virtual range at {0} is not canonical")]
    NonCanonical(VirtualAddress),

    /// The physical range does not fit in 52 address bits.
    #[error("physical range at {0} exceeds the physical address width")]
    PhysicalOutOfRange(PhysicalAddress),

    /// A child pointer does not refer to an allocated page of the pool.
    #[error("table at {0} does not belong to the pool")]
    ForeignTable(PhysicalAddress),

    /// The pool was constructed with zero or more than 32 pages.
    #[error("pool must hold between 1 and 32 pages, got {0}")]
    InvalidPoolSize(usize),

    /// The pool base is not 4 KiB aligned.
    #[error("pool base {0} is not 4 KiB aligned")]
    MisalignedPool(PhysicalAddress),
}
