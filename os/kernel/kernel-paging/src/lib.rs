//! # Kernel Paging
//!
//! Builds and mutates x86-64 four-level page tables for the kernel and its
//! tasks, with 4 KiB, 2 MiB and 1 GiB pages.
//!
//! ## What you get
//! - An [`AddressSpace`] rooted at a `PML4`, with region mapping, unmapping,
//!   translation and teardown.
//! - A [`FramePool`] that hands out page-table pages from a reserved region
//!   of at most 32 pages, tracked by a 32-bit bitmap.
//! - Typed [`VirtualAddress`]/[`PhysicalAddress`] newtypes and page-size markers.
//! - [`EntryAttributes`] shared by all levels.
//! - A [`PagingHardware`] abstraction over `CR3`, with a [`MockHardware`] for tests.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes (64 bits) each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   (Page Table Entry)  → maps 4 KiB page
//!   │        │        └────────────► PDE   (Page Directory Entry) → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE (Page Directory Pointer Table Entry) → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E (Page Map Level 4 Entry)
//! ```
//!
//! ### Leaf vs. non-leaf entries
//!
//! - A **leaf entry** directly maps physical memory: a PTE, or a PDE/PDPTE with `PS=1`.
//! - A **non-leaf entry** points to the next lower table level and continues the walk.
//!
//! Writable and user access are granted only if **every** entry on the walk
//! grants them. Pointer entries written by this crate are permissive, so the
//! leaf decides.
//!
//! ### Collapse and expand
//!
//! [`AddressSpace::map_region`] uses the largest page each part of a region
//! allows. Mapping part of an existing big page splits it into a child table
//! that replicates the big page (*expand*). When a child table again encodes
//! one contiguous, uniformly attributed big page, it is replaced by that big
//! page and its table page goes back to the pool (*collapse*).
//!
//! ## Example
//!
//! ```rust
//! use kernel_paging::{
//!     Access, AddressSpace, EntryAttributes, FramePool, MockHardware, PhysicalAddress,
//!     TablePage, VirtualAddress,
//! };
//!
//! let mut pages = vec![TablePage::zeroed(); 32];
//! let mut pool = FramePool::new(&mut pages, PhysicalAddress::new(0x10_0000)).unwrap();
//! let mut hw = MockHardware::new();
//!
//! let space = AddressSpace::create(&mut pool).unwrap();
//! space
//!     .map_region(
//!         &mut pool,
//!         VirtualAddress::new(0x40_0000),
//!         PhysicalAddress::new(0x20_0000),
//!         0x20_0000,
//!         EntryAttributes::USER_RW,
//!     )
//!     .unwrap()
//!     .flush(&mut hw);
//!
//! let pa = space
//!     .translate(&pool, VirtualAddress::new(0x40_1234), Access::User)
//!     .unwrap();
//! assert_eq!(pa, PhysicalAddress::new(0x20_1234));
//!
//! space.clear_all(&mut pool).unwrap().ignore();
//! assert_eq!(pool.used_slots(), 1);
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod address_space;
mod addresses;
mod attributes;
mod bounds;
mod error;
pub mod page_table;
mod platform;
mod pool;

pub use crate::address_space::{Access, AddressSpace};
pub use crate::addresses::{
    PageGranularity, PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K,
    VirtualAddress, align_down, align_up,
};
pub use crate::attributes::EntryAttributes;
pub use crate::bounds::EntryBounds;
pub use crate::error::PagingError;
pub use crate::page_table::Mapping;
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use crate::platform::Cr3Register;
pub use crate::platform::{Cr3, MockHardware, PagingHardware, TlbFlush};
pub use crate::pool::{FramePool, TablePage, TableSlot};

/// Entries per page table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Size and alignment of one page-table page.
pub const TABLE_PAGE_SIZE: usize = 4096;

/// Maximum number of pages in a [`FramePool`] (one bitmap bit each).
pub const MAX_POOL_PAGES: usize = 32;

/// Physical address width addressable through page-table entries.
pub const PHYSICAL_ADDRESS_BITS: u32 = 52;

/// Virtual address width of four-level paging.
pub const VIRTUAL_ADDRESS_BITS: u32 = 48;
