//! # weft-paging
//!
//! The address-space walker for VPEs on tiles with virtual memory.
//!
//! Page tables live in a memory tile; the kernel installs entries by
//! issuing TCU writes to the table frames. This crate implements the
//! walk itself, generic over a [`PtMem`] backend that performs the
//! actual frame allocation, PTE reads/writes, and TLB flushes, so the
//! logic can be exercised against an in-memory backend as well.
//!
//! # Format
//!
//! Four levels of 512 entries each map 48 bits of virtual address onto
//! 4 KiB pages. A PTE is the raw global address of the target (page
//! frame or next-level table) with the [`PageFlags`] bits packed into
//! the low 12 bits. Leaves one level up carry [`PageFlags::LARGE`] and
//! map 2 MiB at once; the walker coalesces to large pages whenever
//! alignment and remaining length allow.

#![no_std]

mod walker;

pub use walker::{AddrSpace, PtMem};

use weft_common::{GlobAddr, PageFlags};

/// Number of page-table levels.
pub const LEVEL_CNT: usize = 4;
/// Index bits per level.
pub const LEVEL_BITS: u32 = 9;
/// Index mask per level.
pub const LEVEL_MASK: u64 = (1 << LEVEL_BITS) - 1;
/// Entries per table.
pub const PTES_PER_TABLE: usize = 1 << LEVEL_BITS;

/// A page-table entry.
pub type Pte = u64;

/// Mask of the flag bits within a PTE.
pub const PTE_FLAG_MASK: Pte = (weft_common::cfg::PAGE_SIZE - 1) as Pte;

/// Extract the flags of a PTE.
#[inline]
#[must_use]
pub fn pte_flags(pte: Pte) -> PageFlags {
    PageFlags::from_bits(pte & PTE_FLAG_MASK)
}

/// Extract the target global address of a PTE.
#[inline]
#[must_use]
pub fn pte_addr(pte: Pte) -> GlobAddr {
    GlobAddr::new(pte & !PTE_FLAG_MASK)
}

/// Assemble a PTE from a global address and flags.
#[inline]
#[must_use]
pub fn pte_new(addr: GlobAddr, flags: PageFlags) -> Pte {
    (addr.raw() & !PTE_FLAG_MASK) | (flags.bits() & PTE_FLAG_MASK)
}

/// The index into the table at `level` for `virt`.
#[inline]
#[must_use]
pub fn pte_idx(virt: u64, level: usize) -> u64 {
    (virt >> (weft_common::cfg::PAGE_BITS + level as u32 * LEVEL_BITS)) & LEVEL_MASK
}
