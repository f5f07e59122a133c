//! # weft-common
//!
//! Shared types for the Weft microkernel and everything that talks to it:
//! tile identifiers and descriptors, global addresses, permission flags,
//! page-size configuration, and the boot-info block.
//!
//! # no_std
//!
//! This crate is `#![no_std]` and has zero dependencies, making it
//! suitable for the kernel, the tile multiplexer, and user runtimes
//! alike. All types used across the kernel boundary are `#[repr(C)]`
//! or `#[repr(transparent)]` with fixed layouts.

#![no_std]

pub mod addr;
pub mod boot;
pub mod cfg;
pub mod perm;
pub mod tile;

pub use addr::{GlobAddr, GlobOff};
pub use perm::{PageFlags, Perm};
pub use tile::{TileDesc, TileId, TileKind};
