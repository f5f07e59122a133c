//! # weft-syscall
//!
//! The kernel ABI: everything that crosses the wire between user tiles
//! and the kernel, and between the kernel and the per-tile multiplexer.
//!
//! Syscall messages are framed by the TCU header; the first 8 bytes of
//! the payload are a little-endian opcode, the remainder a per-opcode
//! `#[repr(C)]` struct with fixed layout. Reply messages begin with a
//! 64-bit error word carrying a [`Code`]. There is no serialisation
//! layer; structs derive `zerocopy` traits and are read straight from
//! the message bytes.

#![no_std]

pub mod error;
pub mod ops;
pub mod service;
pub mod tmcalls;
pub mod upcalls;

pub use error::{Code, Error, Result};
pub use ops::{CapRngDesc, CapSel, CapKind};

/// First selectors of every VPE's object table are reserved.
pub const SEL_VPE: CapSel = 0;
/// Selector of the VPE's tile object.
pub const SEL_TILE: CapSel = 1;
/// Selector of the VPE's kernel-memory object.
pub const SEL_KMEM: CapSel = 2;
/// First selector available for user allocations.
pub const FIRST_FREE_SEL: CapSel = 3;

/// An invalid selector.
pub const INVALID_SEL: CapSel = u32::MAX;
