//! # weft-tcu
//!
//! The Trusted Communication Unit interface.
//!
//! Every tile owns a TCU: a memory-mapped engine that performs all
//! cross-tile messaging and memory transfers under the endpoint
//! configuration the kernel controls. This crate provides:
//!
//! - the register map and endpoint register packing ([`regs`]),
//! - the bit-exact message header ([`header`]),
//! - the command-driven driver ([`Tcu`]) over a register-file backend
//!   trait ([`TcuRegs`]),
//! - a volatile-MMIO backend for hardware ([`mmio`]),
//! - a software fabric that models every tile's TCU and memory for
//!   hosted testing ([`sim`]).
//!
//! The driver is the same for both backends: commands are enqueued into
//! the CMD register and completion is observed by polling the same
//! register until the opcode returns to IDLE; the error field encodes
//! the outcome.

#![no_std]

extern crate alloc;

pub mod header;
pub mod mmio;
pub mod regs;
pub mod sim;

mod driver;

pub use driver::{RecvBuf, Tcu, TcuRegs};
pub use header::{Header, Message};
pub use regs::{ActId, EpId, Label, Reg};
