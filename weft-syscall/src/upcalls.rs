//! Kernel upcalls
//!
//! Asynchronous notifications from the kernel to a VPE's upcall receive
//! endpoint, correlated with a user-chosen 64-bit event.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Upcall opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Upcall {
    /// A VPE from an earlier `vpe_wait(event != 0)` exited.
    VpeWait = 0,
    /// An earlier `derive_srv` completed.
    DeriveSrv = 1,
}

/// Common prefix of every upcall.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DefaultUpcall {
    pub opcode: u64,
    pub event: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VpeWait {
    pub def: DefaultUpcall,
    pub error: u64,
    pub vpe_sel: u64,
    pub exitcode: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DeriveSrv {
    pub def: DefaultUpcall,
    pub error: u64,
}
