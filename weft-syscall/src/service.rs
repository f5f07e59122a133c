//! Service protocol
//!
//! Messages the kernel sends to a registered service's receive gate on
//! behalf of clients, and the replies it expects. The kernel forwards
//! the argument block opaquely in both directions.

use crate::ops::ExchangeArgs;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Service-call opcodes (kernel -> service).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ServiceCall {
    /// A client delegates capabilities into the session.
    Delegate = 0,
    /// A client obtains capabilities from the session.
    Obtain = 1,
    /// A new creator is derived from this service.
    DeriveCreator = 2,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Exchange {
    pub opcode: u64,
    /// Session identity token.
    pub sess: u64,
    /// Capability range (raw `CapRngDesc`).
    pub caps: u64,
    pub args: ExchangeArgs,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExchangeReply {
    pub res: u64,
    /// Capability range the service offers (raw `CapRngDesc`).
    pub caps: u64,
    pub args: ExchangeArgs,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DeriveCreator {
    pub opcode: u64,
    pub sessions: u64,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DeriveCreatorReply {
    pub res: u64,
    pub creator: u64,
    /// Selector of a send gate in the service's table for the kernel to
    /// hand to the new creator.
    pub sgate_sel: u64,
}
