//! Syscall opcodes and wire structs
//!
//! Every syscall message starts with a 64-bit little-endian opcode,
//! followed by the per-opcode struct. All structs are `#[repr(C)]`
//! with only integer fields so they can be read from untrusted message
//! bytes via zerocopy.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A capability selector: an index into a per-VPE capability table.
pub type CapSel = u32;

/// Which of the two per-VPE tables a selector range addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CapKind {
    /// The object table.
    Object = 0,
    /// The map table (virtual-page mappings).
    Map = 1,
}

/// A capability range descriptor: table kind, start selector, count.
///
/// Packed into one u64 on the wire: bit 0 the kind, bits 1..32 the
/// count, bits 32..64 the start selector.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CapRngDesc {
    kind: CapKind,
    start: CapSel,
    count: CapSel,
}

impl CapRngDesc {
    /// Create a new range descriptor.
    #[must_use]
    pub const fn new(kind: CapKind, start: CapSel, count: CapSel) -> Self {
        Self { kind, start, count }
    }

    /// Decode from the wire representation.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        let kind = if raw & 1 == 0 {
            CapKind::Object
        } else {
            CapKind::Map
        };
        Self {
            kind,
            start: (raw >> 32) as CapSel,
            count: ((raw >> 1) & 0x7FFF_FFFF) as CapSel,
        }
    }

    /// Encode to the wire representation.
    #[must_use]
    pub fn raw(self) -> u64 {
        ((self.start as u64) << 32) | ((self.count as u64 & 0x7FFF_FFFF) << 1) | self.kind as u64
    }

    /// The table kind.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> CapKind {
        self.kind
    }

    /// The first selector.
    #[inline]
    #[must_use]
    pub const fn start(self) -> CapSel {
        self.start
    }

    /// The number of selectors.
    #[inline]
    #[must_use]
    pub const fn count(self) -> CapSel {
        self.count
    }
}

impl core::fmt::Debug for CapRngDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:?}[{}..{}]",
            self.kind,
            self.start,
            self.start as u64 + self.count as u64
        )
    }
}

/// Maximum length of VPE and service names on the wire.
pub const MAX_NAME_LEN: usize = 32;

/// The maximum number of VPEs one can wait for at once.
pub const MAX_WAIT_VPES: usize = 16;

/// The maximum payload of an exchange-over-session argument block.
pub const MAX_EXCHG_ARGS: usize = 8;

/// The system-call opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Operation {
    // Capability creations
    /// Allocate a receive gate.
    CreateRGate = 0,
    /// Bind a send gate to a receive gate.
    CreateSGate = 1,
    /// Derive a memory gate over the caller's memory.
    CreateMGate = 2,
    /// Create a VPE on a tile.
    CreateVpe = 3,
    /// Install a map capability.
    CreateMap = 4,
    /// Register a named service.
    CreateSrv = 5,
    /// Create a session on a service.
    CreateSess = 6,
    /// Allocate a semaphore.
    CreateSem = 7,
    /// Allocate contiguous endpoints on a tile.
    AllocEp = 8,

    // Capability operations
    /// Bind a gate to an endpoint slot.
    Activate = 9,
    /// Split a memory gate.
    DeriveMem = 10,
    /// Split a kernel-memory quota.
    DeriveKMem = 11,
    /// Split a tile's endpoint quota.
    DeriveTile = 12,
    /// Derive a service for another creator.
    DeriveSrv = 13,
    /// VPE lifecycle control.
    VpeCtrl = 14,
    /// Wait for VPE exits.
    VpeWait = 15,
    /// Semaphore up/down.
    SemCtrl = 16,
    /// Kernel-memory quota introspection.
    KMemQuota = 17,
    /// Tile quota introspection.
    TileQuota = 18,
    /// Look up a session by identity.
    GetSess = 19,

    // Capability exchange
    /// Exchange capabilities with a child VPE.
    Exchange = 20,
    /// Delegate capabilities over a session.
    Delegate = 21,
    /// Obtain capabilities over a session.
    Obtain = 22,
    /// Revoke a capability range.
    Revoke = 23,

    // Misc
    /// Measurement probe.
    Noop = 24,
}

impl Operation {
    /// Try to convert from a raw opcode.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw > Self::Noop as u64 {
            return None;
        }
        // SAFETY: Operation is repr(u64), dense, and raw is within range.
        Some(unsafe { core::mem::transmute::<u64, Operation>(raw) })
    }

    /// Get the opcode name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CreateRGate => "create_rgate",
            Self::CreateSGate => "create_sgate",
            Self::CreateMGate => "create_mgate",
            Self::CreateVpe => "create_vpe",
            Self::CreateMap => "create_map",
            Self::CreateSrv => "create_srv",
            Self::CreateSess => "create_sess",
            Self::CreateSem => "create_sem",
            Self::AllocEp => "alloc_ep",
            Self::Activate => "activate",
            Self::DeriveMem => "derive_mem",
            Self::DeriveKMem => "derive_kmem",
            Self::DeriveTile => "derive_tile",
            Self::DeriveSrv => "derive_srv",
            Self::VpeCtrl => "vpe_ctrl",
            Self::VpeWait => "vpe_wait",
            Self::SemCtrl => "sem_ctrl",
            Self::KMemQuota => "kmem_quota",
            Self::TileQuota => "tile_quota",
            Self::GetSess => "get_sess",
            Self::Exchange => "exchange",
            Self::Delegate => "delegate",
            Self::Obtain => "obtain",
            Self::Revoke => "revoke",
            Self::Noop => "noop",
        }
    }
}

/// Common prefix of every request: the opcode.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DefaultRequest {
    pub opcode: u64,
}

/// Common shape of every reply: the error code.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DefaultReply {
    pub error: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CreateRGate {
    pub opcode: u64,
    pub dst: u64,
    pub order: u64,
    pub msg_order: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CreateSGate {
    pub opcode: u64,
    pub dst: u64,
    pub rgate: u64,
    pub label: u64,
    pub credits: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CreateMGate {
    pub opcode: u64,
    pub dst: u64,
    pub vpe: u64,
    pub addr: u64,
    pub size: u64,
    pub perms: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CreateVpe {
    pub opcode: u64,
    pub dst: u64,
    pub tile: u64,
    pub kmem: u64,
    pub namelen: u64,
    pub name: [u8; MAX_NAME_LEN],
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CreateMap {
    pub opcode: u64,
    pub dst: u64,
    pub vpe: u64,
    pub mgate: u64,
    pub first: u64,
    pub pages: u64,
    pub perms: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CreateSrv {
    pub opcode: u64,
    pub dst: u64,
    pub rgate: u64,
    pub creator: u64,
    pub namelen: u64,
    pub name: [u8; MAX_NAME_LEN],
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CreateSess {
    pub opcode: u64,
    pub dst: u64,
    pub srv: u64,
    pub creator: u64,
    pub ident: u64,
    pub auto_close: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CreateSem {
    pub opcode: u64,
    pub dst: u64,
    pub value: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct AllocEp {
    pub opcode: u64,
    pub dst: u64,
    pub vpe: u64,
    /// Desired endpoint id, or `EP_COUNT` to let the kernel choose.
    pub epid: u64,
    pub replies: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Activate {
    pub opcode: u64,
    pub ep: u64,
    /// Gate selector, or `INVALID_SEL` to deactivate.
    pub gate: u64,
    pub rbuf_mem: u64,
    pub rbuf_off: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DeriveMem {
    pub opcode: u64,
    pub vpe: u64,
    pub dst: u64,
    pub src: u64,
    pub offset: u64,
    pub size: u64,
    pub perms: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DeriveKMem {
    pub opcode: u64,
    pub kmem: u64,
    pub dst: u64,
    pub quota: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DeriveTile {
    pub opcode: u64,
    pub tile: u64,
    pub dst: u64,
    pub eps: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DeriveSrv {
    pub opcode: u64,
    /// Two destination selectors: service clone and obtained send gate.
    pub dst: u64,
    pub srv: u64,
    pub sessions: u64,
    pub event: u64,
}

/// The operations for the `vpe_ctrl` system call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum VpeOp {
    /// Finish kernel-side initialisation (standard EPs).
    Init = 0,
    /// Start the VPE.
    Start = 1,
    /// Stop the VPE with an exit code.
    Stop = 2,
}

impl VpeOp {
    /// Try to convert from a raw value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Init),
            1 => Some(Self::Start),
            2 => Some(Self::Stop),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VpeCtrl {
    pub opcode: u64,
    pub vpe: u64,
    pub op: u64,
    pub arg: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VpeWait {
    pub opcode: u64,
    /// Zero for a blocking wait, else an event for an upcall on exit.
    pub event: u64,
    pub count: u64,
    pub sels: [u64; MAX_WAIT_VPES],
}

/// The operations for the `sem_ctrl` system call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum SemOp {
    /// Increment; wakes one waiter.
    Up = 0,
    /// Decrement; may block.
    Down = 1,
}

impl SemOp {
    /// Try to convert from a raw value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Up),
            1 => Some(Self::Down),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SemCtrl {
    pub opcode: u64,
    pub sem: u64,
    pub op: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct KMemQuota {
    pub opcode: u64,
    pub kmem: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TileQuota {
    pub opcode: u64,
    pub tile: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct GetSess {
    pub opcode: u64,
    pub dst: u64,
    pub srv: u64,
    pub vpe: u64,
    pub sid: u64,
}

/// Argument block exchanged with a service on delegate/obtain.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExchangeArgs {
    pub bytes: u64,
    pub data: [u64; MAX_EXCHG_ARGS],
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Exchange {
    pub opcode: u64,
    pub vpe: u64,
    /// Own capability range (raw [`CapRngDesc`]).
    pub own: u64,
    /// Start selector of the other VPE's range.
    pub other: u64,
    pub obtain: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExchangeSess {
    pub opcode: u64,
    pub vpe: u64,
    pub sess: u64,
    /// Capability range (raw [`CapRngDesc`]).
    pub caps: u64,
    pub args: ExchangeArgs,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Revoke {
    pub opcode: u64,
    pub vpe: u64,
    /// Capability range (raw [`CapRngDesc`]).
    pub caps: u64,
    pub own: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Noop {
    pub opcode: u64,
}

// Replies beyond the default one.

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CreateVpeReply {
    pub error: u64,
    pub id: u64,
    pub eps_start: u64,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct AllocEpReply {
    pub error: u64,
    pub ep: u64,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VpeWaitReply {
    pub error: u64,
    pub vpe_sel: u64,
    pub exitcode: u64,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct QuotaReply {
    pub error: u64,
    pub total: u64,
    pub left: u64,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExchangeSessReply {
    pub error: u64,
    pub args: ExchangeArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for raw in 0..=Operation::Noop as u64 {
            assert_eq!(Operation::from_raw(raw).unwrap() as u64, raw);
        }
        assert!(Operation::from_raw(Operation::Noop as u64 + 1).is_none());
    }

    #[test]
    fn test_crd_roundtrip() {
        let crd = CapRngDesc::new(CapKind::Map, 0x10, 4);
        let back = CapRngDesc::from_raw(crd.raw());
        assert_eq!(back.kind(), CapKind::Map);
        assert_eq!(back.start(), 0x10);
        assert_eq!(back.count(), 4);
    }
}
