//! Tile-multiplexer protocol
//!
//! Two message channels between the kernel and the per-tile multiplexer:
//! sidecalls (kernel -> multiplexer, over the sidecall receive EP) and
//! kernel calls (multiplexer -> kernel, over the kernel-call EP).

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The VPE id the tile multiplexer itself runs under.
pub const TMUX_VPE_ID: u16 = 0xFFFE;

/// Sidecall opcodes (kernel -> tile multiplexer).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Sidecall {
    /// A VPE was created on this tile.
    VpeInit = 0,
    /// Start or stop a VPE.
    VpeCtrl = 1,
    /// An endpoint of a VPE was invalidated behind its back.
    EpInval = 2,
    /// An endpoint was invalidated with unread messages pending.
    RemMsgs = 3,
    /// Translate a virtual address to a global address.
    Translate = 4,
}

impl Sidecall {
    /// Try to convert from a raw value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::VpeInit),
            1 => Some(Self::VpeCtrl),
            2 => Some(Self::EpInval),
            3 => Some(Self::RemMsgs),
            4 => Some(Self::Translate),
            _ => None,
        }
    }
}

/// VPE lifecycle operations carried by [`VpeCtrl`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum TmuxVpeOp {
    /// Start scheduling the VPE.
    Start = 0,
    /// Stop scheduling the VPE.
    Stop = 1,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VpeInit {
    pub op: u64,
    pub vpe: u64,
    pub eps_start: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VpeCtrl {
    pub op: u64,
    pub vpe: u64,
    pub vpe_op: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct EpInval {
    pub op: u64,
    pub vpe: u64,
    pub ep: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RemMsgs {
    pub op: u64,
    pub vpe: u64,
    pub unread_mask: u64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Translate {
    pub op: u64,
    pub vpe: u64,
    pub virt: u64,
    pub perm: u64,
}

/// Reply to any sidecall: an error word plus one value (the translated
/// global address for [`Translate`], zero otherwise).
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Response {
    pub error: u64,
    pub val: u64,
}

/// Kernel-call opcodes (tile multiplexer -> kernel).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum TmuxCall {
    /// A VPE on this tile exited.
    Exit = 0,
}

impl TmuxCall {
    /// Try to convert from a raw value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Exit),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Exit {
    pub op: u64,
    pub vpe: u64,
    pub code: u64,
}
