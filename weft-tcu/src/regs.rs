//! TCU register map and endpoint register packing
//!
//! Each TCU exposes, in order: the external registers (privileged,
//! written by the kernel through a memory endpoint), the unprivileged
//! command registers, and one 3-register tuple per endpoint. All
//! registers are 64 bits wide.

use weft_common::{GlobOff, Perm, TileId};
use weft_syscall::{Code, Error, Result};

/// A TCU register.
pub type Reg = u64;
/// An endpoint id.
pub type EpId = u16;
/// A TCU label as carried in send endpoints and message headers.
pub type Label = u64;
/// An activity (VPE) id as stored in endpoint registers.
pub type ActId = u16;

/// The number of endpoints in each TCU.
pub const EP_COUNT: EpId = 128;

/// An invalid endpoint id.
pub const INVALID_EP: EpId = 0xFFFF;
/// The reply-EP base for receive endpoints without reply slots.
pub const NO_REPLIES: EpId = INVALID_EP;
/// Represents unlimited credits for send EPs.
pub const UNLIM_CREDITS: u32 = 0x3F;

/// The number of external registers.
pub const EXT_REGS: usize = 2;
/// The number of unprivileged registers.
pub const UNPRIV_REGS: usize = 6;
/// The number of registers per endpoint.
pub const EP_REGS: usize = 3;
/// Total registers in the file.
pub const NUM_REGS: usize = EXT_REGS + UNPRIV_REGS + EP_REGS * EP_COUNT as usize;

/// The base address of the TCU's MMIO area in every tile.
pub const MMIO_ADDR: GlobOff = 0xF000_0000;
/// The size of the TCU's MMIO area.
pub const MMIO_SIZE: usize = NUM_REGS * 8;

/// The external registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ExtReg {
    /// Stores the privileged flag.
    Features = 0,
    /// For external commands.
    ExtCmd = 1,
}

/// The unprivileged registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum UnprivReg {
    /// Starts commands and signals their completion.
    Command = 0,
    /// Specifies the local data address.
    DataAddr = 1,
    /// Specifies the data size.
    DataSize = 2,
    /// Specifies an additional argument.
    Arg1 = 3,
    /// The current time in nanoseconds.
    CurTime = 4,
    /// Debug print register.
    Print = 5,
}

/// The endpoint types, stored in the low 3 bits of an EP's first
/// register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum EpType {
    /// Invalid endpoint (unusable).
    Invalid = 0,
    /// Send endpoint.
    Send = 1,
    /// Receive endpoint.
    Receive = 2,
    /// Memory endpoint.
    Memory = 3,
}

impl EpType {
    /// Decode an EP type from the low bits of the first EP register.
    #[must_use]
    pub fn of(reg0: Reg) -> Self {
        match reg0 & 0x7 {
            1 => Self::Send,
            2 => Self::Receive,
            3 => Self::Memory,
            _ => Self::Invalid,
        }
    }
}

/// The commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum CmdOpCode {
    /// The idle command has no effect.
    Idle = 0,
    /// Sends a message.
    Send = 1,
    /// Replies to a message.
    Reply = 2,
    /// Reads from external memory.
    Read = 3,
    /// Writes to external memory.
    Write = 4,
    /// Fetches a message.
    FetchMsg = 5,
    /// Acknowledges a message.
    AckMsg = 6,
    /// Puts the CU to sleep.
    Sleep = 7,
}

impl CmdOpCode {
    /// Decode an opcode from the low bits of the command register.
    #[must_use]
    pub fn of(cmd: Reg) -> Self {
        match cmd & 0xF {
            1 => Self::Send,
            2 => Self::Reply,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::FetchMsg,
            6 => Self::AckMsg,
            7 => Self::Sleep,
            _ => Self::Idle,
        }
    }
}

/// The external commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ExtCmdOpCode {
    /// The idle command has no effect.
    Idle = 0,
    /// Invalidate an endpoint, if possible.
    InvEp = 1,
    /// Reset the CU.
    Reset = 2,
    /// Invalidate one TLB entry.
    InvPage = 3,
}

/// Build a command-register value: `op[4] | ep[9] | arg[..]`.
#[inline]
#[must_use]
pub fn build_cmd(ep: EpId, op: CmdOpCode, arg: Reg) -> Reg {
    op as Reg | ((ep as Reg) << 4) | (arg << 25)
}

/// Extract the error field of a completed command.
#[inline]
#[must_use]
pub fn cmd_error(cmd: Reg) -> Code {
    Code::from_raw(((cmd >> 20) & 0x1F) as u32)
}

/// Build a completed command-register value (used by TCU models).
#[inline]
#[must_use]
pub fn cmd_done(err: Code) -> Reg {
    CmdOpCode::Idle as Reg | (((err as u32 as Reg) & 0x1F) << 20)
}

/// Build an external-command value: `op[4] | ep[9] | force[1]`.
#[inline]
#[must_use]
pub fn build_ext_cmd(ep: EpId, op: ExtCmdOpCode, force: bool) -> Reg {
    op as Reg | ((ep as Reg) << 9) | ((force as Reg) << 25)
}

/// Build a TLB-invalidation external command for one page of one
/// activity: `op[4] | act[16] | page[..]`.
#[inline]
#[must_use]
pub fn build_inv_page(act: ActId, virt: u64) -> Reg {
    ExtCmdOpCode::InvPage as Reg
        | ((act as Reg) << 4)
        | ((virt >> crate::regs::PAGE_BITS_SHIFT) << 20)
}

/// Page shift used by the TLB-invalidation encoding.
pub const PAGE_BITS_SHIFT: u32 = 12;

/// Build a completed external-command value carrying `result`.
#[inline]
#[must_use]
pub fn ext_cmd_done(err: Code, result: Reg) -> Reg {
    ExtCmdOpCode::Idle as Reg | (((err as u32 as Reg) & 0x1F) << 4) | (result << 9)
}

/// Decode a completed external-command register into its result.
pub fn ext_cmd_result(reg: Reg) -> Result<Reg> {
    match Code::from_raw(((reg >> 4) & 0x1F) as u32) {
        Code::Success => Ok(reg >> 9),
        e => Err(Error::new(e)),
    }
}

/// Register-file index of an external register.
#[inline]
#[must_use]
pub const fn ext_reg_idx(reg: ExtReg) -> usize {
    reg as usize
}

/// Register-file index of an unprivileged register.
#[inline]
#[must_use]
pub const fn unpriv_reg_idx(reg: UnprivReg) -> usize {
    EXT_REGS + reg as usize
}

/// Register-file index of the first register of an endpoint.
#[inline]
#[must_use]
pub const fn ep_regs_idx(ep: EpId) -> usize {
    EXT_REGS + UNPRIV_REGS + EP_REGS * ep as usize
}

/// MMIO offset of an external register (for remote access).
#[inline]
#[must_use]
pub const fn ext_reg_addr(reg: ExtReg) -> GlobOff {
    MMIO_ADDR + (ext_reg_idx(reg) * 8) as GlobOff
}

/// MMIO offset of an endpoint's registers (for remote access).
#[inline]
#[must_use]
pub const fn ep_regs_addr(ep: EpId) -> GlobOff {
    MMIO_ADDR + (ep_regs_idx(ep) * 8) as GlobOff
}

// Field layout of the endpoint registers:
//
// SEND    r0 = type[0:3] | act[3:19] | cur_crd[19:25] | max_crd[25:31]
//              | msg_order[31:37] | crd_ep[37:53] | reply[53]
//         r1 = dst_ep[0:16] | dst_tile[16:32]
//         r2 = label
// RECEIVE r0 = type[0:3] | act[3:19] | reply_eps[19:35]
//              | slots_order[35:41] | msg_order[41:47]
//         r1 = buffer address
//         r2 = occupied[0:32] | unread[32:64]
// MEMORY  r0 = type[0:3] | act[3:19] | perm[19:21] | tile[21:37]
//         r1 = base address
//         r2 = size

/// Pack a receive-endpoint configuration.
pub fn config_recv(
    regs: &mut [Reg],
    act: ActId,
    buf: GlobOff,
    buf_ord: u32,
    msg_ord: u32,
    reply_eps: Option<EpId>,
) {
    regs[0] = EpType::Receive as Reg
        | ((act as Reg) << 3)
        | ((reply_eps.unwrap_or(NO_REPLIES) as Reg) << 19)
        | (((buf_ord - msg_ord) as Reg) << 35)
        | ((msg_ord as Reg) << 41);
    regs[1] = buf;
    regs[2] = 0;
}

/// Pack a send-endpoint configuration.
pub fn config_send(
    regs: &mut [Reg],
    act: ActId,
    lbl: Label,
    tile: TileId,
    dst_ep: EpId,
    msg_order: u32,
    credits: u32,
) {
    regs[0] = EpType::Send as Reg
        | ((act as Reg) << 3)
        | ((credits as Reg) << 19)
        | ((credits as Reg) << 25)
        | ((msg_order as Reg) << 31);
    regs[1] = (dst_ep as Reg) | ((tile.raw() as Reg) << 16);
    regs[2] = lbl;
}

/// Pack a reply send endpoint as the TCU sets it up on msg reception.
pub fn config_reply(
    regs: &mut [Reg],
    act: ActId,
    lbl: Label,
    tile: TileId,
    dst_ep: EpId,
    msg_order: u32,
    crd_ep: EpId,
) {
    config_send(regs, act, lbl, tile, dst_ep, msg_order, 1);
    regs[0] |= ((crd_ep as Reg) << 37) | (1 << 53);
}

/// Pack a memory-endpoint configuration.
pub fn config_mem(
    regs: &mut [Reg],
    act: ActId,
    tile: TileId,
    addr: GlobOff,
    size: usize,
    perm: Perm,
) {
    regs[0] = EpType::Memory as Reg
        | ((act as Reg) << 3)
        | (((perm.bits() & 0x3) as Reg) << 19)
        | ((tile.raw() as Reg) << 21);
    regs[1] = addr;
    regs[2] = size as Reg;
}

/// Fields of an unpacked send endpoint.
#[derive(Clone, Copy, Debug)]
pub struct SendEp {
    pub act: ActId,
    pub cur_credits: u32,
    pub max_credits: u32,
    pub msg_order: u32,
    pub crd_ep: EpId,
    pub is_reply: bool,
    pub dst_tile: TileId,
    pub dst_ep: EpId,
    pub label: Label,
}

/// Unpack send-endpoint registers; `None` if not a send EP.
#[must_use]
pub fn unpack_send(regs: &[Reg]) -> Option<SendEp> {
    if EpType::of(regs[0]) != EpType::Send {
        return None;
    }
    Some(SendEp {
        act: ((regs[0] >> 3) & 0xFFFF) as ActId,
        cur_credits: ((regs[0] >> 19) & 0x3F) as u32,
        max_credits: ((regs[0] >> 25) & 0x3F) as u32,
        msg_order: ((regs[0] >> 31) & 0x3F) as u32,
        crd_ep: ((regs[0] >> 37) & 0xFFFF) as EpId,
        is_reply: (regs[0] >> 53) & 1 != 0,
        dst_tile: TileId::new(((regs[1] >> 16) & 0xFFFF) as u16),
        dst_ep: (regs[1] & 0xFFFF) as EpId,
        label: regs[2],
    })
}

/// Fields of an unpacked receive endpoint.
#[derive(Clone, Copy, Debug)]
pub struct RecvEp {
    pub act: ActId,
    pub reply_eps: EpId,
    pub slots_order: u32,
    pub msg_order: u32,
    pub buf: GlobOff,
    pub occupied: u32,
    pub unread: u32,
}

impl RecvEp {
    /// Number of slots in the receive buffer.
    #[must_use]
    pub fn slots(&self) -> u32 {
        1 << self.slots_order
    }

    /// Whether this EP has reply slots attached.
    #[must_use]
    pub fn has_replies(&self) -> bool {
        self.reply_eps != NO_REPLIES
    }
}

/// Unpack receive-endpoint registers; `None` if not a receive EP.
#[must_use]
pub fn unpack_recv(regs: &[Reg]) -> Option<RecvEp> {
    if EpType::of(regs[0]) != EpType::Receive {
        return None;
    }
    Some(RecvEp {
        act: ((regs[0] >> 3) & 0xFFFF) as ActId,
        reply_eps: ((regs[0] >> 19) & 0xFFFF) as EpId,
        slots_order: ((regs[0] >> 35) & 0x3F) as u32,
        msg_order: ((regs[0] >> 41) & 0x3F) as u32,
        buf: regs[1],
        occupied: regs[2] as u32,
        unread: (regs[2] >> 32) as u32,
    })
}

/// Fields of an unpacked memory endpoint.
#[derive(Clone, Copy, Debug)]
pub struct MemEp {
    pub act: ActId,
    pub perm: Perm,
    pub tile: TileId,
    pub addr: GlobOff,
    pub size: GlobOff,
}

/// Unpack memory-endpoint registers; `None` if not a memory EP.
#[must_use]
pub fn unpack_mem(regs: &[Reg]) -> Option<MemEp> {
    if EpType::of(regs[0]) != EpType::Memory {
        return None;
    }
    Some(MemEp {
        act: ((regs[0] >> 3) & 0xFFFF) as ActId,
        perm: Perm::from_bits_truncate(((regs[0] >> 19) & 0x3) as u32),
        tile: TileId::new(((regs[0] >> 21) & 0xFFFF) as u16),
        addr: regs[1],
        size: regs[2],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_pack_unpack() {
        let mut regs = [0 as Reg; EP_REGS];
        config_send(&mut regs, 7, 0x1234, TileId::new(3), 16, 6, 1);
        let s = unpack_send(&regs).unwrap();
        assert_eq!(s.act, 7);
        assert_eq!(s.label, 0x1234);
        assert_eq!(s.dst_tile, TileId::new(3));
        assert_eq!(s.dst_ep, 16);
        assert_eq!(s.msg_order, 6);
        assert_eq!(s.cur_credits, 1);
        assert_eq!(s.max_credits, 1);
        assert!(!s.is_reply);
    }

    #[test]
    fn test_recv_pack_unpack() {
        let mut regs = [0 as Reg; EP_REGS];
        config_recv(&mut regs, 2, 0xE000, 8, 6, Some(20));
        let r = unpack_recv(&regs).unwrap();
        assert_eq!(r.act, 2);
        assert_eq!(r.buf, 0xE000);
        assert_eq!(r.slots(), 4);
        assert_eq!(r.msg_order, 6);
        assert_eq!(r.reply_eps, 20);
        assert_eq!(r.occupied, 0);
        assert_eq!(r.unread, 0);
    }

    #[test]
    fn test_mem_pack_unpack() {
        let mut regs = [0 as Reg; EP_REGS];
        config_mem(&mut regs, 1, TileId::new(8), 0x4_0000, 0x1000, Perm::RW);
        let m = unpack_mem(&regs).unwrap();
        assert_eq!(m.tile, TileId::new(8));
        assert_eq!(m.addr, 0x4_0000);
        assert_eq!(m.size, 0x1000);
        assert_eq!(m.perm, Perm::RW);
        assert!(unpack_send(&regs).is_none());
    }

    #[test]
    fn test_cmd_encoding() {
        let cmd = build_cmd(5, CmdOpCode::Send, 3);
        assert_eq!(CmdOpCode::of(cmd), CmdOpCode::Send);
        assert_eq!((cmd >> 4) & 0x1FF, 5);
        assert_eq!(cmd >> 25, 3);
        assert_eq!(cmd_error(cmd_done(Code::NoCredits)), Code::NoCredits);
        assert_eq!(
            ext_cmd_result(ext_cmd_done(Code::Success, 0xAB)).unwrap(),
            0xAB
        );
    }
}
