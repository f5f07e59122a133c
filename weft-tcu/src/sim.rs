//! Software fabric
//!
//! A functional model of the fabric for hosted testing: per-tile TCU
//! register files, scratchpad/DRAM arrays, and the full command
//! semantics (credits, occupied/unread masks, reply-slot setup,
//! external commands). The kernel and tests drive it through the same
//! [`Tcu`](crate::Tcu) driver that runs on hardware; only the register
//! file backend differs.
//!
//! # Address model
//!
//! Per tile, the bus decodes addresses in this order:
//!
//! - the TCU MMIO window (`MMIO_ADDR ..`): the register file, with
//!   external-command side effects,
//! - below the tile's memory size: the DRAM/scratchpad array,
//! - at or above [`HOST_BASE`] on compute tiles: host memory of the
//!   test process. This models DMA into buffers the driver described
//!   by pointer (receive buffers, transfer data), exactly like the TCU
//!   does on hardware.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use weft_common::{GlobOff, TileDesc, TileId};
use weft_syscall::Code;

use crate::driver::TcuRegs;
use crate::header::{Header, FLAG_REPLY};
use crate::regs::{
    cmd_done, config_reply, ep_regs_idx, ext_cmd_done, ext_reg_idx, unpack_mem, unpack_recv,
    unpack_send, unpriv_reg_idx, CmdOpCode, EpId, EpType, ExtCmdOpCode, ExtReg, Reg, UnprivReg,
    EP_COUNT, EP_REGS, MMIO_ADDR, MMIO_SIZE, NO_REPLIES, NUM_REGS, UNLIM_CREDITS,
};

/// Compute-tile addresses at or above this value are host memory.
pub const HOST_BASE: GlobOff = 0x1_0000_0000;

/// Scratchpad modelled for compute tiles that do not specify a size.
const DEF_SPM_SIZE: usize = 0x1_0000;

const HDR_SIZE: usize = core::mem::size_of::<Header>();

struct SimTile {
    desc: TileDesc,
    regs: Vec<Reg>,
    mem: Vec<u8>,
}

impl SimTile {
    fn new(desc: TileDesc) -> Self {
        let mem_size = if desc.is_mem() {
            desc.mem_size()
        } else if desc.mem_size() != 0 {
            desc.mem_size()
        } else {
            DEF_SPM_SIZE
        };
        Self {
            desc,
            regs: vec![0; NUM_REGS],
            mem: vec![0; mem_size],
        }
    }
}

/// The software fabric: all tiles, their TCUs and memories.
pub struct SimFabric {
    tiles: BTreeMap<u16, SimTile>,
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFabric {
    /// Create an empty fabric.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tiles: BTreeMap::new(),
        }
    }

    /// Add a tile to the fabric.
    pub fn add_tile(&mut self, id: TileId, desc: TileDesc) {
        self.tiles.insert(id.raw(), SimTile::new(desc));
    }

    /// Get a register-file handle for `tile`, for use with
    /// [`Tcu::new`](crate::Tcu::new).
    #[must_use]
    pub fn handle(fabric: &Rc<RefCell<SimFabric>>, tile: TileId) -> SimTcu {
        SimTcu {
            fabric: fabric.clone(),
            tile: tile.raw(),
        }
    }

    /// Read the register tuple of an endpoint (for inspection).
    #[must_use]
    pub fn ep_regs_of(&self, tile: TileId, ep: EpId) -> [Reg; EP_REGS] {
        let t = &self.tiles[&tile.raw()];
        let base = ep_regs_idx(ep);
        [t.regs[base], t.regs[base + 1], t.regs[base + 2]]
    }

    /// Read `buf.len()` bytes from `addr` on `tile` (for inspection).
    pub fn read_mem(&mut self, tile: TileId, addr: GlobOff, buf: &mut [u8]) -> Code {
        self.bus_read(tile.raw(), addr, buf)
    }

    /// Write `data` to `addr` on `tile` (for test setup).
    pub fn write_mem(&mut self, tile: TileId, addr: GlobOff, data: &[u8]) -> Code {
        self.bus_write(tile.raw(), addr, data)
    }

    fn reg(&self, tile: u16, idx: usize) -> Reg {
        self.tiles[&tile].regs[idx]
    }

    fn set_reg(&mut self, tile: u16, idx: usize, val: Reg) {
        self.tiles.get_mut(&tile).unwrap().regs[idx] = val;
    }

    fn ep_regs(&self, tile: u16, ep: EpId) -> [Reg; EP_REGS] {
        let base = ep_regs_idx(ep);
        let t = &self.tiles[&tile];
        [t.regs[base], t.regs[base + 1], t.regs[base + 2]]
    }

    fn set_ep_regs(&mut self, tile: u16, ep: EpId, regs: &[Reg; EP_REGS]) {
        let base = ep_regs_idx(ep);
        let t = self.tiles.get_mut(&tile).unwrap();
        t.regs[base..base + EP_REGS].copy_from_slice(regs);
    }

    fn unpriv(&self, tile: u16, reg: UnprivReg) -> Reg {
        self.reg(tile, unpriv_reg_idx(reg))
    }

    // -- bus access

    fn bus_read(&mut self, tile: u16, addr: GlobOff, buf: &mut [u8]) -> Code {
        if addr >= MMIO_ADDR && addr < MMIO_ADDR + MMIO_SIZE as GlobOff {
            if addr % 8 != 0 || buf.len() % 8 != 0 {
                return Code::MsgUnaligned;
            }
            let first = ((addr - MMIO_ADDR) / 8) as usize;
            for (i, chunk) in buf.chunks_mut(8).enumerate() {
                chunk.copy_from_slice(&self.reg(tile, first + i).to_le_bytes());
            }
            return Code::Success;
        }

        let t = match self.tiles.get_mut(&tile) {
            Some(t) => t,
            None => return Code::OutOfBounds,
        };
        let end = addr as usize + buf.len();
        if end <= t.mem.len() {
            buf.copy_from_slice(&t.mem[addr as usize..end]);
            Code::Success
        } else if addr >= HOST_BASE && !t.desc.is_mem() {
            // SAFETY: the address was handed to a TCU command by the
            // driver, which points it at live buffers; the model trusts
            // it like hardware trusts the NoC.
            unsafe {
                core::ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len());
            }
            Code::Success
        } else {
            Code::OutOfBounds
        }
    }

    fn bus_write(&mut self, tile: u16, addr: GlobOff, data: &[u8]) -> Code {
        if addr >= MMIO_ADDR && addr < MMIO_ADDR + MMIO_SIZE as GlobOff {
            if addr % 8 != 0 || data.len() % 8 != 0 {
                return Code::MsgUnaligned;
            }
            let first = ((addr - MMIO_ADDR) / 8) as usize;
            for (i, chunk) in data.chunks(8).enumerate() {
                let mut w = [0u8; 8];
                w.copy_from_slice(chunk);
                self.reg_write(tile, first + i, Reg::from_le_bytes(w));
            }
            return Code::Success;
        }

        let t = match self.tiles.get_mut(&tile) {
            Some(t) => t,
            None => return Code::OutOfBounds,
        };
        let end = addr as usize + data.len();
        if end <= t.mem.len() {
            t.mem[addr as usize..end].copy_from_slice(data);
            Code::Success
        } else if addr >= HOST_BASE && !t.desc.is_mem() {
            // SAFETY: as in bus_read
            unsafe {
                core::ptr::copy_nonoverlapping(data.as_ptr(), addr as usize as *mut u8, data.len());
            }
            Code::Success
        } else {
            Code::OutOfBounds
        }
    }

    /// Register write with side effects (command execution).
    fn reg_write(&mut self, tile: u16, idx: usize, val: Reg) {
        if idx == ext_reg_idx(ExtReg::ExtCmd) {
            self.exec_ext_cmd(tile, val);
        } else if idx == unpriv_reg_idx(UnprivReg::Command) {
            self.exec_cmd(tile, val);
        } else {
            self.set_reg(tile, idx, val);
        }
    }

    // -- command execution

    fn exec_cmd(&mut self, tile: u16, cmd: Reg) {
        let ep = ((cmd >> 4) & 0x1FF) as EpId;
        let arg = cmd >> 25;
        let res = match CmdOpCode::of(cmd) {
            CmdOpCode::Idle => Code::Success,
            CmdOpCode::Send => self.do_send(tile, ep, arg as EpId),
            CmdOpCode::Reply => self.do_reply(tile, ep, arg as usize),
            CmdOpCode::Read => self.do_transfer(tile, ep, false),
            CmdOpCode::Write => self.do_transfer(tile, ep, true),
            CmdOpCode::FetchMsg => self.do_fetch(tile, ep),
            CmdOpCode::AckMsg => self.do_ack(tile, ep, arg as usize),
            // nothing to wait for: the model completes synchronously
            CmdOpCode::Sleep => Code::Success,
        };
        self.set_reg(tile, unpriv_reg_idx(UnprivReg::Command), cmd_done(res));
    }

    fn do_send(&mut self, tile: u16, ep: EpId, reply_ep: EpId) -> Code {
        let sregs = self.ep_regs(tile, ep);
        let s = match unpack_send(&sregs) {
            Some(s) => s,
            None => return Code::NoSep,
        };
        if s.is_reply {
            return Code::SendReplyEp;
        }

        let size = self.unpriv(tile, UnprivReg::DataSize) as usize;
        let addr = self.unpriv(tile, UnprivReg::DataAddr);
        let reply_lbl = self.unpriv(tile, UnprivReg::Arg1);
        if size + HDR_SIZE > 1 << s.msg_order {
            return Code::SendInvMsgSz;
        }
        if s.cur_credits != UNLIM_CREDITS && s.cur_credits == 0 {
            return Code::NoCredits;
        }

        let mut payload = vec![0u8; size];
        let res = self.bus_read(tile, addr, &mut payload);
        if res != Code::Success {
            return res;
        }

        let res = self.deliver(
            s.dst_tile.raw(),
            s.dst_ep,
            &payload,
            Delivery {
                flags: 0,
                sender_tile: tile,
                sender_ep: ep,
                reply_to_ep: reply_ep,
                reply_lbl,
                label: s.label,
            },
        );
        if res != Code::Success {
            // failed sends do not consume credits
            return res;
        }

        if s.cur_credits != UNLIM_CREDITS {
            let mut regs = sregs;
            regs[0] &= !(0x3F << 19);
            regs[0] |= (((s.cur_credits - 1) as Reg) & 0x3F) << 19;
            self.set_ep_regs(tile, ep, &regs);
        }
        Code::Success
    }

    fn do_reply(&mut self, tile: u16, ep: EpId, msg_off: usize) -> Code {
        let rregs = self.ep_regs(tile, ep);
        let r = match unpack_recv(&rregs) {
            Some(r) => r,
            None => return Code::NoRep,
        };
        if !r.has_replies() {
            return Code::RepliesDisabled;
        }
        let slot = msg_off >> r.msg_order;
        if slot >= r.slots() as usize || msg_off & ((1 << r.msg_order) - 1) != 0 {
            return Code::InvMsgOff;
        }
        if r.occupied & (1 << slot) == 0 {
            return Code::InvMsgOff;
        }

        let rep_slot = r.reply_eps + slot as EpId;
        let repregs = self.ep_regs(tile, rep_slot);
        let rs = match unpack_send(&repregs) {
            Some(rs) if rs.is_reply => rs,
            // the kernel poisoned this reply slot
            _ => return Code::NoSep,
        };

        let size = self.unpriv(tile, UnprivReg::DataSize) as usize;
        let addr = self.unpriv(tile, UnprivReg::DataAddr);
        if size + HDR_SIZE > 1 << rs.msg_order {
            return Code::SendInvMsgSz;
        }
        let mut payload = vec![0u8; size];
        let res = self.bus_read(tile, addr, &mut payload);
        if res != Code::Success {
            return res;
        }

        let res = self.deliver(
            rs.dst_tile.raw(),
            rs.dst_ep,
            &payload,
            Delivery {
                flags: FLAG_REPLY,
                sender_tile: tile,
                sender_ep: rs.crd_ep,
                reply_to_ep: NO_REPLIES,
                reply_lbl: 0,
                label: rs.label,
            },
        );
        if res != Code::Success {
            return res;
        }

        // return the credit to the original sender's EP
        let dst = rs.dst_tile.raw();
        let cregs = self.ep_regs(dst, rs.crd_ep);
        if let Some(c) = unpack_send(&cregs) {
            if c.cur_credits != UNLIM_CREDITS && c.cur_credits < c.max_credits {
                let mut regs = cregs;
                regs[0] &= !(0x3F << 19);
                regs[0] |= (((c.cur_credits + 1) as Reg) & 0x3F) << 19;
                self.set_ep_regs(dst, rs.crd_ep, &regs);
            }
        }

        // the reply slot is one-shot, and replying acks the request
        self.set_ep_regs(tile, rep_slot, &[0; EP_REGS]);
        self.clear_slot(tile, ep, slot);
        Code::Success
    }

    fn do_transfer(&mut self, tile: u16, ep: EpId, write: bool) -> Code {
        let mregs = self.ep_regs(tile, ep);
        let m = match unpack_mem(&mregs) {
            Some(m) => m,
            None => return Code::NoMep,
        };
        let need = if write {
            weft_common::Perm::W
        } else {
            weft_common::Perm::R
        };
        if !m.perm.contains(need) {
            return Code::NoPerm;
        }

        let off = self.unpriv(tile, UnprivReg::Arg1);
        let size = self.unpriv(tile, UnprivReg::DataSize) as usize;
        let addr = self.unpriv(tile, UnprivReg::DataAddr);
        if off + size as GlobOff > m.size {
            return Code::OutOfBounds;
        }

        let mut buf = vec![0u8; size];
        if write {
            let res = self.bus_read(tile, addr, &mut buf);
            if res != Code::Success {
                return res;
            }
            self.bus_write(m.tile.raw(), m.addr + off, &buf)
        } else {
            let res = self.bus_read(m.tile.raw(), m.addr + off, &mut buf);
            if res != Code::Success {
                return res;
            }
            self.bus_write(tile, addr, &buf)
        }
    }

    fn do_fetch(&mut self, tile: u16, ep: EpId) -> Code {
        let rregs = self.ep_regs(tile, ep);
        let r = match unpack_recv(&rregs) {
            Some(r) => r,
            None => return Code::NoRep,
        };
        let mut result = !0 as Reg;
        if r.unread != 0 {
            let slot = r.unread.trailing_zeros() as usize;
            let mut regs = rregs;
            regs[2] &= !(1 << (32 + slot));
            self.set_ep_regs(tile, ep, &regs);
            result = (slot << r.msg_order) as Reg;
        }
        self.set_reg(tile, unpriv_reg_idx(UnprivReg::Arg1), result);
        Code::Success
    }

    fn do_ack(&mut self, tile: u16, ep: EpId, msg_off: usize) -> Code {
        let rregs = self.ep_regs(tile, ep);
        let r = match unpack_recv(&rregs) {
            Some(r) => r,
            None => return Code::NoRep,
        };
        let slot = msg_off >> r.msg_order;
        if slot >= r.slots() as usize {
            return Code::InvMsgOff;
        }
        self.clear_slot(tile, ep, slot);
        if r.has_replies() {
            // an unanswered message frees its reply slot as well
            self.set_ep_regs(tile, r.reply_eps + slot as EpId, &[0; EP_REGS]);
        }
        Code::Success
    }

    fn clear_slot(&mut self, tile: u16, ep: EpId, slot: usize) {
        let mut regs = self.ep_regs(tile, ep);
        regs[2] &= !(1 << slot);
        regs[2] &= !(1 << (32 + slot));
        self.set_ep_regs(tile, ep, &regs);
    }

    fn deliver(&mut self, dst_tile: u16, dst_ep: EpId, payload: &[u8], d: Delivery) -> Code {
        let rregs = self.ep_regs(dst_tile, dst_ep);
        let r = match unpack_recv(&rregs) {
            Some(r) => r,
            None => return Code::RecvGone,
        };
        if payload.len() + HDR_SIZE > 1 << r.msg_order {
            return Code::RecvOutOfBounds;
        }

        let slots = r.slots();
        let slot = match (0..slots).find(|i| r.occupied & (1 << i) == 0) {
            Some(i) => i as usize,
            None => return Code::RecvNoSpace,
        };
        let slot_off = slot << r.msg_order;

        // set up the reply slot for requests into reply-capable EPs
        let hdr_reply_ep = if d.flags & FLAG_REPLY == 0 && r.has_replies() {
            let rep_slot = r.reply_eps + slot as EpId;
            let mut rep_regs = [0 as Reg; EP_REGS];
            config_reply(
                &mut rep_regs,
                r.act,
                d.reply_lbl,
                TileId::new(d.sender_tile),
                d.reply_to_ep,
                r.msg_order,
                d.sender_ep,
            );
            self.set_ep_regs(dst_tile, rep_slot, &rep_regs);
            rep_slot
        } else {
            NO_REPLIES
        };

        let hdr = Header::new(
            d.flags,
            r.msg_order,
            TileId::new(d.sender_tile),
            d.sender_ep,
            hdr_reply_ep,
            payload.len(),
            d.reply_lbl,
            d.label,
        );

        use zerocopy::IntoBytes;
        let res = self.bus_write(dst_tile, r.buf + slot_off as GlobOff, hdr.as_bytes());
        if res != Code::Success {
            return res;
        }
        let res = self.bus_write(
            dst_tile,
            r.buf + (slot_off + HDR_SIZE) as GlobOff,
            payload,
        );
        if res != Code::Success {
            return res;
        }

        let mut regs = self.ep_regs(dst_tile, dst_ep);
        regs[2] |= 1 << slot;
        regs[2] |= 1 << (32 + slot);
        self.set_ep_regs(dst_tile, dst_ep, &regs);

        log::trace!(
            "fabric: T{:02}:EP{} -> T{:02}:EP{} slot {} ({} bytes)",
            d.sender_tile,
            d.sender_ep,
            dst_tile,
            dst_ep,
            slot,
            payload.len()
        );
        Code::Success
    }

    fn exec_ext_cmd(&mut self, tile: u16, val: Reg) {
        let ep = ((val >> 9) & 0xFFFF) as EpId;
        let force = (val >> 25) & 1 != 0;
        let (err, result) = match val & 0xF {
            x if x == ExtCmdOpCode::InvEp as Reg => self.do_inv_ep(tile, ep, force),
            x if x == ExtCmdOpCode::Reset as Reg => {
                for e in 0..EP_COUNT {
                    self.set_ep_regs(tile, e, &[0; EP_REGS]);
                }
                (Code::Success, 0)
            },
            // the model has no TLB; flushing one is trivially done
            x if x == ExtCmdOpCode::InvPage as Reg => (Code::Success, 0),
            _ => (Code::UnknownCmd, 0),
        };
        self.set_reg(tile, ext_reg_idx(ExtReg::ExtCmd), ext_cmd_done(err, result));
    }

    fn do_inv_ep(&mut self, tile: u16, ep: EpId, force: bool) -> (Code, Reg) {
        if ep >= EP_COUNT {
            return (Code::UnknownCmd, 0);
        }
        let regs = self.ep_regs(tile, ep);
        let mut unread = 0 as Reg;
        match EpType::of(regs[0]) {
            EpType::Send => {
                if let Some(s) = unpack_send(&regs) {
                    if !force && s.cur_credits < s.max_credits {
                        return (Code::NoCredits, 0);
                    }
                }
            },
            EpType::Receive => {
                if let Some(r) = unpack_recv(&regs) {
                    unread = r.unread as Reg;
                }
            },
            _ => {},
        }
        self.set_ep_regs(tile, ep, &[0; EP_REGS]);
        (Code::Success, unread)
    }
}

struct Delivery {
    flags: u64,
    sender_tile: u16,
    sender_ep: EpId,
    reply_to_ep: EpId,
    reply_lbl: Reg,
    label: Reg,
}

/// Register-file handle of one tile within a [`SimFabric`].
#[derive(Clone)]
pub struct SimTcu {
    fabric: Rc<RefCell<SimFabric>>,
    tile: u16,
}

impl TcuRegs for SimTcu {
    fn read_reg(&self, idx: usize) -> Reg {
        self.fabric.borrow().reg(self.tile, idx)
    }

    fn write_reg(&mut self, idx: usize, val: Reg) {
        self.fabric.borrow_mut().reg_write(self.tile, idx, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{RecvBuf, Tcu};
    use crate::header::Message;
    use crate::regs::{config_recv, config_send, ext_cmd_result};
    use alloc::boxed::Box;
    use weft_common::TileKind;

    const TILE_A: TileId = TileId::new(0);
    const TILE_B: TileId = TileId::new(1);

    fn two_tiles() -> (Rc<RefCell<SimFabric>>, Tcu, Tcu) {
        let mut fabric = SimFabric::new();
        fabric.add_tile(TILE_A, TileDesc::new(TileKind::Compute, 0, 0));
        fabric.add_tile(TILE_B, TileDesc::new(TileKind::Compute, 0, 0));
        let fabric = Rc::new(RefCell::new(fabric));
        let a = Tcu::new(Box::new(SimFabric::handle(&fabric, TILE_A)));
        let b = Tcu::new(Box::new(SimFabric::handle(&fabric, TILE_B)));
        (fabric, a, b)
    }

    #[test]
    fn test_ping_pong() {
        let (_fabric, mut a, mut b) = two_tiles();

        // A: receive EP 16 with 4 slots of 64 bytes, reply slots at 20
        let rbuf_a = RecvBuf::new(8);
        let mut regs = [0 as Reg; EP_REGS];
        config_recv(&mut regs, 1, rbuf_a.addr() as GlobOff, 8, 6, Some(20));
        a.set_ep_regs(16, &regs);

        // B: send EP 17 -> A:16 with label 0x1234 and one credit, plus
        // a reply receive EP 18
        config_send(&mut regs, 2, 0x1234, TILE_A, 16, 6, 1);
        b.set_ep_regs(17, &regs);
        let rbuf_b = RecvBuf::new(6);
        config_recv(&mut regs, 2, rbuf_b.addr() as GlobOff, 6, 6, None);
        b.set_ep_regs(18, &regs);

        b.send(17, &[0xDE, 0xAD], 0x77, 18).unwrap();

        let off = a.fetch_msg(16).unwrap();
        // SAFETY: off was just returned by fetch_msg on this buffer
        let msg = unsafe { Message::at_offset(rbuf_a.addr(), off) };
        assert_eq!(msg.header.label(), 0x1234);
        assert_eq!(msg.header.length(), 2);
        assert_eq!(&msg.data, &[0xDE, 0xAD]);
        assert!(!msg.header.is_reply());

        // credit exhaustion until A replies
        assert_eq!(
            b.send(17, &[0x00], 0x77, 18).unwrap_err().code(),
            Code::NoCredits
        );

        a.reply(16, &[0xBE, 0xEF], off).unwrap();

        let off = b.fetch_msg(18).unwrap();
        // SAFETY: as above
        let msg = unsafe { Message::at_offset(rbuf_b.addr(), off) };
        assert!(msg.header.is_reply());
        assert_eq!(msg.header.label(), 0x77);
        assert_eq!(&msg.data, &[0xBE, 0xEF]);
        b.ack_msg(18, off).unwrap();

        // the reply restored B's credit
        assert_eq!(b.credits(17).unwrap(), 1);
        b.send(17, &[0x01], 0x77, 18).unwrap();
    }

    #[test]
    fn test_recv_no_space() {
        let (_fabric, mut a, mut b) = two_tiles();

        let rbuf_a = RecvBuf::new(8);
        let mut regs = [0 as Reg; EP_REGS];
        config_recv(&mut regs, 1, rbuf_a.addr() as GlobOff, 8, 6, None);
        a.set_ep_regs(16, &regs);
        config_send(&mut regs, 2, 1, TILE_A, 16, 6, UNLIM_CREDITS);
        b.set_ep_regs(17, &regs);

        for i in 0..4u8 {
            b.send(17, &[i], 0, NO_REPLIES).unwrap();
        }
        assert_eq!(
            b.send(17, &[4], 0, NO_REPLIES).unwrap_err().code(),
            Code::RecvNoSpace
        );

        // acking one slot makes room again
        let off = a.fetch_msg(16).unwrap();
        a.ack_msg(16, off).unwrap();
        b.send(17, &[5], 0, NO_REPLIES).unwrap();
    }

    #[test]
    fn test_invalidate_ep() {
        let (fabric, mut a, mut b) = two_tiles();

        // B:17 -> A:16 with 2 credits, one spent
        let rbuf_a = RecvBuf::new(8);
        let mut regs = [0 as Reg; EP_REGS];
        config_recv(&mut regs, 1, rbuf_a.addr() as GlobOff, 8, 6, None);
        a.set_ep_regs(16, &regs);
        config_send(&mut regs, 2, 1, TILE_A, 16, 6, 2);
        b.set_ep_regs(17, &regs);
        b.send(17, &[1], 0, NO_REPLIES).unwrap();

        // non-forced invalidation is refused while credits are missing
        {
            let mut f = fabric.borrow_mut();
            f.exec_ext_cmd(TILE_B.raw(), crate::regs::build_ext_cmd(17, ExtCmdOpCode::InvEp, false));
            let res = ext_cmd_result(f.reg(TILE_B.raw(), ext_reg_idx(ExtReg::ExtCmd)));
            assert_eq!(res.unwrap_err().code(), Code::NoCredits);
        }
        assert!(b.is_valid(17));

        // forced invalidation clears the slot
        {
            let mut f = fabric.borrow_mut();
            f.exec_ext_cmd(TILE_B.raw(), crate::regs::build_ext_cmd(17, ExtCmdOpCode::InvEp, true));
            ext_cmd_result(f.reg(TILE_B.raw(), ext_reg_idx(ExtReg::ExtCmd))).unwrap();
        }
        assert!(!b.is_valid(17));

        // non-forced invalidation of the receive EP reports unread mask
        {
            let mut f = fabric.borrow_mut();
            f.exec_ext_cmd(TILE_A.raw(), crate::regs::build_ext_cmd(16, ExtCmdOpCode::InvEp, false));
            let unread = ext_cmd_result(f.reg(TILE_A.raw(), ext_reg_idx(ExtReg::ExtCmd))).unwrap();
            assert_eq!(unread, 0x1);
        }
        assert!(!a.is_valid(16));
    }

    #[test]
    fn test_mem_transfer() {
        let mut fabric = SimFabric::new();
        fabric.add_tile(TILE_A, TileDesc::new(TileKind::Compute, 0, 0));
        let mem_tile = TileId::new(8);
        fabric.add_tile(mem_tile, TileDesc::new(TileKind::Mem, 0, 0x10000));
        let fabric = Rc::new(RefCell::new(fabric));
        let mut a = Tcu::new(Box::new(SimFabric::handle(&fabric, TILE_A)));

        let mut regs = [0 as Reg; EP_REGS];
        crate::regs::config_mem(&mut regs, 1, mem_tile, 0x1000, 0x100, weft_common::Perm::RW);
        a.set_ep_regs(4, &regs);

        a.write(4, &[1, 2, 3, 4], 0x10).unwrap();
        let mut buf = [0u8; 4];
        a.read(4, &mut buf, 0x10).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        assert_eq!(
            a.write(4, &[0], 0x100).unwrap_err().code(),
            Code::OutOfBounds
        );

        // read-only EP refuses writes
        crate::regs::config_mem(&mut regs, 1, mem_tile, 0x1000, 0x100, weft_common::Perm::R);
        a.set_ep_regs(4, &regs);
        assert_eq!(a.write(4, &[0], 0).unwrap_err().code(), Code::NoPerm);
    }
}
