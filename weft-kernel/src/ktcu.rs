//! Kernel-side TCU helpers
//!
//! The kernel owns the first few endpoints of its own TCU: two syscall
//! receive EPs (VPEs are spread across them by id parity), the
//! service-reply EP, the tile-multiplexer call EP, and one scratch EP
//! that is reconfigured for every kernel-initiated transfer. Remote
//! TCUs are programmed by writing their register files through a
//! memory endpoint on the scratch EP.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use weft_common::{GlobOff, Perm, TileId};
use weft_syscall::{Code, Error, Result};
use weft_tcu::regs::{
    build_ext_cmd, build_inv_page, config_mem, config_recv, config_send, ep_regs_addr,
    ext_cmd_result, ext_reg_addr, unpack_recv, unpack_send, ActId, EpId, ExtCmdOpCode, ExtReg,
    Label, Reg, EP_COUNT, EP_REGS, UNLIM_CREDITS,
};
use weft_tcu::{Message, RecvBuf, Tcu};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// First syscall receive EP.
pub const KSYS_EP0: EpId = 0;
/// Second syscall receive EP.
pub const KSYS_EP1: EpId = 1;
/// Service-reply receive EP.
pub const KSRV_EP: EpId = 2;
/// Tile-multiplexer call receive EP.
pub const KTMUX_EP: EpId = 3;
/// Scratch EP for kernel-initiated transfers.
pub const KTMP_EP: EpId = 4;

/// First EP used for the kernel's reply slots.
const FIRST_REPLY_EP: EpId = 8;

/// The activity id the kernel runs under.
pub const KERNEL_ACT: ActId = 0xFFFF;

/// Message order used for kernel-sent messages.
const KSND_ORD: u32 = 8;

/// A message copied out of a kernel receive buffer.
///
/// The buffer slot stays occupied until the message is replied to or
/// acknowledged, so replies keep their correlation.
pub struct RecvdMsg {
    /// The receive EP the message arrived on.
    pub ep: EpId,
    /// Offset of the slot within the receive buffer.
    pub off: usize,
    /// The label assigned to the sender.
    pub label: Label,
    /// The payload.
    pub data: Vec<u8>,
}

impl RecvdMsg {
    /// Decode the start of the payload as a wire struct.
    pub fn get<R: FromBytes>(&self) -> Result<R> {
        R::read_from_prefix(&self.data)
            .map(|(r, _)| r)
            .map_err(|_| Error::new(Code::InvArgs))
    }

    /// The opcode word of the payload.
    #[must_use]
    pub fn opcode(&self) -> u64 {
        let mut w = [0u8; 8];
        if self.data.len() >= 8 {
            w.copy_from_slice(&self.data[..8]);
        }
        u64::from_le_bytes(w)
    }
}

/// The kernel's TCU state.
pub struct Ktcu {
    tcu: Tcu,
    kernel_tile: TileId,
    rbufs: BTreeMap<EpId, RecvBuf>,
    next_rep: EpId,
}

impl Ktcu {
    /// Wrap the local TCU.
    #[must_use]
    pub fn new(tcu: Tcu, kernel_tile: TileId) -> Self {
        Self {
            tcu,
            kernel_tile,
            rbufs: BTreeMap::new(),
            next_rep: FIRST_REPLY_EP,
        }
    }

    /// The tile the kernel runs on.
    #[inline]
    #[must_use]
    pub fn kernel_tile(&self) -> TileId {
        self.kernel_tile
    }

    /// Configure receive EP `ep` with a fresh buffer of `1 << ord`
    /// bytes and `1 << msg_ord` sized slots. With `with_replies`, a
    /// contiguous run of reply EPs is reserved behind [`FIRST_REPLY_EP`].
    pub fn recv_msgs(&mut self, ep: EpId, ord: u32, msg_ord: u32, with_replies: bool) -> Result<()> {
        let slots = 1u16 << (ord - msg_ord);
        let reply_eps = if with_replies {
            if self.next_rep + slots > EP_COUNT {
                return Err(Error::new(Code::NoSpace));
            }
            let base = self.next_rep;
            self.next_rep += slots;
            Some(base)
        } else {
            None
        };

        let rbuf = RecvBuf::new(ord);
        let mut regs = [0 as Reg; EP_REGS];
        config_recv(&mut regs, KERNEL_ACT, rbuf.addr() as GlobOff, ord, msg_ord, reply_eps);
        self.tcu.set_ep_regs(ep, &regs);
        self.rbufs.insert(ep, rbuf);
        Ok(())
    }

    /// Try to fetch a message from `ep`.
    pub fn fetch_msg(&mut self, ep: EpId) -> Option<RecvdMsg> {
        let off = self.tcu.fetch_msg(ep)?;
        let base = self.rbufs[&ep].addr();
        // SAFETY: off was just returned by fetch_msg for this buffer
        let msg = unsafe { Message::at_offset(base, off) };
        Some(RecvdMsg {
            ep,
            off,
            label: msg.header.label(),
            data: msg.data.to_vec(),
        })
    }

    /// Acknowledge the message at `off` without replying.
    pub fn ack_msg(&mut self, ep: EpId, off: usize) {
        self.tcu.ack_msg(ep, off).ok();
    }

    /// Reply raw bytes to the message at `off` of `ep`.
    pub fn reply(&mut self, ep: EpId, off: usize, reply: &[u8]) -> Result<()> {
        let res = self.tcu.reply(ep, reply, off);
        if res.is_err() {
            // replying failed (e.g. the caller is gone); free the slot
            self.tcu.ack_msg(ep, off).ok();
        }
        res
    }

    /// Reply a wire struct to the message at `off` of `ep`.
    pub fn reply_obj<T: IntoBytes + Immutable>(&mut self, ep: EpId, off: usize, rep: &T) -> Result<()> {
        self.reply(ep, off, rep.as_bytes())
    }

    /// Send `msg` to the receive EP `ep` at `tile`, with the given
    /// label; the reply will arrive at `rpl_ep` carrying `rpl_lbl`.
    pub fn send_to(
        &mut self,
        tile: TileId,
        ep: EpId,
        lbl: Label,
        msg: &[u8],
        rpl_lbl: Label,
        rpl_ep: EpId,
    ) -> Result<()> {
        assert!(msg.len() + core::mem::size_of::<weft_tcu::Header>() <= 1 << KSND_ORD);
        let mut regs = [0 as Reg; EP_REGS];
        config_send(&mut regs, KERNEL_ACT, lbl, tile, ep, KSND_ORD, UNLIM_CREDITS);
        self.tcu.set_ep_regs(KTMP_EP, &regs);
        log::trace!("ktcu: sending {} bytes to {:?}:{}", msg.len(), tile, ep);
        self.tcu.send(KTMP_EP, msg, rpl_lbl, rpl_ep)
    }

    /// Read raw memory of another tile.
    pub fn try_read_mem(&mut self, tile: TileId, addr: GlobOff, data: &mut [u8]) -> Result<()> {
        let mut regs = [0 as Reg; EP_REGS];
        config_mem(&mut regs, KERNEL_ACT, tile, addr, data.len(), Perm::R);
        self.tcu.set_ep_regs(KTMP_EP, &regs);
        self.tcu.read(KTMP_EP, data, 0)
    }

    /// Write raw memory of another tile.
    pub fn try_write_mem(&mut self, tile: TileId, addr: GlobOff, data: &[u8]) -> Result<()> {
        let mut regs = [0 as Reg; EP_REGS];
        config_mem(&mut regs, KERNEL_ACT, tile, addr, data.len(), Perm::W);
        self.tcu.set_ep_regs(KTMP_EP, &regs);
        self.tcu.write(KTMP_EP, data, 0)
    }

    /// Read a wire struct from another tile's memory.
    pub fn read_obj<T: FromBytes + IntoBytes>(&mut self, tile: TileId, addr: GlobOff) -> Result<T> {
        let mut obj = T::new_zeroed();
        self.try_read_mem(tile, addr, obj.as_mut_bytes())?;
        Ok(obj)
    }

    /// Read a slice of registers from another tile's memory.
    pub fn try_read_regs(&mut self, tile: TileId, addr: GlobOff, regs: &mut [Reg]) -> Result<()> {
        let mut buf = vec![0u8; regs.len() * 8];
        self.try_read_mem(tile, addr, &mut buf)?;
        for (i, r) in regs.iter_mut().enumerate() {
            let mut w = [0u8; 8];
            w.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            *r = Reg::from_le_bytes(w);
        }
        Ok(())
    }

    /// Write a slice of registers into another tile's memory.
    pub fn try_write_regs(&mut self, tile: TileId, addr: GlobOff, regs: &[Reg]) -> Result<()> {
        let mut buf = vec![0u8; regs.len() * 8];
        for (i, r) in regs.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&r.to_le_bytes());
        }
        self.try_write_mem(tile, addr, &buf)
    }

    /// Zero `size` bytes at `addr` on `tile`.
    pub fn clear(&mut self, tile: TileId, mut addr: GlobOff, size: usize) -> Result<()> {
        let zeros = [0u8; 512];
        let mut rem = size;
        while rem > 0 {
            let amount = rem.min(zeros.len());
            self.try_write_mem(tile, addr, &zeros[..amount])?;
            addr += amount as GlobOff;
            rem -= amount;
        }
        Ok(())
    }

    /// Configure an endpoint of a remote tile.
    pub fn config_remote_ep<CFG>(&mut self, tile: TileId, ep: EpId, cfg: CFG) -> Result<()>
    where
        CFG: FnOnce(&mut [Reg; EP_REGS]),
    {
        let mut regs = [0 as Reg; EP_REGS];
        cfg(&mut regs);
        self.try_write_regs(tile, ep_regs_addr(ep), &regs)
    }

    /// Issue an external command on a remote tile and poll its result.
    fn do_ext_cmd(&mut self, tile: TileId, cmd: Reg) -> Result<Reg> {
        let addr = ext_reg_addr(ExtReg::ExtCmd);
        self.try_write_regs(tile, addr, &[cmd])?;

        loop {
            let mut regs = [0 as Reg; 1];
            self.try_read_regs(tile, addr, &mut regs)?;
            if regs[0] & 0xF == ExtCmdOpCode::Idle as Reg {
                return ext_cmd_result(regs[0]);
            }
        }
    }

    /// Invalidate endpoint `ep` of `tile`; returns the unread mask of
    /// receive EPs. Non-forced invalidation of a send EP with missing
    /// credits is refused by the TCU.
    pub fn invalidate_ep_remote(&mut self, tile: TileId, ep: EpId, force: bool) -> Result<u32> {
        self.do_ext_cmd(tile, build_ext_cmd(ep, ExtCmdOpCode::InvEp, force))
            .map(|unread| unread as u32)
    }

    /// Flush the TLB entry for `virt` of activity `act` on `tile`.
    pub fn invalidate_tlb_page(&mut self, tile: TileId, act: ActId, virt: u64) -> Result<()> {
        self.do_ext_cmd(tile, build_inv_page(act, virt)).map(|_| ())
    }

    /// Poison the reply slots at `recv_tile`:`recv_ep` that would
    /// reply to `send_tile`:`send_ep` (used when a send gate is
    /// revoked).
    pub fn inv_reply_remote(
        &mut self,
        recv_tile: TileId,
        recv_ep: EpId,
        send_tile: TileId,
        send_ep: EpId,
    ) -> Result<()> {
        let mut regs = [0 as Reg; EP_REGS];
        self.try_read_regs(recv_tile, ep_regs_addr(recv_ep), &mut regs)?;

        let r = match unpack_recv(&regs) {
            Some(r) => r,
            None => return Ok(()),
        };
        // no occupied slot, no reply EP to invalidate
        if r.occupied == 0 {
            return Ok(());
        }

        for i in 0..r.slots() as u16 {
            if r.occupied & (1 << i) == 0 {
                continue;
            }
            let rep = r.reply_eps + i;
            self.try_read_regs(recv_tile, ep_regs_addr(rep), &mut regs)?;
            if let Some(s) = unpack_send(&regs) {
                if s.crd_ep == send_ep && s.dst_tile == send_tile {
                    self.invalidate_ep_remote(recv_tile, rep, true)?;
                }
            }
        }
        Ok(())
    }

    /// Drop all unread messages on local receive EP `ep` carrying
    /// `label` (a dying VPE's pending syscalls).
    pub fn drop_msgs(&mut self, ep: EpId, label: Label) {
        let regs = self.tcu.ep_regs(ep);
        let r = match unpack_recv(&regs) {
            Some(r) => r,
            None => return,
        };
        if r.unread == 0 {
            return;
        }
        let base = self.rbufs[&ep].addr();
        for i in 0..r.slots() as usize {
            if r.unread & (1 << i) != 0 {
                let off = i << r.msg_order;
                // SAFETY: the slot is marked unread by the local TCU
                let msg = unsafe { Message::at_offset(base, off) };
                if msg.header.label() == label {
                    self.tcu.ack_msg(ep, off).ok();
                }
            }
        }
    }

    /// Put the CU to sleep until a message arrives.
    pub fn sleep(&mut self) {
        self.tcu.sleep().ok();
    }
}
