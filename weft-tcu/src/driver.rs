//! The TCU driver
//!
//! A thin, typed wrapper over the register file. Every operation maps
//! to a few register writes; completion is observed by spin-polling the
//! command register until its opcode returns to IDLE. Register writes
//! are separated from the command write by a fence, because the TCU
//! reads the data registers asynchronously.

use alloc::boxed::Box;
use core::sync::atomic::{fence, Ordering};

use weft_syscall::{Code, Error, Result};

use crate::header::Message;
use crate::regs::{
    build_cmd, cmd_error, unpack_recv, unpack_send, CmdOpCode, EpId, EpType, Label, Reg,
    UnprivReg, EP_REGS, ep_regs_idx, unpriv_reg_idx,
};

/// A local receive-buffer allocation.
///
/// Word-backed so that message slots (and thus headers) are properly
/// aligned for [`Message`] views.
pub struct RecvBuf {
    words: alloc::boxed::Box<[u64]>,
}

impl RecvBuf {
    /// Allocate a zeroed receive buffer of `1 << order` bytes.
    #[must_use]
    pub fn new(order: u32) -> Self {
        Self {
            words: alloc::vec![0u64; (1usize << order) / 8].into_boxed_slice(),
        }
    }

    /// The buffer's address, as configured into a receive EP.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// The buffer size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.words.len() * 8
    }
}

/// Access to one TCU register file.
///
/// Implemented by the MMIO backend on hardware and by the software
/// fabric for hosted tests. Indices are register-file indices (see
/// [`crate::regs`]).
pub trait TcuRegs {
    /// Read one register.
    fn read_reg(&self, idx: usize) -> Reg;
    /// Write one register. Writing the command register starts a
    /// command.
    fn write_reg(&mut self, idx: usize, val: Reg);
}

/// The local TCU, driven through its register file.
pub struct Tcu {
    regs: Box<dyn TcuRegs>,
}

impl Tcu {
    /// Create a driver over the given register file.
    #[must_use]
    pub fn new(regs: Box<dyn TcuRegs>) -> Self {
        Self { regs }
    }

    fn read_unpriv(&self, reg: UnprivReg) -> Reg {
        self.regs.read_reg(unpriv_reg_idx(reg))
    }

    fn write_unpriv(&mut self, reg: UnprivReg, val: Reg) {
        self.regs.write_reg(unpriv_reg_idx(reg), val);
    }

    fn write_data(&mut self, addr: usize, size: usize) {
        self.write_unpriv(UnprivReg::DataAddr, addr as Reg);
        self.write_unpriv(UnprivReg::DataSize, size as Reg);
    }

    /// Wait until the current command completed and return its error.
    fn get_error(&self) -> Result<()> {
        loop {
            let cmd = self.read_unpriv(UnprivReg::Command);
            if CmdOpCode::of(cmd) == CmdOpCode::Idle {
                return Result::from(cmd_error(cmd));
            }
        }
    }

    /// Configure the endpoint `ep` with the given register tuple.
    pub fn set_ep_regs(&mut self, ep: EpId, regs: &[Reg; EP_REGS]) {
        let base = ep_regs_idx(ep);
        for (i, r) in regs.iter().enumerate() {
            self.regs.write_reg(base + i, *r);
        }
    }

    /// Read the register tuple of endpoint `ep`.
    #[must_use]
    pub fn ep_regs(&self, ep: EpId) -> [Reg; EP_REGS] {
        let base = ep_regs_idx(ep);
        [
            self.regs.read_reg(base),
            self.regs.read_reg(base + 1),
            self.regs.read_reg(base + 2),
        ]
    }

    /// Check whether `ep` is configured (not INVALID).
    #[must_use]
    pub fn is_valid(&self, ep: EpId) -> bool {
        EpType::of(self.regs.read_reg(ep_regs_idx(ep))) != EpType::Invalid
    }

    /// Return the current credits of send EP `ep`.
    pub fn credits(&self, ep: EpId) -> Result<u32> {
        let regs = self.ep_regs(ep);
        let s = unpack_send(&regs).ok_or(Error::new(Code::NoSep))?;
        Ok(s.cur_credits)
    }

    /// Check whether send EP `ep` has missing credits.
    #[must_use]
    pub fn has_missing_credits(&self, ep: EpId) -> bool {
        let regs = self.ep_regs(ep);
        match unpack_send(&regs) {
            Some(s) => s.cur_credits < s.max_credits,
            None => false,
        }
    }

    /// Check whether receive EP `ep` has unread messages.
    #[must_use]
    pub fn has_msgs(&self, ep: EpId) -> bool {
        let regs = self.ep_regs(ep);
        matches!(unpack_recv(&regs), Some(r) if r.unread != 0)
    }

    /// Send `msg` via endpoint `ep`.
    ///
    /// The reply will be delivered to `reply_ep` with label `reply_lbl`.
    pub fn send(
        &mut self,
        ep: EpId,
        msg: &[u8],
        reply_lbl: Label,
        reply_ep: EpId,
    ) -> Result<()> {
        self.write_data(msg.as_ptr() as usize, msg.len());
        self.write_unpriv(UnprivReg::Arg1, reply_lbl);
        fence(Ordering::SeqCst);
        self.write_unpriv(
            UnprivReg::Command,
            build_cmd(ep, CmdOpCode::Send, reply_ep as Reg),
        );
        self.get_error()
    }

    /// Send `reply` as a reply to the message at `msg_off` in the
    /// receive buffer of `ep`. This also acknowledges the message.
    pub fn reply(&mut self, ep: EpId, reply: &[u8], msg_off: usize) -> Result<()> {
        self.write_data(reply.as_ptr() as usize, reply.len());
        fence(Ordering::SeqCst);
        self.write_unpriv(
            UnprivReg::Command,
            build_cmd(ep, CmdOpCode::Reply, msg_off as Reg),
        );
        self.get_error()
    }

    /// Read from offset `off` of the memory region behind `ep`.
    pub fn read(&mut self, ep: EpId, data: &mut [u8], off: u64) -> Result<()> {
        self.write_data(data.as_mut_ptr() as usize, data.len());
        self.write_unpriv(UnprivReg::Arg1, off);
        fence(Ordering::SeqCst);
        self.write_unpriv(UnprivReg::Command, build_cmd(ep, CmdOpCode::Read, 0));
        let res = self.get_error();
        // the CPU must not read the buffer before the TCU is done
        fence(Ordering::SeqCst);
        res
    }

    /// Write to offset `off` of the memory region behind `ep`.
    pub fn write(&mut self, ep: EpId, data: &[u8], off: u64) -> Result<()> {
        self.write_data(data.as_ptr() as usize, data.len());
        self.write_unpriv(UnprivReg::Arg1, off);
        // the TCU must not read the buffer before the CPU has written it
        fence(Ordering::SeqCst);
        self.write_unpriv(UnprivReg::Command, build_cmd(ep, CmdOpCode::Write, 0));
        self.get_error()
    }

    /// Try to fetch a new message from receive EP `ep`, returning its
    /// offset within the receive buffer.
    pub fn fetch_msg(&mut self, ep: EpId) -> Option<usize> {
        self.write_unpriv(UnprivReg::Command, build_cmd(ep, CmdOpCode::FetchMsg, 0));
        self.get_error().ok()?;
        let off = self.read_unpriv(UnprivReg::Arg1);
        if off != !0 {
            Some(off as usize)
        } else {
            None
        }
    }

    /// Mark the message at `msg_off` in receive EP `ep` as read and
    /// free its slot.
    pub fn ack_msg(&mut self, ep: EpId, msg_off: usize) -> Result<()> {
        // make sure we are done with the message before acking it
        fence(Ordering::SeqCst);
        self.write_unpriv(
            UnprivReg::Command,
            build_cmd(ep, CmdOpCode::AckMsg, msg_off as Reg),
        );
        self.get_error()
    }

    /// Put the CU to sleep until a message arrives.
    pub fn sleep(&mut self) -> Result<()> {
        self.write_unpriv(UnprivReg::Command, build_cmd(0, CmdOpCode::Sleep, 0));
        self.get_error()
    }

    /// View the message at `off` in the receive buffer based at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the configured buffer of a local receive EP and
    /// `off` an offset previously returned by [`Tcu::fetch_msg`].
    #[must_use]
    pub unsafe fn offset_to_msg(base: usize, off: usize) -> &'static Message {
        // SAFETY: forwarded to the caller
        unsafe { Message::at_offset(base, off) }
    }
}
