//! The tile-multiplexer proxy
//!
//! One per user tile. It owns the tile's endpoint bitmap, programs the
//! tile's TCU through the kernel's scratch endpoint, and talks to the
//! user-level multiplexer over two channels: sidecalls (kernel ->
//! multiplexer, serialised by a send queue) and kernel calls
//! (multiplexer -> kernel, e.g. the `exit` notification).

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use weft_common::cfg::{RBUF_TMUX_ADDR, TMUX_RBUF_ORD};
use weft_common::TileId;
use weft_syscall::{tmcalls, Code, Error, Result};
use weft_tcu::regs::{
    config_recv, config_send, ActId as RegActId, EpId, EP_COUNT,
};
use zerocopy::{FromBytes, IntoBytes};

use crate::com::{QueueId, SendQueue};
use crate::ktcu::{Ktcu, RecvdMsg, KTMUX_EP};
use crate::objects::{MGateObject, RGateObject, SGateObject, TileObject};
use crate::sched::receive_async;
use crate::tiles::{ActId, VpeState};
use crate::workloop::Kctx;

/// Send EP the tile multiplexer uses for kernel calls.
pub const TMUX_SEP: EpId = 0;
/// Receive EP for the kernel's replies to those calls.
pub const TMUX_REP: EpId = 1;
/// Receive EP for sidecalls from the kernel.
pub const TMSIDE_REP: EpId = 2;
/// Reply slot for sidecalls.
pub const TMSIDE_RPLEP: EpId = 3;
/// The first EP available to user VPEs.
pub const FIRST_USER_EP: EpId = 4;

/// Contiguous-run endpoint bitmap.
struct EpBitmap {
    words: [u64; EP_COUNT as usize / 64],
}

impl EpBitmap {
    fn new() -> Self {
        Self {
            words: [0; EP_COUNT as usize / 64],
        }
    }

    fn is_set(&self, ep: EpId) -> bool {
        self.words[ep as usize / 64] & (1 << (ep as usize % 64)) != 0
    }

    fn set(&mut self, ep: EpId) {
        self.words[ep as usize / 64] |= 1 << (ep as usize % 64);
    }

    fn clear(&mut self, ep: EpId) {
        self.words[ep as usize / 64] &= !(1 << (ep as usize % 64));
    }
}

/// The proxy for one tile's multiplexer.
pub struct TileMux {
    tile_obj: Rc<TileObject>,
    vpes: RefCell<Vec<ActId>>,
    eps: RefCell<EpBitmap>,
    queue: RefCell<SendQueue>,
}

impl TileMux {
    /// Create the proxy for `tile`.
    #[must_use]
    pub fn new(tile: TileId) -> Rc<Self> {
        let tile_obj = TileObject::new(tile, (EP_COUNT - FIRST_USER_EP) as u32, false);

        let mut eps = EpBitmap::new();
        for ep in 0..FIRST_USER_EP {
            eps.set(ep);
        }

        Rc::new(Self {
            tile_obj,
            vpes: RefCell::new(Vec::new()),
            eps: RefCell::new(eps),
            queue: RefCell::new(SendQueue::new(QueueId::tmux(tile), tile)),
        })
    }

    /// Configure the multiplexer's own endpoints on the remote tile.
    pub fn init(&self, ktcu: &mut Ktcu) -> Result<()> {
        let tile = self.tile_id();
        let kernel_tile = ktcu.kernel_tile();

        // kernel-call channel
        ktcu.config_remote_ep(tile, TMUX_SEP, |regs| {
            config_send(
                regs,
                tmcalls::TMUX_VPE_ID as RegActId,
                tile.raw() as u64,
                kernel_tile,
                KTMUX_EP,
                TMUX_RBUF_ORD,
                1,
            );
        })?;
        let mut rbuf = RBUF_TMUX_ADDR;
        ktcu.config_remote_ep(tile, TMUX_REP, |regs| {
            config_recv(
                regs,
                tmcalls::TMUX_VPE_ID as RegActId,
                rbuf,
                TMUX_RBUF_ORD,
                TMUX_RBUF_ORD,
                None,
            );
        })?;
        rbuf += 1 << TMUX_RBUF_ORD;

        // sidecall channel
        ktcu.config_remote_ep(tile, TMSIDE_REP, |regs| {
            config_recv(
                regs,
                tmcalls::TMUX_VPE_ID as RegActId,
                rbuf,
                TMUX_RBUF_ORD,
                TMUX_RBUF_ORD,
                Some(TMSIDE_RPLEP),
            );
        })
    }

    #[must_use]
    pub fn tile_obj(&self) -> &Rc<TileObject> {
        &self.tile_obj
    }

    #[must_use]
    pub fn tile_id(&self) -> TileId {
        self.tile_obj.tile()
    }

    #[must_use]
    pub fn has_vpes(&self) -> bool {
        !self.vpes.borrow().is_empty()
    }

    pub fn add_vpe(&self, vpe: ActId) {
        self.vpes.borrow_mut().push(vpe);
    }

    pub fn rem_vpe(&self, vpe: ActId) {
        self.vpes.borrow_mut().retain(|id| *id != vpe);
    }

    // -- endpoint bitmap

    /// Find a contiguous run of `count` free endpoints.
    pub fn find_eps(&self, count: u32) -> Result<EpId> {
        let eps = self.eps.borrow();
        let mut start = FIRST_USER_EP;
        let mut bit = start;
        while bit < start + count as EpId && bit < EP_COUNT {
            if eps.is_set(bit) {
                start = bit + 1;
            }
            bit += 1;
        }
        if bit != start + count as EpId {
            Err(Error::new(Code::NoSpace))
        } else {
            Ok(start)
        }
    }

    /// Check whether `[start, start + count)` are all free.
    #[must_use]
    pub fn eps_free(&self, start: EpId, count: u32) -> bool {
        let eps = self.eps.borrow();
        (start..start + count as EpId).all(|ep| ep < EP_COUNT && !eps.is_set(ep))
    }

    /// Mark `[start, start + count)` allocated.
    pub fn alloc_eps(&self, start: EpId, count: u32) {
        log::trace!(
            "tmux[{}]: allocating EPs {}..{}",
            self.tile_id(),
            start,
            start + count as EpId - 1
        );
        let mut eps = self.eps.borrow_mut();
        for ep in start..start + count as EpId {
            debug_assert!(!eps.is_set(ep));
            eps.set(ep);
        }
    }

    /// Mark `[start, start + count)` free again.
    pub fn free_eps(&self, start: EpId, count: u32) {
        log::trace!(
            "tmux[{}]: freeing EPs {}..{}",
            self.tile_id(),
            start,
            start + count as EpId - 1
        );
        let mut eps = self.eps.borrow_mut();
        for ep in start..start + count as EpId {
            debug_assert!(eps.is_set(ep));
            eps.clear(ep);
        }
    }

    // -- remote endpoint configuration

    /// Configure a send EP for `sgate` on this tile.
    pub fn config_snd_ep(
        &self,
        ctx: &Kctx,
        ep: EpId,
        act: ActId,
        sgate: &Rc<SGateObject>,
    ) -> Result<()> {
        let rgate = sgate.rgate();
        let (rtile, rep) = rgate.location().ok_or(Error::new(Code::InvArgs))?;
        log::trace!("{}:EP{} = {:?}", self.tile_id(), ep, sgate);

        ctx.ktcu.borrow_mut().config_remote_ep(self.tile_id(), ep, |regs| {
            config_send(
                regs,
                act,
                sgate.label(),
                rtile,
                rep,
                rgate.msg_order(),
                sgate.credits(),
            );
        })
    }

    /// Configure a receive EP for `rgate` on this tile and wake anyone
    /// waiting for the activation.
    pub fn config_rcv_ep(
        &self,
        ctx: &Kctx,
        ep: EpId,
        act: ActId,
        reply_eps: Option<EpId>,
        rgate: &Rc<RGateObject>,
    ) -> Result<()> {
        log::trace!("{}:EP{} = {:?}", self.tile_id(), ep, rgate);

        ctx.ktcu.borrow_mut().config_remote_ep(self.tile_id(), ep, |regs| {
            config_recv(
                regs,
                act,
                rgate.addr(),
                rgate.order(),
                rgate.msg_order(),
                reply_eps,
            );
        })?;

        ctx.sched.notify(rgate.event(), None);
        Ok(())
    }

    /// Configure a memory EP for `mgate` on this tile.
    pub fn config_mem_ep(
        &self,
        ctx: &Kctx,
        ep: EpId,
        act: ActId,
        mgate: &Rc<MGateObject>,
    ) -> Result<()> {
        log::trace!("{}:EP{} = {:?}", self.tile_id(), ep, mgate);

        let addr = mgate.addr();
        ctx.ktcu.borrow_mut().config_remote_ep(self.tile_id(), ep, |regs| {
            weft_tcu::regs::config_mem(
                regs,
                act,
                addr.tile(),
                addr.offset(),
                mgate.size() as usize,
                mgate.perms(),
            );
        })
    }

    /// Invalidate an endpoint of this tile. With `notify`, unread
    /// messages are reported to the multiplexer as a sidecall.
    pub fn invalidate_ep(
        &self,
        ctx: &Kctx,
        act: ActId,
        ep: EpId,
        force: bool,
        notify: bool,
    ) -> Result<()> {
        log::trace!("{}:EP{} = invalid", self.tile_id(), ep);

        let unread = ctx
            .ktcu
            .borrow_mut()
            .invalidate_ep_remote(self.tile_id(), ep, force)?;
        if unread != 0 && notify {
            let msg = tmcalls::RemMsgs {
                op: tmcalls::Sidecall::RemMsgs as u64,
                vpe: act as u64,
                unread_mask: unread as u64,
            };
            self.send_sidecall(ctx, Some(act), msg.as_bytes()).map(|_| ())
        } else {
            Ok(())
        }
    }

    /// Poison the reply slots at the receiver that belong to a send EP
    /// of this tile.
    pub fn invalidate_reply_eps(
        &self,
        ctx: &Kctx,
        recv_tile: TileId,
        recv_ep: EpId,
        send_ep: EpId,
    ) -> Result<()> {
        log::trace!(
            "{}:EP{} = invalid reply EPs at {}:EP{}",
            self.tile_id(),
            send_ep,
            recv_tile,
            recv_ep
        );
        ctx.ktcu
            .borrow_mut()
            .inv_reply_remote(recv_tile, recv_ep, self.tile_id(), send_ep)
    }

    /// Tell the multiplexer that an endpoint was invalidated behind a
    /// VPE's back (fire and forget).
    pub fn notify_invalidate(&self, ctx: &Kctx, act: ActId, ep: EpId) -> Result<()> {
        let msg = tmcalls::EpInval {
            op: tmcalls::Sidecall::EpInval as u64,
            vpe: act as u64,
            ep: ep as u64,
        };
        self.send_sidecall(ctx, Some(act), msg.as_bytes()).map(|_| ())
    }

    fn send_sidecall(
        &self,
        ctx: &Kctx,
        act: Option<ActId>,
        msg: &[u8],
    ) -> Result<crate::sched::Event> {
        // if the VPE is already gone, don't bother the multiplexer
        if let Some(id) = act {
            let alive = ctx
                .vpes
                .borrow()
                .vpe(id)
                .map(|v| v.state() != VpeState::Dead)
                .unwrap_or(false);
            if !alive {
                return Err(Error::new(Code::VpeGone));
            }
        }

        self.queue.borrow_mut().send(ctx, TMSIDE_REP, 0, 0, msg)
    }

    async fn call_sidecall(ctx: &Rc<Kctx>, mux: &Rc<TileMux>, act: Option<ActId>, msg: &[u8]) -> Result<u64> {
        let event = mux.send_sidecall(ctx, act, msg)?;
        let reply = receive_async(&ctx.sched, event).await?;
        let resp = tmcalls::Response::read_from_prefix(&reply)
            .map(|(r, _)| r)
            .map_err(|_| Error::new(Code::InvArgs))?;
        match Code::from_raw(resp.error as u32) {
            Code::Success => Ok(resp.val),
            e => Err(Error::new(e)),
        }
    }

    /// Announce a new VPE to the multiplexer and wait for the ack.
    pub async fn vpe_init_async(
        ctx: &Rc<Kctx>,
        mux: &Rc<TileMux>,
        act: ActId,
        eps_start: EpId,
    ) -> Result<()> {
        let msg = tmcalls::VpeInit {
            op: tmcalls::Sidecall::VpeInit as u64,
            vpe: act as u64,
            eps_start: eps_start as u64,
        };
        Self::call_sidecall(ctx, mux, Some(act), msg.as_bytes()).await.map(|_| ())
    }

    /// Start or stop a VPE, waiting for the multiplexer's ack.
    pub async fn vpe_ctrl_async(
        ctx: &Rc<Kctx>,
        mux: &Rc<TileMux>,
        act: ActId,
        op: tmcalls::TmuxVpeOp,
    ) -> Result<()> {
        let msg = tmcalls::VpeCtrl {
            op: tmcalls::Sidecall::VpeCtrl as u64,
            vpe: act as u64,
            vpe_op: op as u64,
        };
        Self::call_sidecall(ctx, mux, Some(act), msg.as_bytes()).await.map(|_| ())
    }

    /// Post a VPE-control sidecall without waiting for the reply (used
    /// on the teardown path, where nobody could act on an error).
    pub fn vpe_ctrl_post(&self, ctx: &Kctx, act: ActId, op: tmcalls::TmuxVpeOp) {
        let msg = tmcalls::VpeCtrl {
            op: tmcalls::Sidecall::VpeCtrl as u64,
            vpe: act as u64,
            vpe_op: op as u64,
        };
        self.queue
            .borrow_mut()
            .send(ctx, TMSIDE_REP, 0, 0, msg.as_bytes())
            .ok();
    }

    /// Translate a virtual address of `act` into a global address.
    pub async fn translate_async(
        ctx: &Rc<Kctx>,
        mux: &Rc<TileMux>,
        act: ActId,
        virt: u64,
        perm: weft_common::Perm,
    ) -> Result<weft_common::GlobAddr> {
        let msg = tmcalls::Translate {
            op: tmcalls::Sidecall::Translate as u64,
            vpe: act as u64,
            virt,
            perm: perm.bits() as u64,
        };
        Self::call_sidecall(ctx, mux, Some(act), msg.as_bytes())
            .await
            .map(|val| weft_common::GlobAddr::new(val & !(weft_common::cfg::PAGE_MASK as u64)))
    }

    /// The sidecall queue (for reply routing).
    #[must_use]
    pub fn queue(&self) -> &RefCell<SendQueue> {
        &self.queue
    }

    /// Handle a kernel call from this tile's multiplexer.
    pub async fn handle_call_async(ctx: Rc<Kctx>, msg: RecvdMsg) {
        let res = Self::handle_call(&ctx, &msg).await;
        let reply = weft_syscall::ops::DefaultReply {
            error: Code::from(res) as u64,
        };
        ctx.ktcu
            .borrow_mut()
            .reply_obj(KTMUX_EP, msg.off, &reply)
            .ok();
    }

    async fn handle_call(ctx: &Rc<Kctx>, msg: &RecvdMsg) -> Result<()> {
        let opcode = msg.opcode();
        match tmcalls::TmuxCall::from_raw(opcode) {
            Some(tmcalls::TmuxCall::Exit) => {
                let req: tmcalls::Exit = msg.get()?;
                log::debug!(
                    "tmux[{}]: exit(vpe={}, code={})",
                    msg.label,
                    req.vpe,
                    req.code
                );
                let vpe = ctx.vpes.borrow().vpe(req.vpe as ActId);
                if let Some(vpe) = vpe {
                    crate::tiles::stop_vpe_async(ctx, vpe, req.code as i32, true).await;
                }
                Ok(())
            },
            None => Err(Error::new(Code::InvArgs)),
        }
    }
}
