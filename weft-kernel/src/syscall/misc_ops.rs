//! Endpoint, quota, session, and VPE-control syscalls

use alloc::rc::Rc;

use weft_cap::SelRange;
use weft_syscall::ops::{self, SemOp, VpeOp};
use weft_syscall::{CapSel, Code, Error, Result, INVALID_SEL, SEL_VPE};
use weft_tcu::regs::{EpId, EP_COUNT};

use crate::caps;
use crate::ktcu::RecvdMsg;
use crate::objects::{EpObject, GateObject, KObject, SemObject};
use crate::syscall::{as_obj, get_node, get_obj, reply_success, send_reply, sysc_err, sysc_log};
use crate::tiles::{self, Vpe, FIRST_USER_EP};
use crate::workloop::Kctx;

pub fn alloc_ep(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::AllocEp = msg.get()?;
    let dst = req.dst as CapSel;
    let vpe_sel = req.vpe as CapSel;
    let epid = req.epid as EpId;
    let replies = req.replies as u32;

    sysc_log!(
        vpe,
        "alloc_ep(dst={}, vpe={}, epid={}, replies={})",
        dst,
        vpe_sel,
        epid,
        replies
    );

    if !ctx.caps.borrow().unused(vpe.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }
    if replies >= EP_COUNT as u32 {
        sysc_err!(vpe, Code::InvArgs, "invalid reply count ({})", replies);
    }

    let ep_count = 1 + replies;
    let vpe_node = get_node(ctx, vpe.obj_space(), vpe_sel)?;
    let dst_vpe = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), vpe_sel)?, Vpe);
    let dst_vpe = dst_vpe.upgrade().ok_or(Error::new(Code::VpeGone))?;
    if !dst_vpe.tile_obj().has_quota(ep_count) {
        sysc_err!(
            vpe,
            Code::NoSpace,
            "tile cap has insufficient EPs (have {}, need {})",
            dst_vpe.tile_obj().eps(),
            ep_count
        );
    }

    let mux = ctx.tiles.tilemux(dst_vpe.tile_id());
    let epid = if epid == EP_COUNT {
        mux.find_eps(ep_count)?
    } else {
        if epid < FIRST_USER_EP || epid as u32 + ep_count > EP_COUNT as u32 {
            sysc_err!(vpe, Code::InvArgs, "invalid endpoint id {}:{}", epid, ep_count);
        }
        if !mux.eps_free(epid, ep_count) {
            sysc_err!(vpe, Code::InvArgs, "endpoints {}..+{} not free", epid, ep_count);
        }
        epid
    };

    let ep = EpObject::new(false, Rc::downgrade(&dst_vpe), epid, replies, dst_vpe.tile_obj());
    caps::insert_cap_at(
        ctx,
        vpe,
        vpe.obj_space(),
        SelRange::new(dst),
        KObject::Ep(ep),
        vpe_node,
    )?;

    dst_vpe.tile_obj().alloc(ep_count);
    mux.alloc_eps(epid, ep_count);

    send_reply(ctx, msg, &ops::AllocEpReply {
        error: 0,
        ep: epid as u64,
    });
    Ok(())
}

pub async fn activate_async(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::Activate = msg.get()?;
    let ep_sel = req.ep as CapSel;
    let gate_sel = req.gate as CapSel;
    let rbuf_mem = req.rbuf_mem as CapSel;
    let rbuf_off = req.rbuf_off;

    sysc_log!(
        vpe,
        "activate(ep={}, gate={}, rbuf_mem={}, rbuf_off={:#x})",
        ep_sel,
        gate_sel,
        rbuf_mem,
        rbuf_off
    );

    let ep = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), ep_sel)?, Ep);
    let ep_vpe = ep.vpe().ok_or(Error::new(Code::VpeGone))?;
    let epid = ep.ep();
    let dst_tile = ep.tile_id();
    let mux = ctx.tiles.tilemux(dst_tile);

    // detach whatever was installed before; a send gate with missing
    // credits refuses the non-forced invalidation
    if let Some(gate) = ep.take_gate() {
        match &gate {
            GateObject::RGate(_) | GateObject::SGate(_) => {
                mux.invalidate_ep(ctx, ep_vpe.id(), epid, false, false)?;
            },
            GateObject::MGate(_) => {},
        }
        if let GateObject::RGate(r) = &gate {
            r.deactivate();
        }
        gate.remove_ep();
    }

    if gate_sel == INVALID_SEL {
        // plain deactivation
        mux.invalidate_ep(ctx, ep_vpe.id(), epid, false, false).ok();
        reply_success(ctx, msg);
        return Ok(());
    }

    let kobj = get_obj(ctx, vpe.obj_space(), gate_sel)?;
    match &kobj {
        KObject::MGate(_) | KObject::SGate(_) => {
            if ep.replies() != 0 {
                sysc_err!(vpe, Code::InvArgs, "only rgates use EP caps with reply slots");
            }
            if rbuf_off != 0 || rbuf_mem != INVALID_SEL {
                sysc_err!(vpe, Code::InvArgs, "only rgates specify receive buffers");
            }
        },
        _ => {},
    }

    match &kobj {
        KObject::MGate(m) => {
            if m.activated() {
                sysc_err!(vpe, Code::Exists, "memory gate is already activated");
            }
            mux.config_mem_ep(ctx, epid, ep_vpe.id(), m)?;
        },

        KObject::SGate(s) => {
            if s.activated() {
                sysc_err!(vpe, Code::Exists, "send gate is already activated");
            }

            let rgate = s.rgate().clone();
            if !rgate.activated() {
                if !rgate.valid() {
                    sysc_err!(vpe, Code::RecvGone, "receive gate is gone");
                }
                sysc_log!(vpe, "activate: waiting for rgate {:?}", rgate);
                ctx.sched.wait_for(rgate.event()).await;
                // the wakeup either reports the activation or the
                // rgate's revocation
                if !rgate.activated() || !rgate.valid() {
                    sysc_err!(vpe, Code::RecvGone, "receive gate is gone");
                }
                sysc_log!(vpe, "activate: rgate {:?} is activated", rgate);
            }

            mux.config_snd_ep(ctx, epid, ep_vpe.id(), s)?;
        },

        KObject::RGate(r) => {
            if r.activated() {
                sysc_err!(vpe, Code::Exists, "receive gate is already activated");
            }

            // scratchpad tiles take the buffer address directly
            if ctx.platform.tile_desc(dst_tile).has_virtmem() {
                sysc_err!(vpe, Code::InvArgs, "rgate activation on VM tiles is not supported");
            }
            if rbuf_mem != INVALID_SEL {
                sysc_err!(vpe, Code::InvArgs, "rbuffer mem cap given for scratchpad tile");
            }
            let rbuf_addr = rbuf_off;

            let replies = if ep.replies() > 0 {
                if ep.replies() != r.slots() {
                    sysc_err!(
                        vpe,
                        Code::InvArgs,
                        "EP cap has {} reply slots, need {}",
                        ep.replies(),
                        r.slots()
                    );
                }
                Some(epid + 1)
            } else {
                None
            };

            r.activate(dst_tile, epid, rbuf_addr);
            if let Err(e) = mux.config_rcv_ep(ctx, epid, ep_vpe.id(), replies, r) {
                r.deactivate();
                sysc_err!(vpe, e.code(), "unable to configure recv EP");
            }
        },

        _ => sysc_err!(vpe, Code::InvArgs, "expected a gate capability"),
    }

    // bind the gate to the endpoint
    let gate = match kobj {
        KObject::RGate(g) => GateObject::RGate(g),
        KObject::SGate(g) => GateObject::SGate(g),
        KObject::MGate(g) => GateObject::MGate(g),
        _ => unreachable!(),
    };
    gate.set_ep(&ep);
    ep.set_gate(Some(gate));
    ep_vpe.add_ep(ep.clone());

    reply_success(ctx, msg);
    Ok(())
}

pub fn kmem_quota(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::KMemQuota = msg.get()?;
    let kmem_sel = req.kmem as CapSel;

    sysc_log!(vpe, "kmem_quota(kmem={})", kmem_sel);

    let kmem = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), kmem_sel)?, KMem);
    send_reply(ctx, msg, &ops::QuotaReply {
        error: 0,
        total: kmem.quota() as u64,
        left: kmem.left() as u64,
    });
    Ok(())
}

pub fn tile_quota(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::TileQuota = msg.get()?;
    let tile_sel = req.tile as CapSel;

    sysc_log!(vpe, "tile_quota(tile={})", tile_sel);

    let tile = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), tile_sel)?, Tile);
    send_reply(ctx, msg, &ops::QuotaReply {
        error: 0,
        total: tile.total_eps() as u64,
        left: tile.eps() as u64,
    });
    Ok(())
}

pub fn get_sess(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::GetSess = msg.get()?;
    let dst = req.dst as CapSel;
    let srv_sel = req.srv as CapSel;
    let vpe_sel = req.vpe as CapSel;
    let sid = req.sid;

    sysc_log!(
        vpe,
        "get_sess(dst={}, srv={}, vpe={}, sid={:#x})",
        dst,
        srv_sel,
        vpe_sel,
        sid
    );

    let vpecap = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), vpe_sel)?, Vpe);
    let vpecap = vpecap.upgrade().ok_or(Error::new(Code::VpeGone))?;
    if !ctx.caps.borrow().unused(vpecap.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }
    if vpecap.id() == vpe.id() {
        sysc_err!(vpe, Code::InvArgs, "cannot get a session for the own VPE");
    }

    let srv_node = get_node(ctx, vpe.obj_space(), srv_sel)?;
    let creator = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), srv_sel)?, Serv).creator();

    // sessions hang off the root service capability
    let sess_node = {
        let cf = ctx.caps.borrow();
        let root = cf.root_of(srv_node);
        cf.find_child(root, |n| {
            matches!(&n.obj, KObject::Sess(s) if s.ident() == sid)
        })
    };
    let sess_node = match sess_node {
        Some(n) => n,
        None => sysc_err!(vpe, Code::InvArgs, "unknown session id {:#x}", sid),
    };

    let sess = as_obj!(
        vpe,
        ctx.caps
            .borrow()
            .get_node(sess_node)
            .map(|n| n.obj.clone())
            .ok_or(Error::new(Code::InvArgs))?,
        Sess
    );
    if sess.creator() != creator {
        sysc_err!(vpe, Code::NoPerm, "cannot access a foreign session");
    }

    caps::obtain_cap(ctx, &vpecap, vpecap.obj_space(), dst, sess_node)?;

    reply_success(ctx, msg);
    Ok(())
}

pub async fn sem_ctrl_async(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::SemCtrl = msg.get()?;
    let sem_sel = req.sem as CapSel;
    let op = SemOp::from_raw(req.op).ok_or(Error::new(Code::InvArgs))?;

    sysc_log!(vpe, "sem_ctrl(sem={}, op={:?})", sem_sel, op);

    let sem = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), sem_sel)?, Sem);
    match op {
        SemOp::Up => sem.up(&ctx.sched),
        SemOp::Down => {
            let res = SemObject::down_async(&ctx.sched, &sem).await;
            sysc_log!(vpe, "sem_ctrl continues with {:?}", res);
            res?;
        },
    }

    reply_success(ctx, msg);
    Ok(())
}

pub async fn vpe_ctrl_async(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::VpeCtrl = msg.get()?;
    let vpe_sel = req.vpe as CapSel;
    let op = VpeOp::from_raw(req.op).ok_or(Error::new(Code::InvArgs))?;
    let arg = req.arg;

    sysc_log!(vpe, "vpe_ctrl(vpe={}, op={:?}, arg={:#x})", vpe_sel, op, arg);

    let vpecap = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), vpe_sel)?, Vpe);
    let vpecap = vpecap.upgrade().ok_or(Error::new(Code::VpeGone))?;

    match op {
        VpeOp::Init => {
            tiles::init_vpe_async(ctx, &vpecap).await?;
        },

        VpeOp::Start => {
            if vpecap.id() == vpe.id() {
                sysc_err!(vpe, Code::InvArgs, "a VPE cannot start itself");
            }
            tiles::start_vpe_async(ctx, &vpecap).await?;
        },

        VpeOp::Stop => {
            let is_self = vpe_sel == SEL_VPE;
            tiles::stop_vpe_async(ctx, vpecap, arg as i32, is_self).await;
            if is_self {
                // the caller's endpoints are gone; no reply possible
                ctx.ktcu.borrow_mut().ack_msg(msg.ep, msg.off);
                return Ok(());
            }
        },
    }

    reply_success(ctx, msg);
    Ok(())
}

pub async fn vpe_wait_async(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::VpeWait = msg.get()?;
    let count = (req.count as usize).min(ops::MAX_WAIT_VPES);
    let event = req.event;
    let sels = &req.sels[..count];

    sysc_log!(vpe, "vpe_wait(vpes={}, event={})", count, event);

    // the upcall variant requires the upcall EP to be configured
    if event != 0 && !vpe.inited() {
        sysc_err!(vpe, Code::InvArgs, "upcall receive gate is not activated");
    }

    let mut reply = ops::VpeWaitReply {
        error: 0,
        vpe_sel: INVALID_SEL as u64,
        exitcode: 0,
    };

    if let Some((sel, code)) = tiles::wait_exit_async(ctx, vpe, event, sels).await {
        sysc_log!(vpe, "vpe_wait continues with (vpe={}, code={})", sel, code);
        reply.vpe_sel = sel as u64;
        reply.exitcode = code as u64;
    }

    send_reply(ctx, msg, &reply);
    Ok(())
}

pub fn noop(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    sysc_log!(vpe, "noop()");
    reply_success(ctx, msg);
    Ok(())
}
