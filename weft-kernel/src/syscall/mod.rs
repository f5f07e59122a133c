//! Syscall dispatch
//!
//! Syscall messages arrive on the two kernel syscall EPs with the
//! sending VPE's id as label. The first payload word is the opcode;
//! the rest is the per-opcode wire struct. Every handler validates
//! selectors, mutates capability and endpoint state, and replies with
//! `SUCCESS` plus payload or an error code.

mod create_ops;
mod derive_ops;
mod exchange_ops;
mod misc_ops;

use alloc::rc::Rc;

use weft_cap::{NodeId, SpaceId};
use weft_syscall::ops::{DefaultReply, Operation};
use weft_syscall::{CapSel, Code, Error, Result};
use zerocopy::{Immutable, IntoBytes};

use crate::ktcu::RecvdMsg;
use crate::objects::KObject;
use crate::tiles::ActId;
use crate::workloop::Kctx;

macro_rules! sysc_log {
    ($vpe:expr, $fmt:literal $(, $args:expr)*) => {
        log::debug!(
            concat!("{}:{}@{}: syscall::", $fmt),
            $vpe.id(), $vpe.name(), $vpe.tile_id() $(, $args)*
        )
    };
}

macro_rules! sysc_err {
    ($vpe:expr, $e:expr, $fmt:literal $(, $args:expr)*) => {{
        log::warn!(
            concat!("{}:{}@{}: ", $fmt),
            $vpe.id(), $vpe.name(), $vpe.tile_id() $(, $args)*
        );
        return Err(Error::new($e));
    }};
}

macro_rules! as_obj {
    ($vpe:expr, $obj:expr, $ty:ident) => {
        match $obj {
            crate::objects::KObject::$ty(o) => o,
            ref other => sysc_err!(
                $vpe,
                weft_syscall::Code::InvArgs,
                "expected {} cap, got {}",
                stringify!($ty),
                other.kind()
            ),
        }
    };
}

pub(crate) use as_obj;
pub(crate) use sysc_err;
pub(crate) use sysc_log;

/// Look up the capability node covering `sel`.
pub(crate) fn get_node(ctx: &Kctx, space: SpaceId, sel: CapSel) -> Result<NodeId> {
    ctx.caps
        .borrow()
        .get_id(space, sel)
        .ok_or(Error::new(Code::InvArgs))
}

/// Look up the object behind `sel`.
pub(crate) fn get_obj(ctx: &Kctx, space: SpaceId, sel: CapSel) -> Result<KObject> {
    ctx.caps
        .borrow()
        .get(space, sel)
        .map(|n| n.obj.clone())
        .ok_or(Error::new(Code::InvArgs))
}

/// Reply a wire struct to a syscall message.
pub(crate) fn send_reply<T: IntoBytes + Immutable>(ctx: &Kctx, msg: &RecvdMsg, rep: &T) {
    ctx.ktcu
        .borrow_mut()
        .reply_obj(msg.ep, msg.off, rep)
        .ok();
}

/// Reply a bare error code.
pub(crate) fn reply_result(ctx: &Kctx, msg: &RecvdMsg, code: Code) {
    send_reply(ctx, msg, &DefaultReply {
        error: code as u64,
    });
}

/// Reply success without payload.
pub(crate) fn reply_success(ctx: &Kctx, msg: &RecvdMsg) {
    reply_result(ctx, msg, Code::Success);
}

/// Handle one syscall message; runs as its own task.
pub async fn handle_async(ctx: Rc<Kctx>, msg: RecvdMsg) {
    let vpe = match ctx.vpes.borrow().vpe(msg.label as ActId) {
        Some(v) => v,
        None => {
            // the VPE died between send and dispatch
            ctx.ktcu.borrow_mut().ack_msg(msg.ep, msg.off);
            return;
        },
    };

    let opcode = msg.opcode();
    let res = match Operation::from_raw(opcode) {
        Some(op) => dispatch(&ctx, &vpe, &msg, op).await,
        None => {
            log::warn!("{:?}: unknown syscall opcode {}", vpe, opcode);
            Err(Error::new(Code::InvArgs))
        },
    };

    if let Err(e) = res {
        log::warn!(
            "{}:{}@{}: {} failed: {:?}",
            vpe.id(),
            vpe.name(),
            vpe.tile_id(),
            Operation::from_raw(opcode).map(|o| o.name()).unwrap_or("?"),
            e
        );
        reply_result(&ctx, &msg, e.code());
    }
}

async fn dispatch(
    ctx: &Rc<Kctx>,
    vpe: &Rc<crate::tiles::Vpe>,
    msg: &RecvdMsg,
    op: Operation,
) -> Result<()> {
    match op {
        Operation::CreateRGate => create_ops::create_rgate(ctx, vpe, msg),
        Operation::CreateSGate => create_ops::create_sgate(ctx, vpe, msg),
        Operation::CreateMGate => create_ops::create_mgate(ctx, vpe, msg),
        Operation::CreateVpe => create_ops::create_vpe(ctx, vpe, msg),
        Operation::CreateMap => create_ops::create_map(ctx, vpe, msg),
        Operation::CreateSrv => create_ops::create_srv(ctx, vpe, msg),
        Operation::CreateSess => create_ops::create_sess(ctx, vpe, msg),
        Operation::CreateSem => create_ops::create_sem(ctx, vpe, msg),

        Operation::AllocEp => misc_ops::alloc_ep(ctx, vpe, msg),
        Operation::Activate => misc_ops::activate_async(ctx, vpe, msg).await,
        Operation::KMemQuota => misc_ops::kmem_quota(ctx, vpe, msg),
        Operation::TileQuota => misc_ops::tile_quota(ctx, vpe, msg),
        Operation::GetSess => misc_ops::get_sess(ctx, vpe, msg),
        Operation::SemCtrl => misc_ops::sem_ctrl_async(ctx, vpe, msg).await,
        Operation::VpeCtrl => misc_ops::vpe_ctrl_async(ctx, vpe, msg).await,
        Operation::VpeWait => misc_ops::vpe_wait_async(ctx, vpe, msg).await,
        Operation::Noop => misc_ops::noop(ctx, vpe, msg),

        Operation::DeriveMem => derive_ops::derive_mem(ctx, vpe, msg),
        Operation::DeriveKMem => derive_ops::derive_kmem(ctx, vpe, msg),
        Operation::DeriveTile => derive_ops::derive_tile(ctx, vpe, msg),
        Operation::DeriveSrv => derive_ops::derive_srv_async(ctx, vpe, msg).await,

        Operation::Exchange => exchange_ops::exchange(ctx, vpe, msg),
        Operation::Delegate => exchange_ops::exchange_over_sess_async(ctx, vpe, msg, false).await,
        Operation::Obtain => exchange_ops::exchange_over_sess_async(ctx, vpe, msg, true).await,
        Operation::Revoke => exchange_ops::revoke_async(ctx, vpe, msg).await,
    }
}
