//! Capability exchange and revocation

use alloc::rc::Rc;

use weft_syscall::ops::{self, CapKind, CapRngDesc};
use weft_syscall::{service, CapSel, Code, Error, Result, SEL_KMEM};
use zerocopy::{FromBytes, IntoBytes};

use crate::caps;
use crate::com::Service;
use crate::ktcu::RecvdMsg;
use crate::syscall::{as_obj, get_obj, reply_success, send_reply, sysc_err, sysc_log};
use crate::tiles::Vpe;
use crate::workloop::Kctx;

fn do_exchange(
    ctx: &Rc<Kctx>,
    vpe1: &Rc<Vpe>,
    vpe2: &Rc<Vpe>,
    c1: &CapRngDesc,
    c2: &CapRngDesc,
    obtain: bool,
) -> Result<()> {
    let (src, dst) = if obtain { (vpe2, vpe1) } else { (vpe1, vpe2) };
    let (src_rng, dst_rng) = if obtain { (c2, c1) } else { (c1, c2) };

    if vpe1.id() == vpe2.id() {
        return Err(Error::new(Code::InvArgs));
    }
    if c1.kind() != c2.kind() || c1.kind() != CapKind::Object {
        return Err(Error::new(Code::InvArgs));
    }
    if (obtain && c2.count() > c1.count()) || (!obtain && c2.count() != c1.count()) {
        return Err(Error::new(Code::InvArgs));
    }
    if !ctx
        .caps
        .borrow()
        .range_unused(dst.obj_space(), dst_rng.start(), dst_rng.count())
    {
        return Err(Error::new(Code::InvArgs));
    }

    for i in 0..c2.count() {
        let src_sel = src_rng.start() + i;
        let dst_sel = dst_rng.start() + i;
        if let Some(node) = ctx.caps.borrow().get_id(src.obj_space(), src_sel) {
            caps::obtain_cap(ctx, dst, dst.obj_space(), dst_sel, node)?;
        }
    }
    Ok(())
}

pub fn exchange(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::Exchange = msg.get()?;
    let vpe_sel = req.vpe as CapSel;
    let own = CapRngDesc::from_raw(req.own);
    let other = CapRngDesc::new(own.kind(), req.other as CapSel, own.count());
    let obtain = req.obtain != 0;

    sysc_log!(
        vpe,
        "exchange(vpe={}, own={:?}, other={:?}, obtain={})",
        vpe_sel,
        own,
        other,
        obtain
    );

    let other_vpe = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), vpe_sel)?, Vpe);
    let other_vpe = other_vpe.upgrade().ok_or(Error::new(Code::VpeGone))?;
    do_exchange(ctx, vpe, &other_vpe, &own, &other, obtain)?;

    reply_success(ctx, msg);
    Ok(())
}

pub async fn exchange_over_sess_async(
    ctx: &Rc<Kctx>,
    vpe: &Rc<Vpe>,
    msg: &RecvdMsg,
    obtain: bool,
) -> Result<()> {
    let req: ops::ExchangeSess = msg.get()?;
    let vpe_sel = req.vpe as CapSel;
    let sess_sel = req.sess as CapSel;
    let crd = CapRngDesc::from_raw(req.caps);
    let name = if obtain { "obtain" } else { "delegate" };

    sysc_log!(vpe, "{}(vpe={}, sess={}, crd={:?})", name, vpe_sel, sess_sel, crd);

    let vpecap = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), vpe_sel)?, Vpe);
    let vpecap = vpecap.upgrade().ok_or(Error::new(Code::VpeGone))?;
    let sess = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), sess_sel)?, Sess);

    let opcode = if obtain {
        service::ServiceCall::Obtain
    } else {
        service::ServiceCall::Delegate
    };
    let smsg = service::Exchange {
        opcode: opcode as u64,
        sess: sess.ident(),
        caps: crd.raw(),
        args: req.args,
    };

    let serv = sess.service().service().clone();
    let label = sess.creator() as u64;

    log::debug!(
        "sending {}(sess={:#x}, caps={}) to service {} with creator {}",
        name,
        sess.ident(),
        crd.count(),
        serv.name(),
        label
    );

    let reply = match Service::send_receive_async(
        ctx,
        serv.clone(),
        label,
        sess.ident(),
        smsg.as_bytes().to_vec(),
    )
    .await
    {
        Ok(r) => r,
        Err(e) => sysc_err!(vpe, e.code(), "service {} unreachable", serv.name()),
    };

    let rep = service::ExchangeReply::read_from_prefix(&reply)
        .map(|(r, _)| r)
        .map_err(|_| Error::new(Code::InvArgs))?;

    let srv_crd = CapRngDesc::from_raw(rep.caps);
    sysc_log!(vpe, "{} continues with res={}, srv_crd={:?}", name, rep.res, srv_crd);

    if rep.res != 0 {
        sysc_err!(
            vpe,
            Code::from_raw(rep.res as u32),
            "server denied the cap exchange"
        );
    }

    let serv_vpe = ctx
        .vpes
        .borrow()
        .vpe(serv.vpe())
        .ok_or(Error::new(Code::VpeGone))?;
    do_exchange(ctx, &vpecap, &serv_vpe, &crd, &srv_crd, obtain)?;

    send_reply(ctx, msg, &ops::ExchangeSessReply {
        error: 0,
        args: rep.args,
    });
    Ok(())
}

pub async fn revoke_async(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::Revoke = msg.get()?;
    let vpe_sel = req.vpe as CapSel;
    let crd = CapRngDesc::from_raw(req.caps);
    let own = req.own != 0;

    sysc_log!(vpe, "revoke(vpe={}, crd={:?}, own={})", vpe_sel, crd, own);

    if crd.kind() == CapKind::Object && crd.start() <= SEL_KMEM {
        sysc_err!(vpe, Code::InvArgs, "the first selectors are not revocable");
    }

    let vpecap = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), vpe_sel)?, Vpe);
    let vpecap = vpecap.upgrade().ok_or(Error::new(Code::VpeGone))?;
    let space = match crd.kind() {
        CapKind::Object => vpecap.obj_space(),
        CapKind::Map => vpecap.map_space(),
    };

    caps::revoke_async(ctx, space, crd.start(), crd.count(), own).await?;

    reply_success(ctx, msg);
    Ok(())
}
