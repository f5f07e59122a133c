//! Quota- and object-splitting syscalls

use alloc::rc::Rc;
use alloc::vec::Vec;

use weft_cap::SelRange;
use weft_syscall::ops;
use weft_syscall::{service, CapSel, Code, Error, Result};
use zerocopy::{FromBytes, IntoBytes};

use crate::caps;
use crate::com::Service;
use crate::ktcu::RecvdMsg;
use crate::mem::Allocation;
use crate::objects::{KMemObject, KObject, MGateObject, ServObject, TileObject};
use crate::syscall::{as_obj, get_node, get_obj, reply_success, sysc_err, sysc_log};
use crate::tiles::Vpe;
use crate::workloop::Kctx;

pub fn derive_tile(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::DeriveTile = msg.get()?;
    let tile_sel = req.tile as CapSel;
    let dst = req.dst as CapSel;
    let eps = req.eps as u32;

    sysc_log!(vpe, "derive_tile(tile={}, dst={}, eps={})", tile_sel, dst, eps);

    if !ctx.caps.borrow().unused(vpe.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }

    let tile_node = get_node(ctx, vpe.obj_space(), tile_sel)?;
    let tile = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), tile_sel)?, Tile);
    if !tile.has_quota(eps) {
        sysc_err!(vpe, Code::NoSpace, "insufficient EP quota");
    }

    let child = TileObject::new(tile.tile(), eps, true);
    caps::insert_cap_at(
        ctx,
        vpe,
        vpe.obj_space(),
        SelRange::new(dst),
        KObject::Tile(child),
        tile_node,
    )?;
    tile.alloc(eps);

    reply_success(ctx, msg);
    Ok(())
}

pub fn derive_kmem(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::DeriveKMem = msg.get()?;
    let kmem_sel = req.kmem as CapSel;
    let dst = req.dst as CapSel;
    let quota = req.quota as usize;

    sysc_log!(
        vpe,
        "derive_kmem(kmem={}, dst={}, quota={:#x})",
        kmem_sel,
        dst,
        quota
    );

    if !ctx.caps.borrow().unused(vpe.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }

    let kmem_node = get_node(ctx, vpe.obj_space(), kmem_sel)?;
    let kmem = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), kmem_sel)?, KMem);
    if !kmem.has_quota(quota) {
        sysc_err!(vpe, Code::NoSpace, "insufficient kmem quota");
    }

    let child = KMemObject::new(ctx.alloc_obj_id(), quota);
    caps::insert_cap_at(
        ctx,
        vpe,
        vpe.obj_space(),
        SelRange::new(dst),
        KObject::KMem(child),
        kmem_node,
    )?;
    assert!(kmem.alloc(quota));

    reply_success(ctx, msg);
    Ok(())
}

pub fn derive_mem(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::DeriveMem = msg.get()?;
    let vpe_sel = req.vpe as CapSel;
    let dst = req.dst as CapSel;
    let src = req.src as CapSel;
    let perms = weft_common::Perm::from_bits_truncate(req.perms as u32);

    sysc_log!(
        vpe,
        "derive_mem(vpe={}, src={}, dst={}, size={:#x}, offset={:#x}, perms={:?})",
        vpe_sel,
        src,
        dst,
        req.size,
        req.offset,
        perms
    );

    let tvpe = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), vpe_sel)?, Vpe);
    let tvpe = tvpe.upgrade().ok_or(Error::new(Code::VpeGone))?;
    if !ctx.caps.borrow().unused(tvpe.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }

    let src_node = get_node(ctx, vpe.obj_space(), src)?;
    let mgate = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), src)?, MGate);
    if req.size == 0
        || req.offset.checked_add(req.size).is_none()
        || req.offset + req.size > mgate.size()
    {
        sysc_err!(vpe, Code::InvArgs, "size or offset invalid");
    }

    let addr = mgate.addr() + req.offset;
    let child = MGateObject::new(
        Allocation::new(addr, req.size),
        perms & mgate.perms(),
        false,
    );
    caps::insert_cap_at(
        ctx,
        &tvpe,
        tvpe.obj_space(),
        SelRange::new(dst),
        KObject::MGate(child),
        src_node,
    )?;

    reply_success(ctx, msg);
    Ok(())
}

pub async fn derive_srv_async(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::DeriveSrv = msg.get()?;
    let dst = req.dst as CapSel;
    let srv_sel = req.srv as CapSel;
    let sessions = req.sessions;
    let event = req.event;

    sysc_log!(
        vpe,
        "derive_srv(dst={}, srv={}, sessions={}, event={})",
        dst,
        srv_sel,
        sessions,
        event
    );

    if !ctx.caps.borrow().range_unused(vpe.obj_space(), dst, 2) {
        sysc_err!(vpe, Code::InvArgs, "selectors {}..{} already in use", dst, dst + 2);
    }
    if sessions == 0 {
        sysc_err!(vpe, Code::InvArgs, "invalid session count");
    }

    let srv_node = get_node(ctx, vpe.obj_space(), srv_sel)?;
    let srvcap = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), srv_sel)?, Serv);

    // everything checked; report success and continue asynchronously
    reply_success(ctx, msg);

    let smsg = service::DeriveCreator {
        opcode: service::ServiceCall::DeriveCreator as u64,
        sessions,
    };
    let label = srvcap.creator() as u64;
    let res = Service::send_receive_async(
        ctx,
        srvcap.service().clone(),
        label,
        0,
        smsg.as_bytes().to_vec(),
    )
    .await;

    let res = match res {
        Err(e) => {
            log::warn!("service {} unreachable: {:?}", srvcap.service().name(), e);
            Err(e)
        },
        Ok(reply) => finish_derive_srv(ctx, vpe, &srvcap, dst, srv_node, reply),
    };

    vpe.upcall_derive_srv(ctx, event, res);
    Ok(())
}

fn finish_derive_srv(
    ctx: &Rc<Kctx>,
    vpe: &Rc<Vpe>,
    srvcap: &Rc<ServObject>,
    dst: CapSel,
    srv_node: weft_cap::NodeId,
    reply: Vec<u8>,
) -> Result<()> {
    let rep = service::DeriveCreatorReply::read_from_prefix(&reply)
        .map(|(r, _)| r)
        .map_err(|_| Error::new(Code::InvArgs))?;
    Result::from(Code::from_raw(rep.res as u32))?;

    let creator = rep.creator as usize;
    sysc_log!(vpe, "derive_srv continues with creator={}", creator);

    // obtain the send gate from the server first, because it can fail
    let serv_vpe = ctx
        .vpes
        .borrow()
        .vpe(srvcap.service().vpe())
        .ok_or(Error::new(Code::VpeGone))?;
    let sgate_node = get_node(ctx, serv_vpe.obj_space(), rep.sgate_sel as CapSel)?;
    caps::obtain_cap(ctx, vpe, vpe.obj_space(), dst + 1, sgate_node)?;

    // then derive the new service view
    let child = ServObject::new(srvcap.service().clone(), false, creator);
    caps::insert_cap_at(
        ctx,
        vpe,
        vpe.obj_space(),
        SelRange::new(dst),
        KObject::Serv(child),
        srv_node,
    )?;
    Ok(())
}
