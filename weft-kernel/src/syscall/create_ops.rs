//! Capability-creating syscalls

use alloc::rc::Rc;

use weft_cap::SelRange;
use weft_common::cfg::{PAGE_BITS, PAGE_MASK, PAGE_SIZE};
use weft_common::{GlobAddr, PageFlags, Perm};
use weft_syscall::ops;
use weft_syscall::{CapSel, Code, Error, Result};

use crate::aspace;
use crate::com::Service;
use crate::ktcu::RecvdMsg;
use crate::mem::Allocation;
use crate::objects::{
    EpObject, KObject, MGateObject, MapObject, RGateObject, SGateObject, SemObject, ServObject,
    SessObject,
};
use crate::syscall::{as_obj, get_node, get_obj, reply_success, send_reply, sysc_err, sysc_log};
use crate::tiles::{self, Vpe, STD_EPS_COUNT};
use crate::workloop::Kctx;
use crate::caps;

/// Largest receive-buffer order a VPE may ask for.
const MAX_RB_ORD: u32 = 24;
/// Smallest slot order (one header plus payload).
const MIN_MSG_ORD: u32 = 6;
/// Slots are bounded by the 32-bit occupied/unread masks.
const MAX_SLOT_BITS: u32 = 5;

pub fn create_rgate(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::CreateRGate = msg.get()?;
    let dst = req.dst as CapSel;
    let order = req.order as u32;
    let msg_order = req.msg_order as u32;

    sysc_log!(vpe, "create_rgate(dst={}, ord={}, msg_ord={})", dst, order, msg_order);

    if !ctx.caps.borrow().unused(vpe.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }
    if msg_order < MIN_MSG_ORD
        || msg_order > order
        || order > MAX_RB_ORD
        || order - msg_order > MAX_SLOT_BITS
    {
        sysc_err!(vpe, Code::InvArgs, "invalid receive buffer size");
    }

    let rgate = RGateObject::new(order, msg_order, ctx.sched.alloc_event());
    caps::insert_cap(ctx, vpe, vpe.obj_space(), SelRange::new(dst), KObject::RGate(rgate))?;

    reply_success(ctx, msg);
    Ok(())
}

pub fn create_sgate(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::CreateSGate = msg.get()?;
    let dst = req.dst as CapSel;
    let rgate_sel = req.rgate as CapSel;

    sysc_log!(
        vpe,
        "create_sgate(dst={}, rgate={}, label={:#x}, credits={})",
        dst,
        rgate_sel,
        req.label,
        req.credits
    );

    if !ctx.caps.borrow().unused(vpe.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }

    let rgate_node = get_node(ctx, vpe.obj_space(), rgate_sel)?;
    let rgate = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), rgate_sel)?, RGate);

    let sgate = SGateObject::new(&rgate, req.label, req.credits as u32);
    caps::insert_cap_at(
        ctx,
        vpe,
        vpe.obj_space(),
        SelRange::new(dst),
        KObject::SGate(sgate),
        rgate_node,
    )?;

    reply_success(ctx, msg);
    Ok(())
}

pub fn create_mgate(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::CreateMGate = msg.get()?;
    let dst = req.dst as CapSel;
    let vpe_sel = req.vpe as CapSel;
    let perms = Perm::from_bits_truncate(req.perms as u32);

    sysc_log!(
        vpe,
        "create_mgate(dst={}, vpe={}, addr={:#x}, size={:#x}, perms={:?})",
        dst,
        vpe_sel,
        req.addr,
        req.size,
        perms
    );

    if !ctx.caps.borrow().unused(vpe.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }
    if req.addr & PAGE_MASK as u64 != 0 || req.size & PAGE_MASK as u64 != 0 {
        sysc_err!(vpe, Code::InvArgs, "address and size must be page-aligned");
    }

    let vpe_node = get_node(ctx, vpe.obj_space(), vpe_sel)?;
    let tgt = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), vpe_sel)?, Vpe);
    let tgt = tgt.upgrade().ok_or(Error::new(Code::VpeGone))?;

    let desc = ctx.platform.tile_desc(tgt.tile_id());
    if desc.has_virtmem() {
        // memory gates over mapped memory require the map table; the
        // scratchpad path below is the supported one
        sysc_err!(vpe, Code::InvArgs, "create_mgate on VM tiles is not supported");
    }
    if req.size == 0 || req.addr.checked_add(req.size).is_none()
        || req.addr + req.size > desc.mem_size() as u64
    {
        sysc_err!(vpe, Code::InvArgs, "region empty or out of bounds");
    }

    let glob = GlobAddr::new_with(tgt.tile_id(), req.addr);
    let mgate = MGateObject::new(Allocation::new(glob, req.size), perms, false);
    caps::insert_cap_at(
        ctx,
        vpe,
        vpe.obj_space(),
        SelRange::new(dst),
        KObject::MGate(mgate),
        vpe_node,
    )?;

    reply_success(ctx, msg);
    Ok(())
}

/// Number of selectors the EP-range capability of a new VPE covers.
const VPE_EPS_SELS: CapSel = 15;

pub fn create_vpe(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::CreateVpe = msg.get()?;
    let dst = req.dst as CapSel;
    let tile_sel = req.tile as CapSel;
    let kmem_sel = req.kmem as CapSel;
    let namelen = (req.namelen as usize).min(req.name.len());
    let name = core::str::from_utf8(&req.name[..namelen])
        .map_err(|_| Error::new(Code::InvArgs))?;

    sysc_log!(
        vpe,
        "create_vpe(dst={}, tile={}, kmem={}, name={})",
        dst,
        tile_sel,
        kmem_sel,
        name
    );

    // the parent receives the VPE cap, the EP range, and the tile
    // memory gate behind each other
    if !ctx
        .caps
        .borrow()
        .range_unused(vpe.obj_space(), dst, 2 + VPE_EPS_SELS)
    {
        sysc_err!(vpe, Code::InvArgs, "selectors {}.. already in use", dst);
    }
    if name.is_empty() {
        sysc_err!(vpe, Code::InvArgs, "invalid name");
    }

    let tile_obj = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), tile_sel)?, Tile);
    if !tile_obj.has_quota(STD_EPS_COUNT as u32) {
        sysc_err!(
            vpe,
            Code::NoSpace,
            "tile cap has insufficient EPs (have {}, need {})",
            tile_obj.eps(),
            STD_EPS_COUNT
        );
    }
    let kmem = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), kmem_sel)?, KMem);

    let nvpe = tiles::create_vpe(ctx, name, tile_obj.clone(), kmem, false)?;

    // hand the new VPE to the parent
    let vpe_node = caps::insert_cap(
        ctx,
        vpe,
        vpe.obj_space(),
        SelRange::new(dst),
        KObject::Vpe(Rc::downgrade(&nvpe)),
    )?;

    // the standard EP range, as a child of the VPE cap
    let ep = EpObject::new(
        true,
        Rc::downgrade(&nvpe),
        nvpe.eps_start(),
        0,
        nvpe.tile_obj(),
    );
    caps::insert_cap_at(
        ctx,
        vpe,
        vpe.obj_space(),
        SelRange::new_range(dst + 1, VPE_EPS_SELS),
        KObject::Ep(ep),
        vpe_node,
    )?;

    // a memory gate spanning the tile's scratchpad, if it has one
    let desc = ctx.platform.tile_desc(nvpe.tile_id());
    if desc.mem_size() > 0 {
        let glob = GlobAddr::new_with(nvpe.tile_id(), 0);
        let mgate = MGateObject::new(
            Allocation::new(glob, desc.mem_size() as u64),
            Perm::RWX,
            false,
        );
        caps::insert_cap_at(
            ctx,
            vpe,
            vpe.obj_space(),
            SelRange::new(dst + 1 + VPE_EPS_SELS),
            KObject::MGate(mgate),
            vpe_node,
        )?;
    }

    send_reply(ctx, msg, &ops::CreateVpeReply {
        error: 0,
        id: nvpe.id() as u64,
        eps_start: nvpe.eps_start() as u64,
    });
    Ok(())
}

pub fn create_map(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::CreateMap = msg.get()?;
    let dst = req.dst as CapSel;
    let vpe_sel = req.vpe as CapSel;
    let mgate_sel = req.mgate as CapSel;
    let first = req.first as CapSel;
    let pages = req.pages as CapSel;
    let perms = Perm::from_bits_truncate(req.perms as u32);

    sysc_log!(
        vpe,
        "create_map(dst={}, vpe={}, mgate={}, first={}, pages={}, perms={:?})",
        dst,
        vpe_sel,
        mgate_sel,
        first,
        pages,
        perms
    );

    let dst_vpe = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), vpe_sel)?, Vpe);
    let dst_vpe = dst_vpe.upgrade().ok_or(Error::new(Code::VpeGone))?;
    if !ctx.platform.tile_desc(dst_vpe.tile_id()).has_virtmem() {
        sysc_err!(vpe, Code::InvArgs, "tile has no virtual-memory support");
    }

    let mgate_node = get_node(ctx, vpe.obj_space(), mgate_sel)?;
    let mgate = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), mgate_sel)?, MGate);
    if mgate.addr().offset() & PAGE_MASK as u64 != 0 || mgate.size() & PAGE_MASK as u64 != 0 {
        sysc_err!(vpe, Code::InvArgs, "memory capability is not page-aligned");
    }
    if !mgate.perms().contains(perms) {
        sysc_err!(vpe, Code::NoPerm, "invalid permissions");
    }

    let total_pages = (mgate.size() >> PAGE_BITS) as CapSel;
    if pages == 0
        || first.checked_add(pages).is_none()
        || first >= total_pages
        || first + pages > total_pages
    {
        sysc_err!(vpe, Code::InvArgs, "region of memory cap is invalid");
    }

    let virt = (dst as u64) << PAGE_BITS;
    let phys = mgate.addr() + (first as u64 * PAGE_SIZE as u64);
    let flags = PageFlags::from(perms);

    // retrieve or create the map object
    let existing = ctx
        .caps
        .borrow()
        .get(dst_vpe.map_space(), dst)
        .map(|n| (n.obj.clone(), n.sels.count()));
    let (map_obj, exists) = match existing {
        Some((obj, len)) => {
            if len != pages {
                sysc_err!(vpe, Code::InvArgs, "map cap exists with different page count");
            }
            (obj, true)
        },
        None => {
            if !ctx.caps.borrow().range_unused(dst_vpe.map_space(), dst, pages) {
                sysc_err!(vpe, Code::InvArgs, "map range {}..{} already in use", dst, pages);
            }
            (KObject::Map(MapObject::new(phys, flags)), false)
        },
    };

    // install or update the PTEs
    if let KObject::Map(m) = &map_obj {
        aspace::map(ctx, &dst_vpe, virt, phys, pages as usize, flags)?;
        m.set_mapped(phys, flags);
    }

    if !exists {
        caps::insert_cap_at(
            ctx,
            &dst_vpe,
            dst_vpe.map_space(),
            SelRange::new_range(dst, pages),
            map_obj,
            mgate_node,
        )?;
    }

    reply_success(ctx, msg);
    Ok(())
}

pub fn create_srv(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::CreateSrv = msg.get()?;
    let dst = req.dst as CapSel;
    let rgate_sel = req.rgate as CapSel;
    let creator = req.creator as usize;
    let namelen = (req.namelen as usize).min(req.name.len());
    let name = core::str::from_utf8(&req.name[..namelen])
        .map_err(|_| Error::new(Code::InvArgs))?;

    sysc_log!(
        vpe,
        "create_srv(dst={}, rgate={}, creator={}, name={})",
        dst,
        rgate_sel,
        creator,
        name
    );

    if !ctx.caps.borrow().unused(vpe.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }
    if name.is_empty() {
        sysc_err!(vpe, Code::InvArgs, "invalid server name");
    }
    if ctx.services.borrow().name_exists(name) {
        sysc_err!(vpe, Code::Exists, "service {} already registered", name);
    }

    let rgate = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), rgate_sel)?, RGate);
    if !rgate.activated() {
        sysc_err!(vpe, Code::InvArgs, "rgate is not activated");
    }

    let serv = Service::new(ctx, vpe.id(), name, rgate)?;
    caps::insert_cap(
        ctx,
        vpe,
        vpe.obj_space(),
        SelRange::new(dst),
        KObject::Serv(ServObject::new(serv, true, creator)),
    )?;

    reply_success(ctx, msg);
    Ok(())
}

pub fn create_sess(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::CreateSess = msg.get()?;
    let dst = req.dst as CapSel;
    let srv_sel = req.srv as CapSel;

    sysc_log!(
        vpe,
        "create_sess(dst={}, srv={}, creator={}, ident={:#x})",
        dst,
        srv_sel,
        req.creator,
        req.ident
    );

    if !ctx.caps.borrow().unused(vpe.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }

    let srv_node = get_node(ctx, vpe.obj_space(), srv_sel)?;
    if ctx
        .caps
        .borrow()
        .get_node(srv_node)
        .map(|n| n.has_parent())
        .unwrap_or(true)
    {
        sysc_err!(vpe, Code::InvArgs, "only the service owner can create sessions");
    }
    let srv = as_obj!(vpe, get_obj(ctx, vpe.obj_space(), srv_sel)?, Serv);

    let sess = SessObject::new(&srv, req.creator as usize, req.ident);
    caps::insert_cap_at(
        ctx,
        vpe,
        vpe.obj_space(),
        SelRange::new(dst),
        KObject::Sess(sess),
        srv_node,
    )?;

    reply_success(ctx, msg);
    Ok(())
}

pub fn create_sem(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, msg: &RecvdMsg) -> Result<()> {
    let req: ops::CreateSem = msg.get()?;
    let dst = req.dst as CapSel;

    sysc_log!(vpe, "create_sem(dst={}, value={})", dst, req.value);

    if !ctx.caps.borrow().unused(vpe.obj_space(), dst) {
        sysc_err!(vpe, Code::InvArgs, "selector {} already in use", dst);
    }

    let sem = SemObject::new(req.value as u32, ctx.sched.alloc_event());
    caps::insert_cap(ctx, vpe, vpe.obj_space(), SelRange::new(dst), KObject::Sem(sem))?;

    reply_success(ctx, msg);
    Ok(())
}
