//! Capability insertion, revocation, and object teardown
//!
//! The generic derivation forest lives in `weft-cap`; this module binds
//! it to the kernel: quota accounting on every insertion, the
//! `can_revoke` policy, and the per-kind teardown hooks that run when a
//! revocation releases an object's last owning capability.

use alloc::rc::Rc;

use weft_cap::{CapError, CapNode, NodeId, Released, SelRange, SpaceId};
use weft_common::cfg::{PAGE_BITS, PAGE_SIZE};
use weft_common::PageFlags;
use weft_syscall::{CapSel, Code, Error, Result, SEL_KMEM, SEL_TILE, SEL_VPE};

use crate::mem::Allocation;
use crate::objects::{GateEp, KObject, CAP_SIZE};
use crate::tiles::Vpe;
use crate::workloop::Kctx;

fn map_cap_err(e: CapError) -> Error {
    match e {
        CapError::Exists => Error::new(Code::Exists),
        CapError::NoSuchCap => Error::new(Code::InvArgs),
        CapError::NotRevocable => Error::new(Code::NotRevocable),
    }
}

/// The revocation policy for explicitly named capabilities.
pub fn can_revoke(node: &CapNode<KObject>) -> bool {
    match &node.obj {
        KObject::KMem(k) => k.left() == k.quota(),
        KObject::Tile(t) => t.vpes() == 0,
        // kernel-installed mappings are not user-revocable
        KObject::Map(m) => !m.flags().contains(PageFlags::KERNEL),
        _ => true,
    }
}

/// Insert a parentless capability owning `obj`, charging `vpe`'s kmem
/// for the capability and the object.
pub fn insert_cap(
    ctx: &Rc<Kctx>,
    vpe: &Rc<Vpe>,
    space: SpaceId,
    sels: SelRange,
    obj: KObject,
) -> Result<NodeId> {
    insert_cap_at(ctx, vpe, space, sels, obj, NodeId::NULL)
}

/// Insert a capability owning `obj` as a child of `parent`.
pub fn insert_cap_at(
    ctx: &Rc<Kctx>,
    vpe: &Rc<Vpe>,
    space: SpaceId,
    sels: SelRange,
    obj: KObject,
    parent: NodeId,
) -> Result<NodeId> {
    let cost = CAP_SIZE + obj.size();
    if !vpe.kmem().alloc(cost) {
        return Err(Error::new(Code::NoKmem));
    }
    log::trace!("creating cap {:?} at {:?} ({:?})", obj, sels, space);

    let res = if parent.is_valid() {
        ctx.caps.borrow_mut().insert_child(space, sels, obj, parent)
    } else {
        ctx.caps.borrow_mut().insert(space, sels, obj)
    };
    res.map_err(|e| {
        vpe.kmem().free(cost);
        map_cap_err(e)
    })
}

/// Clone the capability `src` to `dst_sel` of `dst_vpe`, charging the
/// destination's kmem for the clone.
pub fn obtain_cap(
    ctx: &Rc<Kctx>,
    dst_vpe: &Rc<Vpe>,
    dst_space: SpaceId,
    dst_sel: CapSel,
    src: NodeId,
) -> Result<NodeId> {
    if !dst_vpe.kmem().alloc(CAP_SIZE) {
        return Err(Error::new(Code::NoKmem));
    }
    ctx.caps
        .borrow_mut()
        .obtain(dst_space, dst_sel, src)
        .map_err(|e| {
            dst_vpe.kmem().free(CAP_SIZE);
            map_cap_err(e)
        })
}

/// Revoke the capabilities covering `[start, start + count)` of
/// `space` and run teardown on everything that was released.
pub async fn revoke_async(
    ctx: &Rc<Kctx>,
    space: SpaceId,
    start: CapSel,
    count: CapSel,
    own: bool,
) -> Result<()> {
    let released = ctx
        .caps
        .borrow_mut()
        .revoke(space, start, count, own, can_revoke)
        .map_err(map_cap_err)?;

    for r in released {
        release_async(ctx, r).await;
    }
    Ok(())
}

/// Revoke every capability of a dying VPE (both tables).
pub async fn revoke_all_async(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>) {
    for space in [vpe.obj_space(), vpe.map_space()] {
        let released = ctx.caps.borrow_mut().revoke_all(space);
        for r in released {
            release_async(ctx, r).await;
        }
    }
}

/// Run the teardown of one released capability.
async fn release_async(ctx: &Rc<Kctx>, r: Released<KObject>) {
    log::trace!("freeing cap {:?} at {:?}", r.obj, r.sels);

    // return the quota for the capability, and for the object if this
    // capability owned it
    if let Some(owner) = ctx.vpes.borrow().vpe_by_space(r.space) {
        let cost = if r.derived {
            CAP_SIZE
        } else {
            CAP_SIZE + r.obj.size()
        };
        owner.kmem().free(cost);
    }

    match &r.obj {
        KObject::Vpe(w) => {
            // the parent's root capability controls the VPE's lifetime;
            // the VPE's own self-capability does not re-enter teardown
            if !r.derived && r.sels.start() != SEL_VPE {
                if let Some(vpe) = w.upgrade() {
                    if !vpe.is_root() {
                        crate::tiles::destroy_vpe_boxed(ctx, vpe).await;
                    }
                }
            }
        },

        KObject::Ep(e) => {
            if let Some(gate) = e.take_gate() {
                gate.remove_ep();
                if let Some(v) = e.vpe() {
                    let mux = ctx.tiles.tilemux(e.tile_id());
                    mux.invalidate_ep(ctx, v.id(), e.ep(), true, false).ok();
                }
            }
            if !e.is_std() {
                let mux = ctx.tiles.tilemux(e.tile_id());
                mux.free_eps(e.ep(), 1 + e.replies());
                e.tile_obj().free(1 + e.replies());
            }
            if let Some(v) = e.vpe() {
                v.rem_ep(e);
            }
        },

        KObject::Tile(t) => {
            // derived tile objects return their endpoint quota
            if !r.derived && r.sels.start() != SEL_TILE {
                if let Some(KObject::Tile(parent)) = &r.parent_obj {
                    t.revoke(parent);
                }
            }
        },

        KObject::KMem(k) => {
            if !r.derived && r.sels.start() != SEL_KMEM {
                if let Some(KObject::KMem(parent)) = &r.parent_obj {
                    k.revoke(parent);
                }
            }
        },

        KObject::SGate(s) => {
            // poison the matching reply slots at the receiver first
            if let Some(sep) = s.gate_ep_mut().get_ep() {
                if let Some((rtile, rep)) = s.rgate().location() {
                    ctx.ktcu
                        .borrow_mut()
                        .inv_reply_remote(rtile, rep, sep.tile_id(), sep.ep())
                        .ok();
                }
            }
            invalidate_gate_ep(ctx, &mut s.gate_ep_mut(), r.foreign);
        },

        KObject::RGate(rg) => {
            if !r.derived {
                rg.invalidate();
            }
            invalidate_gate_ep(ctx, &mut rg.gate_ep_mut(), false);
            if !r.derived {
                rg.deactivate();
                // wake anyone blocked on the activation with "gone"
                ctx.sched.notify(rg.event(), None);
            }
        },

        KObject::MGate(m) => {
            invalidate_gate_ep(ctx, &mut m.gate_ep_mut(), false);
            if !r.derived && m.owned() {
                ctx.mem.borrow_mut().free(m.allocation());
            }
        },

        KObject::Serv(sv) => {
            if !r.derived && sv.owner() {
                sv.service().abort(ctx);
                ctx.services.borrow_mut().remove(sv.service().id());
            }
        },

        KObject::Sess(ss) => {
            // pending service calls of this session are dropped
            ss.service()
                .service()
                .queue()
                .borrow_mut()
                .drop_msgs(ss.ident());
        },

        KObject::Map(m) => {
            if m.mapped() {
                if let Some(vpe) = ctx.vpes.borrow().vpe_by_space(r.space) {
                    let virt = (r.sels.start() as u64) << PAGE_BITS;
                    crate::aspace::unmap(ctx, &vpe, virt, r.sels.count() as usize).ok();
                }
                if m.flags().contains(PageFlags::EXCLUSIVE) {
                    let size = r.sels.count() as u64 * PAGE_SIZE as u64;
                    ctx.mem
                        .borrow_mut()
                        .free(Allocation::new(m.global(), size));
                }
            }
        },

        KObject::Sem(sm) => {
            if !r.derived {
                sm.revoke(&ctx.sched);
            }
        },
    }
}

/// Invalidate the endpoint a gate is installed on, if any.
fn invalidate_gate_ep(ctx: &Rc<Kctx>, gep: &mut GateEp, foreign: bool) {
    if let Some(ep) = gep.get_ep() {
        if let Some(v) = ep.vpe() {
            let mux = ctx.tiles.tilemux(ep.tile_id());
            mux.invalidate_ep(ctx, v.id(), ep.ep(), true, false).ok();
            // notify the multiplexer unless it is a self-invalidation
            if foreign {
                mux.notify_invalidate(ctx, v.id(), ep.ep()).ok();
            }
        } else {
            ctx.ktcu
                .borrow_mut()
                .invalidate_ep_remote(ep.tile_id(), ep.ep(), true)
                .ok();
        }
        ep.set_gate(None);
        gep.remove_ep();
    }
}
