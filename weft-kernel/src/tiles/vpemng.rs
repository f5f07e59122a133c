//! VPE management
//!
//! Id allocation, the VPE table, and the lifecycle paths: creation
//! (quota accounting, initial capabilities, standard endpoints), start
//! and stop through the tile multiplexer, and exit-wait bookkeeping
//! including the upcall-on-exit variant.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;

use weft_cap::{SelRange, SpaceId};
use weft_common::cfg::{
    DEF_RBUF_ORD, PAGE_SIZE, RBUF_STD_ADDR, RBUF_STD_SIZE, SYSC_RBUF_ORD, UPCALL_RBUF_ORD,
};
use weft_paging::AddrSpace;
use weft_syscall::tmcalls::TmuxVpeOp;
use weft_syscall::{CapSel, Code, Error, Result, INVALID_SEL, SEL_KMEM, SEL_TILE, SEL_VPE};
use weft_tcu::regs::{config_recv, config_send};

use crate::caps;
use crate::com::{QueueId, SendQueue};
use crate::ktcu::{KSYS_EP0, KSYS_EP1};
use crate::objects::{KMemObject, KObject, TileObject};
use crate::sched::Event;
use crate::tiles::{
    ActId, TileMux, Vpe, VpeState, STD_EPS_COUNT, SYSC_REP_OFF, SYSC_SEP_OFF, UPCALL_REP_OFF,
    UPCALL_RPLEP_OFF, DEF_REP_OFF,
};
use crate::workloop::Kctx;

struct ExitWait {
    id: ActId,
    event: u64,
    sels: Vec<u64>,
}

/// The table of live VPEs.
pub struct VpeMng {
    vpes: BTreeMap<ActId, Rc<Vpe>>,
    by_space: BTreeMap<SpaceId, ActId>,
    next_id: ActId,
    exit_event: Event,
    listeners: Vec<ExitWait>,
}

impl VpeMng {
    /// Create an empty manager; `exit_event` is the event all blocking
    /// exit-waiters share.
    #[must_use]
    pub fn new(exit_event: Event) -> Self {
        Self {
            vpes: BTreeMap::new(),
            by_space: BTreeMap::new(),
            next_id: 1,
            exit_event,
            listeners: Vec::new(),
        }
    }

    /// Number of live VPEs.
    #[must_use]
    pub fn count(&self) -> usize {
        self.vpes.len()
    }

    /// Look up a VPE by id.
    #[must_use]
    pub fn vpe(&self, id: ActId) -> Option<Rc<Vpe>> {
        self.vpes.get(&id).cloned()
    }

    /// Look up the VPE owning a capability table.
    #[must_use]
    pub fn vpe_by_space(&self, space: SpaceId) -> Option<Rc<Vpe>> {
        self.by_space.get(&space).and_then(|id| self.vpe(*id))
    }

    /// The event blocking exit-waiters sleep on.
    #[must_use]
    pub fn exit_event(&self) -> Event {
        self.exit_event
    }

    fn alloc_id(&mut self) -> ActId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert(&mut self, vpe: &Rc<Vpe>) {
        self.by_space.insert(vpe.obj_space(), vpe.id());
        self.by_space.insert(vpe.map_space(), vpe.id());
        self.vpes.insert(vpe.id(), vpe.clone());
    }

    fn remove(&mut self, id: ActId) -> Option<Rc<Vpe>> {
        let vpe = self.vpes.remove(&id)?;
        self.by_space.remove(&vpe.obj_space());
        self.by_space.remove(&vpe.map_space());
        Some(vpe)
    }

    fn retain_listeners<F: FnMut(&ExitWait) -> bool>(&mut self, f: F) {
        self.listeners.retain(f);
    }
}

/// Create a VPE on the tile behind `tile_obj`, charging `kmem`.
///
/// Installs the self/tile/kmem capabilities, reserves the standard
/// endpoint range, and (on scratchpad tiles) configures the standard
/// EPs right away. Returns the new VPE in `Init` state.
pub fn create_vpe(
    ctx: &Rc<Kctx>,
    name: &str,
    tile_obj: Rc<TileObject>,
    kmem: Rc<KMemObject>,
    is_root: bool,
) -> Result<Rc<Vpe>> {
    let tile = tile_obj.tile();
    let mux = ctx
        .tiles
        .get(tile)
        .ok_or(Error::new(Code::InvArgs))?;

    if !tile_obj.has_quota(STD_EPS_COUNT as u32) {
        return Err(Error::new(Code::NoSpace));
    }

    let eps_start = mux.find_eps(STD_EPS_COUNT as u32)?;
    let id = ctx.vpes.borrow_mut().alloc_id();

    let (obj_space, map_space) = {
        let mut cf = ctx.caps.borrow_mut();
        (cf.add_space(), cf.add_space())
    };

    let vpe = Vpe::new(
        id,
        name.to_string(),
        is_root,
        tile_obj.clone(),
        kmem.clone(),
        eps_start,
        obj_space,
        map_space,
        SendQueue::new(QueueId::vpe(id), tile),
    );

    ctx.vpes.borrow_mut().insert(&vpe);

    // initial capabilities; these charge the VPE's own kmem
    let res = (|| -> Result<()> {
        caps::insert_cap(
            ctx,
            &vpe,
            vpe.obj_space(),
            SelRange::new(SEL_VPE),
            KObject::Vpe(Rc::downgrade(&vpe)),
        )?;
        caps::insert_cap(
            ctx,
            &vpe,
            vpe.obj_space(),
            SelRange::new(SEL_TILE),
            KObject::Tile(tile_obj.clone()),
        )?;
        caps::insert_cap(
            ctx,
            &vpe,
            vpe.obj_space(),
            SelRange::new(SEL_KMEM),
            KObject::KMem(kmem.clone()),
        )?;
        Ok(())
    })();
    if let Err(e) = res {
        ctx.vpes.borrow_mut().remove(id);
        return Err(e);
    }

    mux.alloc_eps(eps_start, STD_EPS_COUNT as u32);
    tile_obj.alloc(STD_EPS_COUNT as u32);
    tile_obj.add_vpe();
    mux.add_vpe(id);

    if ctx.platform.tile_desc(tile).has_virtmem() {
        // root page table; the VPE's kmem pays for every PT frame
        if !kmem.alloc(PAGE_SIZE) {
            return Err(Error::new(Code::NoKmem));
        }
        let root = ctx.mem.borrow_mut().allocate(PAGE_SIZE as u64, PAGE_SIZE as u64)?;
        ctx.ktcu
            .borrow_mut()
            .clear(root.global().tile(), root.global().offset(), PAGE_SIZE)?;
        vpe.set_aspace(AddrSpace::new(root.global()));
    } else {
        init_eps(ctx, &vpe)?;
        vpe.set_inited();
    }

    log::info!("created {:?} (eps at {})", vpe, eps_start);
    Ok(vpe)
}

/// Configure the standard endpoints of a scratchpad-tile VPE.
fn init_eps(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>) -> Result<()> {
    let act = vpe.id();
    let eps = vpe.eps_start();
    let kernel_tile = ctx.ktcu.borrow().kernel_tile();
    // VPEs share the two kernel syscall EPs by id parity
    let ksys_ep = if act % 2 == 0 { KSYS_EP0 } else { KSYS_EP1 };

    let mut ktcu = ctx.ktcu.borrow_mut();

    // syscall send EP
    ktcu.config_remote_ep(vpe.tile_id(), eps + SYSC_SEP_OFF, |regs| {
        config_send(regs, act, act as u64, kernel_tile, ksys_ep, SYSC_RBUF_ORD, 1);
    })?;

    // each VPE on the tile owns one slot of the standard rbuf area
    let slot = (eps - crate::tiles::FIRST_USER_EP) as u64 / STD_EPS_COUNT as u64;
    let mut rbuf = RBUF_STD_ADDR + slot * RBUF_STD_SIZE;
    ktcu.config_remote_ep(vpe.tile_id(), eps + SYSC_REP_OFF, |regs| {
        config_recv(regs, act, rbuf, SYSC_RBUF_ORD, SYSC_RBUF_ORD, None);
    })?;
    rbuf += 1 << SYSC_RBUF_ORD;

    // upcall receive EP with one reply slot
    ktcu.config_remote_ep(vpe.tile_id(), eps + UPCALL_REP_OFF, |regs| {
        config_recv(
            regs,
            act,
            rbuf,
            UPCALL_RBUF_ORD,
            UPCALL_RBUF_ORD,
            Some(eps + UPCALL_RPLEP_OFF),
        );
    })?;
    rbuf += 1 << UPCALL_RBUF_ORD;

    // default receive EP
    ktcu.config_remote_ep(vpe.tile_id(), eps + DEF_REP_OFF, |regs| {
        config_recv(regs, act, rbuf, DEF_RBUF_ORD, DEF_RBUF_ORD, None);
    })?;

    Ok(())
}

/// Finish initialisation of a VM-tile VPE and announce it to the tile
/// multiplexer.
pub async fn init_vpe_async(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>) -> Result<()> {
    let mux = ctx.tiles.tilemux(vpe.tile_id());
    if !vpe.inited() {
        // the standard receive buffers of VM tiles must be resolved to
        // global addresses by the multiplexer first
        TileMux::translate_async(ctx, &mux, vpe.id(), RBUF_STD_ADDR, weft_common::Perm::RW)
            .await?;
        init_eps(ctx, vpe)?;
        vpe.set_inited();
    }
    TileMux::vpe_init_async(ctx, &mux, vpe.id(), vpe.eps_start()).await
}

/// Start a VPE: mark it running and tell the tile multiplexer.
pub async fn start_vpe_async(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>) -> Result<()> {
    if vpe.state() != VpeState::Init {
        return Ok(());
    }
    vpe.set_state(VpeState::Running);

    let mux = ctx.tiles.tilemux(vpe.tile_id());
    TileMux::vpe_ctrl_async(ctx, &mux, vpe.id(), TmuxVpeOp::Start).await
}

/// Stop a VPE: force-invalidate its endpoints, capture the exit code,
/// wake waiters, revoke everything, and drop it from the manager.
pub async fn stop_vpe_async(ctx: &Rc<Kctx>, vpe: Rc<Vpe>, exit_code: i32, from_tile: bool) {
    if vpe.state() == VpeState::Dead {
        return;
    }
    log::info!("stopping {:?} (code={})", vpe, exit_code);

    let mux = ctx.tiles.tilemux(vpe.tile_id());

    // make sure the VPE cannot issue TCU commands anymore
    for off in 0..STD_EPS_COUNT {
        mux.invalidate_ep(ctx, vpe.id(), vpe.eps_start() + off, true, false)
            .ok();
    }
    for ep in vpe.take_eps() {
        if let Some(gate) = ep.take_gate() {
            gate.remove_ep();
        }
        mux.invalidate_ep(ctx, vpe.id(), ep.ep(), true, false).ok();
    }

    // no further syscalls from this VPE
    let ksys_ep = if vpe.id() % 2 == 0 { KSYS_EP0 } else { KSYS_EP1 };
    ctx.ktcu.borrow_mut().drop_msgs(ksys_ep, vpe.id() as u64);

    vpe.set_state(VpeState::Dead);
    vpe.set_exit_code(exit_code);

    if !from_tile {
        mux.vpe_ctrl_post(ctx, vpe.id(), TmuxVpeOp::Stop);
    }
    mux.rem_vpe(vpe.id());

    send_exit_notify(ctx);

    caps::revoke_all_async(ctx, &vpe).await;

    // the VPE stays in the manager (dead) so waiters can still fetch
    // its exit code; its owning capability removes it. Roots have no
    // owner and leave right away.
    if vpe.is_root() {
        remove_vpe(ctx, &vpe);
    }
}

/// Destroy a VPE in response to its root capability being revoked.
/// Boxed to allow the revoke/release/destroy recursion.
pub fn destroy_vpe_boxed<'c>(
    ctx: &'c Rc<Kctx>,
    vpe: Rc<Vpe>,
) -> Pin<alloc::boxed::Box<dyn Future<Output = ()> + 'c>> {
    alloc::boxed::Box::pin(async move {
        stop_vpe_async(ctx, vpe.clone(), 1, false).await;
        remove_vpe(ctx, &vpe);
    })
}

fn remove_vpe(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>) {
    let removed = ctx.vpes.borrow_mut().remove(vpe.id());
    if removed.is_none() {
        return;
    }

    let mux = ctx.tiles.tilemux(vpe.tile_id());
    mux.free_eps(vpe.eps_start(), STD_EPS_COUNT as u32);
    vpe.tile_obj().free(STD_EPS_COUNT as u32);
    vpe.tile_obj().rem_vpe();

    // tear down the address space, returning PT frames and quota
    if vpe.aspace().is_some() {
        crate::aspace::destroy(ctx, vpe).ok();
    }

    ctx.vpes
        .borrow_mut()
        .retain_listeners(|l| l.id != vpe.id());
}

/// Check the given selectors of `vpe` for an already-exited VPE.
pub fn fetch_exit(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, sels: &[u64]) -> Option<(CapSel, i32)> {
    for &sel in sels {
        let obj = ctx
            .caps
            .borrow()
            .get(vpe.obj_space(), sel as CapSel)
            .map(|n| n.obj.clone());
        if let Some(KObject::Vpe(w)) = obj {
            let other = match w.upgrade() {
                Some(o) => o,
                None => continue,
            };
            if other.id() == vpe.id() {
                continue;
            }
            if let Some(code) = other.fetch_exit_code() {
                return Some((sel as CapSel, code));
            }
        }
    }
    None
}

/// Block until one of the given VPEs exits, or register an
/// upcall-on-exit when `event != 0`. Mirrors the syscall semantics:
/// the returned pair goes into the reply; `None` means "no result".
pub async fn wait_exit_async(
    ctx: &Rc<Kctx>,
    vpe: &Rc<Vpe>,
    event: u64,
    sels: &[u64],
) -> Option<(CapSel, i32)> {
    let res = loop {
        // check for exits first in case one already happened
        if let Some((sel, code)) = fetch_exit(ctx, vpe, sels) {
            if event != 0 {
                vpe.upcall_vpe_wait(ctx, event, sel, code);
                break Some((INVALID_SEL, 0));
            }
            break Some((sel, code));
        }

        // with an event, don't block; the upcall will report the exit
        if event != 0 || vpe.state() != VpeState::Running {
            break None;
        }

        let exit_event = ctx.vpes.borrow().exit_event();
        ctx.sched.wait_for(exit_event).await;
    };

    // we might have waited before with a different selector list
    ctx.vpes
        .borrow_mut()
        .retain_listeners(|l| l.id != vpe.id());

    match event {
        0 => res,
        _ => {
            if !sels.is_empty() && res.is_none() {
                ctx.vpes.borrow_mut().listeners.push(ExitWait {
                    id: vpe.id(),
                    event,
                    sels: sels.to_vec(),
                });
            }
            None
        },
    }
}

/// Wake blocking exit-waiters and serve upcall-on-exit listeners.
pub fn send_exit_notify(ctx: &Rc<Kctx>) {
    let exit_event = ctx.vpes.borrow().exit_event();
    ctx.sched.notify(exit_event, None);

    // collect the listeners first; upcalls need the borrow released
    let listeners: Vec<(ActId, u64, Vec<u64>)> = ctx
        .vpes
        .borrow()
        .listeners
        .iter()
        .map(|l| (l.id, l.event, l.sels.clone()))
        .collect();

    for (id, event, sels) in listeners {
        let vpe = match ctx.vpes.borrow().vpe(id) {
            Some(v) => v,
            None => continue,
        };
        if let Some((sel, code)) = fetch_exit(ctx, &vpe, &sels) {
            vpe.upcall_vpe_wait(ctx, event, sel, code);
            ctx.vpes
                .borrow_mut()
                .retain_listeners(|l| l.id != id);
        }
    }
}
