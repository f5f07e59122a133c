//! VPEs
//!
//! A VPE is a scheduling/protection domain on one tile: two capability
//! tables, a set of standard endpoints, an upcall queue, and (on VM
//! tiles) an address space. The kernel never schedules VPEs itself;
//! it only starts and stops them through the tile multiplexer.

use alloc::rc::Rc;
use alloc::string::String;
use core::cell::{Cell, RefCell};
use core::fmt;

use weft_cap::SpaceId;
use weft_paging::AddrSpace;
use weft_syscall::upcalls;
use weft_syscall::{CapSel, Code, Result, FIRST_FREE_SEL};
use weft_tcu::regs::EpId;
use zerocopy::IntoBytes;

use crate::com::SendQueue;
use crate::objects::{EpObject, KMemObject, TileObject};
use crate::workloop::Kctx;

/// A VPE (activity) id.
pub type ActId = u16;

/// The send EP offset for system calls.
pub const SYSC_SEP_OFF: EpId = 0;
/// The receive EP offset for syscall replies.
pub const SYSC_REP_OFF: EpId = 1;
/// The receive EP offset for upcalls from the kernel.
pub const UPCALL_REP_OFF: EpId = 2;
/// The reply EP offset for upcalls from the kernel.
pub const UPCALL_RPLEP_OFF: EpId = 3;
/// The default receive EP offset.
pub const DEF_REP_OFF: EpId = 4;
/// The number of standard EPs per VPE.
pub const STD_EPS_COUNT: u16 = 5;

/// VPE lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VpeState {
    /// Created, not yet started.
    Init,
    /// Started on its tile.
    Running,
    /// Exited; exit code captured.
    Dead,
}

/// One VPE.
pub struct Vpe {
    id: ActId,
    name: String,
    is_root: bool,
    tile_obj: Rc<TileObject>,
    kmem: Rc<KMemObject>,
    eps_start: EpId,

    state: Cell<VpeState>,
    exit_code: Cell<Option<i32>>,
    first_sel: Cell<CapSel>,
    inited: Cell<bool>,

    obj_space: SpaceId,
    map_space: SpaceId,

    eps: RefCell<alloc::vec::Vec<Rc<EpObject>>>,
    upcalls: RefCell<SendQueue>,
    aspace: Cell<Option<AddrSpace>>,
}

impl Vpe {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ActId,
        name: String,
        is_root: bool,
        tile_obj: Rc<TileObject>,
        kmem: Rc<KMemObject>,
        eps_start: EpId,
        obj_space: SpaceId,
        map_space: SpaceId,
        upcalls: SendQueue,
    ) -> Rc<Self> {
        Rc::new(Self {
            id,
            name,
            is_root,
            tile_obj,
            kmem,
            eps_start,
            state: Cell::new(VpeState::Init),
            exit_code: Cell::new(None),
            first_sel: Cell::new(FIRST_FREE_SEL),
            inited: Cell::new(false),
            obj_space,
            map_space,
            eps: RefCell::new(alloc::vec::Vec::new()),
            upcalls: RefCell::new(upcalls),
            aspace: Cell::new(None),
        })
    }

    #[must_use]
    pub fn id(&self) -> ActId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    #[must_use]
    pub fn tile_obj(&self) -> &Rc<TileObject> {
        &self.tile_obj
    }

    #[must_use]
    pub fn tile_id(&self) -> weft_common::TileId {
        self.tile_obj.tile()
    }

    #[must_use]
    pub fn kmem(&self) -> &Rc<KMemObject> {
        &self.kmem
    }

    #[must_use]
    pub fn eps_start(&self) -> EpId {
        self.eps_start
    }

    #[must_use]
    pub fn state(&self) -> VpeState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: VpeState) {
        self.state.set(state);
    }

    #[must_use]
    pub fn obj_space(&self) -> SpaceId {
        self.obj_space
    }

    #[must_use]
    pub fn map_space(&self) -> SpaceId {
        self.map_space
    }

    #[must_use]
    pub fn first_sel(&self) -> CapSel {
        self.first_sel.get()
    }

    pub fn set_first_sel(&self, sel: CapSel) {
        self.first_sel.set(sel);
    }

    /// Whether the standard EPs have been configured.
    #[must_use]
    pub fn inited(&self) -> bool {
        self.inited.get()
    }

    pub(crate) fn set_inited(&self) {
        self.inited.set(true);
    }

    #[must_use]
    pub fn aspace(&self) -> Option<AddrSpace> {
        self.aspace.get()
    }

    pub(crate) fn set_aspace(&self, aspace: AddrSpace) {
        self.aspace.set(Some(aspace));
    }

    /// Take the captured exit code.
    pub fn fetch_exit_code(&self) -> Option<i32> {
        self.exit_code.replace(None)
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.set(Some(code));
    }

    /// Remember an activated endpoint of this VPE.
    pub fn add_ep(&self, ep: Rc<EpObject>) {
        self.eps.borrow_mut().push(ep);
    }

    /// Forget an endpoint.
    pub fn rem_ep(&self, ep: &Rc<EpObject>) {
        self.eps.borrow_mut().retain(|e| e.ep() != ep.ep());
    }

    /// Take all activated endpoints (for teardown).
    pub(crate) fn take_eps(&self) -> alloc::vec::Vec<Rc<EpObject>> {
        core::mem::take(&mut *self.eps.borrow_mut())
    }

    /// The upcall send queue.
    #[must_use]
    pub fn upcall_queue(&self) -> &RefCell<SendQueue> {
        &self.upcalls
    }

    /// Send a `vpe_wait` upcall.
    pub fn upcall_vpe_wait(&self, ctx: &Kctx, event: u64, vpe_sel: CapSel, exitcode: i32) {
        let msg = upcalls::VpeWait {
            def: upcalls::DefaultUpcall {
                opcode: upcalls::Upcall::VpeWait as u64,
                event,
            },
            error: Code::Success as u64,
            vpe_sel: vpe_sel as u64,
            exitcode: exitcode as u64,
        };
        self.send_upcall(ctx, msg.as_bytes());
    }

    /// Send a `derive_srv` completion upcall.
    pub fn upcall_derive_srv(&self, ctx: &Kctx, event: u64, result: Result<()>) {
        let msg = upcalls::DeriveSrv {
            def: upcalls::DefaultUpcall {
                opcode: upcalls::Upcall::DeriveSrv as u64,
                event,
            },
            error: Code::from(result) as u64,
        };
        self.send_upcall(ctx, msg.as_bytes());
    }

    fn send_upcall(&self, ctx: &Kctx, msg: &[u8]) {
        log::debug!("sending upcall to VPE {}", self.id);
        self.upcalls
            .borrow_mut()
            .send(ctx, self.eps_start + UPCALL_REP_OFF, 0, 0, msg)
            .ok();
    }
}

impl fmt::Debug for Vpe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vpe[id={}, tile={}, name={}, state={:?}]",
            self.id,
            self.tile_id(),
            self.name,
            self.state()
        )
    }
}

impl Drop for Vpe {
    fn drop(&mut self) {
        log::debug!("removed VPE {} [id={}]", self.name, self.id);
    }
}
