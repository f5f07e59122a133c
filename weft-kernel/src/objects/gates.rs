//! Gate objects
//!
//! A gate is the kernel-side description of one side of a channel.
//! Installing a gate onto a TCU endpoint (via the `activate` syscall)
//! makes it usable; the gate then remembers its endpoint so that
//! revocation can find and invalidate it.

use alloc::rc::{Rc, Weak};
use core::cell::{Cell, RefCell};
use core::fmt;

use weft_common::Perm;
use weft_tcu::regs::{EpId, Label};
use weft_common::TileId;

use crate::mem::Allocation;
use crate::sched::Event;

use super::quota::EpObject;

/// The endpoint a gate is currently installed on, if any.
pub struct GateEp {
    ep: Weak<EpObject>,
}

impl GateEp {
    fn new() -> Self {
        Self { ep: Weak::new() }
    }

    /// The endpoint object, if the gate is installed.
    #[must_use]
    pub fn get_ep(&self) -> Option<Rc<EpObject>> {
        self.ep.upgrade()
    }

    /// Remember the endpoint the gate was installed on.
    pub fn set_ep(&mut self, ep: &Rc<EpObject>) {
        self.ep = Rc::downgrade(ep);
    }

    /// Forget the endpoint.
    pub fn remove_ep(&mut self) {
        self.ep = Weak::new();
    }
}

/// A gate as seen from the endpoint it is installed on.
pub enum GateObject {
    RGate(Rc<RGateObject>),
    SGate(Rc<SGateObject>),
    MGate(Rc<MGateObject>),
}

impl GateObject {
    /// Tell the gate which endpoint it is installed on.
    pub fn set_ep(&self, ep: &Rc<EpObject>) {
        match self {
            Self::RGate(g) => g.gate_ep_mut().set_ep(ep),
            Self::SGate(g) => g.gate_ep_mut().set_ep(ep),
            Self::MGate(g) => g.gate_ep_mut().set_ep(ep),
        }
    }

    /// Tell the gate its endpoint is gone.
    pub fn remove_ep(&self) {
        match self {
            Self::RGate(g) => g.gate_ep_mut().remove_ep(),
            Self::SGate(g) => g.gate_ep_mut().remove_ep(),
            Self::MGate(g) => g.gate_ep_mut().remove_ep(),
        }
    }
}

/// A receive gate: a receive buffer once activated.
pub struct RGateObject {
    gep: RefCell<GateEp>,
    loc: Cell<Option<(TileId, EpId)>>,
    addr: Cell<u64>,
    order: u32,
    msg_order: u32,
    valid: Cell<bool>,
    event: Event,
}

impl RGateObject {
    /// Create a receive gate with the given buffer and slot orders.
    pub fn new(order: u32, msg_order: u32, event: Event) -> Rc<Self> {
        Rc::new(Self {
            gep: RefCell::new(GateEp::new()),
            loc: Cell::new(None),
            addr: Cell::new(0),
            order,
            msg_order,
            valid: Cell::new(true),
            event,
        })
    }

    pub fn gate_ep_mut(&self) -> core::cell::RefMut<'_, GateEp> {
        self.gep.borrow_mut()
    }

    /// Where the gate is activated, if anywhere.
    #[must_use]
    pub fn location(&self) -> Option<(TileId, EpId)> {
        self.loc.get()
    }

    /// The receive buffer address.
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.addr.get()
    }

    #[must_use]
    pub fn order(&self) -> u32 {
        self.order
    }

    #[must_use]
    pub fn msg_order(&self) -> u32 {
        self.msg_order
    }

    /// Number of message slots.
    #[must_use]
    pub fn slots(&self) -> u32 {
        1 << (self.order - self.msg_order)
    }

    /// Whether the gate has been bound to an endpoint.
    #[must_use]
    pub fn activated(&self) -> bool {
        self.loc.get().is_some()
    }

    /// Whether the gate still exists from the point of view of send
    /// gates derived from it.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid.get()
    }

    /// Mark the gate gone (revocation).
    pub fn invalidate(&self) {
        self.valid.set(false);
    }

    /// Record the activation.
    pub fn activate(&self, tile: TileId, ep: EpId, addr: u64) {
        self.loc.set(Some((tile, ep)));
        self.addr.set(addr);
    }

    /// Drop the activation.
    pub fn deactivate(&self) {
        self.loc.set(None);
        self.addr.set(0);
    }

    /// The event send-gate activations wait on.
    #[must_use]
    pub fn event(&self) -> Event {
        self.event
    }
}

impl fmt::Debug for RGateObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RGate[loc={:?}, addr={:#x}, ord={}, msg_ord={}]",
            self.loc.get(),
            self.addr.get(),
            self.order,
            self.msg_order
        )
    }
}

/// A send gate: the right to send into a receive gate.
pub struct SGateObject {
    gep: RefCell<GateEp>,
    rgate: Rc<RGateObject>,
    label: Label,
    credits: u32,
}

impl SGateObject {
    /// Create a send gate bound to `rgate`.
    pub fn new(rgate: &Rc<RGateObject>, label: Label, credits: u32) -> Rc<Self> {
        Rc::new(Self {
            gep: RefCell::new(GateEp::new()),
            rgate: rgate.clone(),
            label,
            credits,
        })
    }

    pub fn gate_ep_mut(&self) -> core::cell::RefMut<'_, GateEp> {
        self.gep.borrow_mut()
    }

    #[must_use]
    pub fn rgate(&self) -> &Rc<RGateObject> {
        &self.rgate
    }

    #[must_use]
    pub fn label(&self) -> Label {
        self.label
    }

    #[must_use]
    pub fn credits(&self) -> u32 {
        self.credits
    }

    /// Whether the gate is installed on some endpoint.
    #[must_use]
    pub fn activated(&self) -> bool {
        self.gep.borrow().get_ep().is_some()
    }
}

impl fmt::Debug for SGateObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SGate[rgate={:?}, lbl={:#x}, crd={}]",
            self.rgate.location(),
            self.label,
            self.credits
        )
    }
}

/// A memory gate: access to a range of physical memory.
pub struct MGateObject {
    gep: RefCell<GateEp>,
    mem: Allocation,
    perms: Perm,
    /// Whether the memory came from the main-memory allocator and is
    /// returned there on destruction.
    owned: bool,
}

impl MGateObject {
    /// Create a memory gate over `mem`.
    pub fn new(mem: Allocation, perms: Perm, owned: bool) -> Rc<Self> {
        Rc::new(Self {
            gep: RefCell::new(GateEp::new()),
            mem,
            perms,
            owned,
        })
    }

    pub fn gate_ep_mut(&self) -> core::cell::RefMut<'_, GateEp> {
        self.gep.borrow_mut()
    }

    #[must_use]
    pub fn allocation(&self) -> Allocation {
        self.mem
    }

    #[must_use]
    pub fn addr(&self) -> weft_common::GlobAddr {
        self.mem.global()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.mem.size()
    }

    #[must_use]
    pub fn perms(&self) -> Perm {
        self.perms
    }

    #[must_use]
    pub fn owned(&self) -> bool {
        self.owned
    }

    /// Whether the gate is installed on some endpoint.
    #[must_use]
    pub fn activated(&self) -> bool {
        self.gep.borrow().get_ep().is_some()
    }
}

impl fmt::Debug for MGateObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MGate[addr={:?}, size={:#x}, perm={:?}]",
            self.addr(),
            self.size(),
            self.perms
        )
    }
}
