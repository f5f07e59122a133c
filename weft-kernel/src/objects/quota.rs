//! Quota objects: kernel memory, tiles, endpoints

use alloc::rc::{Rc, Weak};
use core::cell::{Cell, RefCell};
use core::fmt;

use weft_common::TileId;
use weft_tcu::regs::EpId;

use crate::tiles::Vpe;

use super::gates::GateObject;

/// A kernel-memory quota.
///
/// Every capability allocation and page-table frame of a VPE is
/// debited against its current kmem; releasing restores `left` up to
/// the immutable `quota`.
pub struct KMemObject {
    id: u64,
    quota: usize,
    left: Cell<usize>,
}

impl KMemObject {
    /// Create a quota of `quota` bytes.
    pub fn new(id: u64, quota: usize) -> Rc<Self> {
        let kmem = Rc::new(Self {
            id,
            quota,
            left: Cell::new(quota),
        });
        log::debug!("{:?} created", kmem);
        kmem
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn quota(&self) -> usize {
        self.quota
    }

    #[must_use]
    pub fn left(&self) -> usize {
        self.left.get()
    }

    /// Check whether `size` bytes are available.
    #[must_use]
    pub fn has_quota(&self, size: usize) -> bool {
        self.left.get() >= size
    }

    /// Debit `size` bytes; false if the quota cannot cover them.
    pub fn alloc(&self, size: usize) -> bool {
        if self.has_quota(size) {
            self.left.set(self.left() - size);
            true
        } else {
            false
        }
    }

    /// Credit `size` bytes back.
    pub fn free(&self, size: usize) {
        assert!(self.left() + size <= self.quota);
        self.left.set(self.left() + size);
    }

    /// Give the remaining quota back to the parent on revocation.
    pub fn revoke(&self, parent: &KMemObject) {
        parent.free(self.left());
        assert!(self.left() == self.quota);
    }
}

impl fmt::Debug for KMemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KMem[id={}, quota={:#x}, left={:#x}]",
            self.id,
            self.quota,
            self.left()
        )
    }
}

/// A tile object: the endpoint and VPE quota of one tile.
pub struct TileObject {
    tile: TileId,
    total_eps: u32,
    cur_eps: Cell<u32>,
    cur_vpes: Cell<u32>,
    derived: bool,
}

impl TileObject {
    /// Create a tile object with `eps` endpoints of quota.
    pub fn new(tile: TileId, eps: u32, derived: bool) -> Rc<Self> {
        Rc::new(Self {
            tile,
            total_eps: eps,
            cur_eps: Cell::new(eps),
            cur_vpes: Cell::new(0),
            derived,
        })
    }

    #[must_use]
    pub fn tile(&self) -> TileId {
        self.tile
    }

    #[must_use]
    pub fn eps(&self) -> u32 {
        self.cur_eps.get()
    }

    #[must_use]
    pub fn total_eps(&self) -> u32 {
        self.total_eps
    }

    #[must_use]
    pub fn vpes(&self) -> u32 {
        self.cur_vpes.get()
    }

    #[must_use]
    pub fn derived(&self) -> bool {
        self.derived
    }

    /// Check whether `eps` endpoints of quota are left.
    #[must_use]
    pub fn has_quota(&self, eps: u32) -> bool {
        self.eps() >= eps
    }

    pub fn add_vpe(&self) {
        self.cur_vpes.set(self.vpes() + 1);
    }

    pub fn rem_vpe(&self) {
        assert!(self.vpes() > 0);
        self.cur_vpes.set(self.vpes() - 1);
    }

    /// Debit `eps` endpoints.
    pub fn alloc(&self, eps: u32) {
        log::trace!("{:?}: allocating {} EPs", self, eps);
        assert!(self.eps() >= eps);
        self.cur_eps.set(self.eps() - eps);
    }

    /// Credit `eps` endpoints back.
    pub fn free(&self, eps: u32) {
        assert!(self.eps() + eps <= self.total_eps);
        self.cur_eps.set(self.eps() + eps);
        log::trace!("{:?}: freed {} EPs", self, eps);
    }

    /// Give the endpoint quota back to the parent on revocation.
    pub fn revoke(&self, parent: &TileObject) {
        parent.free(self.eps());
        assert!(self.eps() == self.total_eps);
    }
}

impl fmt::Debug for TileObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tile[{}, eps={}/{}, vpes={}]",
            self.tile,
            self.eps(),
            self.total_eps,
            self.vpes()
        )
    }
}

/// An endpoint object: a TCU endpoint slot (plus reserved reply slots)
/// together with the gate currently installed on it.
pub struct EpObject {
    /// Standard EPs belong to the VPE itself; they are not counted
    /// against the tile quota and not freed individually.
    is_std: bool,
    vpe: Weak<Vpe>,
    ep: EpId,
    replies: u32,
    tile_obj: Rc<TileObject>,
    gate: RefCell<Option<GateObject>>,
}

impl EpObject {
    pub fn new(
        is_std: bool,
        vpe: Weak<Vpe>,
        ep: EpId,
        replies: u32,
        tile_obj: &Rc<TileObject>,
    ) -> Rc<Self> {
        Rc::new(Self {
            is_std,
            vpe,
            ep,
            replies,
            tile_obj: tile_obj.clone(),
            gate: RefCell::new(None),
        })
    }

    #[must_use]
    pub fn is_std(&self) -> bool {
        self.is_std
    }

    #[must_use]
    pub fn vpe(&self) -> Option<Rc<Vpe>> {
        self.vpe.upgrade()
    }

    #[must_use]
    pub fn ep(&self) -> EpId {
        self.ep
    }

    #[must_use]
    pub fn replies(&self) -> u32 {
        self.replies
    }

    #[must_use]
    pub fn tile_id(&self) -> TileId {
        self.tile_obj.tile()
    }

    #[must_use]
    pub fn tile_obj(&self) -> &Rc<TileObject> {
        &self.tile_obj
    }

    /// Whether the currently installed gate is a receive gate.
    #[must_use]
    pub fn is_rgate(&self) -> bool {
        matches!(&*self.gate.borrow(), Some(GateObject::RGate(_)))
    }

    #[must_use]
    pub fn has_gate(&self) -> bool {
        self.gate.borrow().is_some()
    }

    /// Install a gate on this endpoint.
    pub fn set_gate(&self, gate: Option<GateObject>) {
        *self.gate.borrow_mut() = gate;
    }

    /// Take the installed gate out.
    pub fn take_gate(&self) -> Option<GateObject> {
        self.gate.borrow_mut().take()
    }
}

impl fmt::Debug for EpObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ep[{}:{}, replies={}, std={}]",
            self.tile_id(),
            self.ep,
            self.replies,
            self.is_std
        )
    }
}
