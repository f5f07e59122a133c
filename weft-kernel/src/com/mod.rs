//! Send queues and services
//!
//! Outbound kernel messages (service calls, tile-multiplexer sidecalls,
//! upcalls) are serialised per destination receive EP by a
//! [`SendQueue`]: one message in flight at a time, the rest queued on
//! the heap. Replies arrive on the kernel's service-reply EP carrying
//! the queue id as label; the queue notifies the waiting handler's
//! event with the reply bytes and dispatches the next entry.

use alloc::collections::VecDeque;
use alloc::rc::{Rc, Weak};
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;

use weft_common::TileId;
use weft_syscall::{Code, Error, Result};
use weft_tcu::regs::{EpId, Label};

use crate::ktcu::KSRV_EP;
use crate::objects::RGateObject;
use crate::sched::{receive_async, Event};
use crate::workloop::Kctx;

/// Queue-id kinds, encoded into reply labels.
const KIND_SERV: u64 = 1;
const KIND_TMUX: u64 = 2;
const KIND_VPE: u64 = 3;

/// The identity of a send queue, used as reply label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueId(u64);

impl QueueId {
    /// Queue of a registered service.
    #[must_use]
    pub fn serv(id: u64) -> Self {
        Self((KIND_SERV << 48) | id)
    }

    /// Sidecall queue of a tile multiplexer.
    #[must_use]
    pub fn tmux(tile: TileId) -> Self {
        Self((KIND_TMUX << 48) | tile.raw() as u64)
    }

    /// Upcall queue of a VPE.
    #[must_use]
    pub fn vpe(id: u16) -> Self {
        Self((KIND_VPE << 48) | id as u64)
    }

    /// The raw label representation.
    #[must_use]
    pub fn raw(self) -> Label {
        self.0
    }

    /// Decode a reply label back into a queue id.
    #[must_use]
    pub fn from_raw(raw: Label) -> Option<(u64, u64)> {
        let kind = raw >> 48;
        let id = raw & 0xFFFF_FFFF_FFFF;
        match kind {
            KIND_SERV | KIND_TMUX | KIND_VPE => Some((kind, id)),
            _ => None,
        }
    }

    /// Whether this label names a service queue.
    #[must_use]
    pub fn is_serv(kind: u64) -> bool {
        kind == KIND_SERV
    }

    /// Whether this label names a tile-multiplexer queue.
    #[must_use]
    pub fn is_tmux(kind: u64) -> bool {
        kind == KIND_TMUX
    }
}

struct Entry {
    event: Event,
    dst_ep: EpId,
    label: Label,
    /// Teardown tag (session identity for service calls).
    tag: u64,
    msg: Vec<u8>,
}

/// A FIFO of outbound messages to one remote receive EP.
pub struct SendQueue {
    qid: QueueId,
    tile: TileId,
    pending: VecDeque<Entry>,
    inflight: Option<Event>,
    aborted: bool,
}

impl SendQueue {
    /// Create a queue towards `tile`.
    #[must_use]
    pub fn new(qid: QueueId, tile: TileId) -> Self {
        Self {
            qid,
            tile,
            pending: VecDeque::new(),
            inflight: None,
            aborted: false,
        }
    }

    /// Enqueue `msg` for `dst_ep`, returning the event the reply will
    /// notify. Dispatches immediately if nothing is in flight.
    pub fn send(
        &mut self,
        ctx: &Kctx,
        dst_ep: EpId,
        label: Label,
        tag: u64,
        msg: &[u8],
    ) -> Result<Event> {
        if self.aborted {
            return Err(Error::new(Code::RecvGone));
        }

        let event = ctx.sched.alloc_event();
        if self.inflight.is_none() {
            self.do_send(ctx, dst_ep, label, event, msg)?;
        } else {
            self.pending.push_back(Entry {
                event,
                dst_ep,
                label,
                tag,
                msg: msg.to_vec(),
            });
        }
        Ok(event)
    }

    fn do_send(
        &mut self,
        ctx: &Kctx,
        dst_ep: EpId,
        label: Label,
        event: Event,
        msg: &[u8],
    ) -> Result<()> {
        ctx.ktcu
            .borrow_mut()
            .send_to(self.tile, dst_ep, label, msg, self.qid.raw(), KSRV_EP)?;
        self.inflight = Some(event);
        Ok(())
    }

    /// Feed a reply addressed to this queue: wakes the waiter with the
    /// reply bytes and dispatches the next pending entry.
    pub fn received_reply(&mut self, ctx: &Kctx, data: Vec<u8>) {
        if let Some(event) = self.inflight.take() {
            ctx.sched.notify(event, Some(data));
        }

        while let Some(e) = self.pending.pop_front() {
            match self.do_send(ctx, e.dst_ep, e.label, e.event, &e.msg) {
                Ok(()) => break,
                // wake the sender with "gone" and try the next one
                Err(_) => ctx.sched.notify(e.event, None),
            }
        }
    }

    /// Discard pending entries with the given teardown tag.
    pub fn drop_msgs(&mut self, tag: u64) {
        self.pending.retain(|e| e.tag != tag);
    }

    /// Fail all waiters and refuse further sends.
    pub fn abort(&mut self, ctx: &Kctx) {
        if let Some(event) = self.inflight.take() {
            ctx.sched.notify(event, None);
        }
        for e in self.pending.drain(..) {
            ctx.sched.notify(e.event, None);
        }
        self.aborted = true;
    }
}

/// A registered service: name, owning VPE, receive gate, send queue.
pub struct Service {
    id: u64,
    vpe: u16,
    name: String,
    rgate: Rc<RGateObject>,
    queue: RefCell<SendQueue>,
}

impl Service {
    /// Create and register a service.
    pub fn new(ctx: &Kctx, vpe: u16, name: &str, rgate: Rc<RGateObject>) -> Result<Rc<Self>> {
        let (tile, _) = rgate.location().ok_or(Error::new(Code::InvArgs))?;
        let mut list = ctx.services.borrow_mut();
        let id = list.next_id();
        let serv = Rc::new(Self {
            id,
            vpe,
            name: String::from(name),
            rgate,
            queue: RefCell::new(SendQueue::new(QueueId::serv(id), tile)),
        });
        list.register(&serv);
        Ok(serv)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn vpe(&self) -> u16 {
        self.vpe
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn queue(&self) -> &RefCell<SendQueue> {
        &self.queue
    }

    /// Send `msg` to the service and wait for its reply.
    pub async fn send_receive_async(
        ctx: &Rc<Kctx>,
        serv: Rc<Self>,
        label: Label,
        tag: u64,
        msg: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let (_, ep) = serv.rgate.location().ok_or(Error::new(Code::RecvGone))?;
        let event = serv.queue.borrow_mut().send(ctx, ep, label, tag, &msg)?;
        receive_async(&ctx.sched, event).await
    }

    /// Abort the send queue (service going away).
    pub fn abort(&self, ctx: &Kctx) {
        log::debug!("service {} aborted", self.name);
        self.queue.borrow_mut().abort(ctx);
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service[id={}, name={}, vpe={}]", self.id, self.name, self.vpe)
    }
}

/// The registry of live services.
pub struct ServiceList {
    servs: Vec<(u64, Weak<Service>)>,
    next: u64,
}

impl Default for ServiceList {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            servs: Vec::new(),
            next: 1,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    fn register(&mut self, serv: &Rc<Service>) {
        self.servs.push((serv.id(), Rc::downgrade(serv)));
    }

    /// Find a service by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Rc<Service>> {
        self.servs
            .iter()
            .find(|(sid, _)| *sid == id)
            .and_then(|(_, w)| w.upgrade())
    }

    /// Check whether a service with the given name is registered.
    #[must_use]
    pub fn name_exists(&self, name: &str) -> bool {
        self.servs
            .iter()
            .filter_map(|(_, w)| w.upgrade())
            .any(|s| s.name() == name)
    }

    /// Drop a registration.
    pub fn remove(&mut self, id: u64) {
        self.servs.retain(|(sid, _)| *sid != id);
    }
}
