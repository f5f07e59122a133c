//! Events and the cooperative executor
//!
//! Kernel work (a syscall in progress, a tile-multiplexer call) runs as
//! an async task on the single kernel CPU. A task suspends only by
//! awaiting an *event*: a 64-bit identifier that some other piece of
//! kernel code will later notify, optionally delivering reply bytes.
//! All wakeups are routed through the event table, so the `Waker` the
//! executor hands out is inert; the ready queue is the only scheduling
//! state.
//!
//! The executor itself lives in the work loop; this module holds the
//! shared scheduling state ([`Sched`]) that tasks reach through the
//! kernel context.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use weft_syscall::{Code, Error, Result};

/// An event a task can wait for.
pub type Event = u64;

/// A task identifier.
pub type TaskId = u64;

/// Payload delivered with a notification: the reply bytes, or `None`
/// for a plain wakeup (or an aborted wait).
pub type Payload = Option<Vec<u8>>;

#[derive(Clone)]
enum SlotState {
    Waiting,
    Fired(Payload),
}

struct Waiter {
    event: Event,
    task: TaskId,
    slot: Rc<RefCell<SlotState>>,
}

/// Shared scheduling state.
pub struct Sched {
    next_event: Cell<Event>,
    current: Cell<TaskId>,
    ready: RefCell<VecDeque<TaskId>>,
    waiters: RefCell<Vec<Waiter>>,
}

impl Default for Sched {
    fn default() -> Self {
        Self::new()
    }
}

impl Sched {
    /// Create empty scheduling state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_event: Cell::new(1),
            current: Cell::new(0),
            ready: RefCell::new(VecDeque::new()),
            waiters: RefCell::new(Vec::new()),
        }
    }

    /// Allocate a fresh event identifier.
    pub fn alloc_event(&self) -> Event {
        let ev = self.next_event.get();
        self.next_event.set(ev + 1);
        ev
    }

    /// The task currently being polled.
    #[must_use]
    pub fn current(&self) -> TaskId {
        self.current.get()
    }

    /// Mark `task` as the one being polled (executor only).
    pub fn set_current(&self, task: TaskId) {
        self.current.set(task);
    }

    /// Enqueue a task for polling.
    pub fn mark_ready(&self, task: TaskId) {
        self.ready.borrow_mut().push_back(task);
    }

    /// Take the next ready task, if any.
    pub fn take_ready(&self) -> Option<TaskId> {
        self.ready.borrow_mut().pop_front()
    }

    /// Number of tasks blocked on events.
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.waiters.borrow().len()
    }

    /// Wake every task waiting for `event`, handing each a copy of
    /// `payload`.
    pub fn notify(&self, event: Event, payload: Payload) {
        let mut waiters = self.waiters.borrow_mut();
        let mut i = 0;
        while i < waiters.len() {
            if waiters[i].event == event {
                let w = waiters.swap_remove(i);
                *w.slot.borrow_mut() = SlotState::Fired(payload.clone());
                log::trace!("sched: waking task {} for event {:#x}", w.task, event);
                self.ready.borrow_mut().push_back(w.task);
            } else {
                i += 1;
            }
        }
    }

    fn subscribe(&self, event: Event, task: TaskId) -> Rc<RefCell<SlotState>> {
        let slot = Rc::new(RefCell::new(SlotState::Waiting));
        self.waiters.borrow_mut().push(Waiter {
            event,
            task,
            slot: slot.clone(),
        });
        slot
    }

    /// Wait for `event`, yielding the delivered payload.
    pub fn wait_for(&self, event: Event) -> WaitFuture<'_> {
        WaitFuture {
            sched: self,
            event,
            slot: None,
        }
    }
}

/// Future returned by [`Sched::wait_for`].
pub struct WaitFuture<'s> {
    sched: &'s Sched,
    event: Event,
    slot: Option<Rc<RefCell<SlotState>>>,
}

impl Future for WaitFuture<'_> {
    type Output = Payload;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Payload> {
        match &self.slot {
            None => {
                let task = self.sched.current();
                let slot = self.sched.subscribe(self.event, task);
                log::trace!("sched: task {} waits for event {:#x}", task, self.event);
                self.slot = Some(slot);
                Poll::Pending
            },
            Some(slot) => {
                let state = slot.borrow().clone();
                match state {
                    SlotState::Waiting => Poll::Pending,
                    SlotState::Fired(payload) => Poll::Ready(payload),
                }
            },
        }
    }
}

/// Wait for `event` and interpret an empty payload as the object having
/// gone away beneath the waiter.
pub async fn receive_async(sched: &Sched, event: Event) -> Result<Vec<u8>> {
    match sched.wait_for(event).await {
        Some(bytes) => Ok(bytes),
        None => Err(Error::new(Code::RecvGone)),
    }
}

// Wakeups are routed through the event table; the Waker exists only to
// satisfy the Future contract.
fn noop_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    RawWaker::new(core::ptr::null(), &VTABLE)
}

/// Create the executor's inert waker.
#[must_use]
pub fn noop_waker() -> Waker {
    // SAFETY: all vtable functions are no-ops
    unsafe { Waker::from_raw(noop_raw_waker()) }
}
