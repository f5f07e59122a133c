//! Kernel context and work loop
//!
//! All mutable kernel state hangs off a single [`Kctx`] that handlers
//! reach through an `Rc`; within one task, it is the sole mutable root
//! (the cooperative invariant makes the `RefCell`s uncontended as long
//! as no borrow is held across a suspension point).
//!
//! The work loop fetches messages from the four kernel receive
//! endpoints, spawns or wakes handler tasks, and runs ready tasks to
//! completion or to their next suspension. When no work is available
//! it issues the TCU's sleep command, which returns when a message
//! arrives.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use weft_cap::CapForest;
use weft_common::boot::BootInfo;
use weft_common::cfg::{SYSC_RBUF_ORD, TMUX_RBUF_ORD};
use weft_common::TileId;
use weft_syscall::Result;
use weft_tcu::Tcu;

use crate::com::{QueueId, ServiceList};
use crate::ktcu::{Ktcu, RecvdMsg, KSRV_EP, KSYS_EP0, KSYS_EP1, KTMUX_EP};
use crate::mem::MainMemory;
use crate::objects::{KMemObject, KObject};
use crate::platform::Platform;
use crate::sched::{noop_waker, Sched, TaskId};
use crate::syscall;
use crate::tiles::{self, TileMng, TileMux, Vpe, VpeMng, VpeState};

/// Kernel-memory quota of the root VPE.
const ROOT_KMEM_QUOTA: usize = 4 * 1024 * 1024;

/// The kernel's shared state.
pub struct Kctx {
    pub platform: Platform,
    pub ktcu: RefCell<Ktcu>,
    pub mem: RefCell<MainMemory>,
    pub caps: RefCell<CapForest<KObject>>,
    pub vpes: RefCell<VpeMng>,
    pub tiles: TileMng,
    pub services: RefCell<ServiceList>,
    pub sched: Sched,
    pub root_kmem: Rc<KMemObject>,
    next_obj_id: Cell<u64>,
}

impl Kctx {
    /// Allocate a kernel-wide object id (kmem instances etc.).
    pub fn alloc_obj_id(&self) -> u64 {
        let id = self.next_obj_id.get();
        self.next_obj_id.set(id + 1);
        id
    }
}

type Task = Pin<Box<dyn Future<Output = ()>>>;

/// The kernel: context plus executor.
pub struct Kernel {
    ctx: Rc<Kctx>,
    tasks: RefCell<BTreeMap<TaskId, Task>>,
    next_task: Cell<TaskId>,
}

impl Kernel {
    /// Bring the kernel up: build the platform view, seed the memory
    /// allocator, configure the kernel endpoints, and initialise the
    /// tile multiplexers.
    pub fn new(tcu: Tcu, boot: &BootInfo) -> Result<Self> {
        let platform = Platform::new(boot);
        let mut ktcu = Ktcu::new(tcu, platform.kernel_tile());

        // the four kernel receive EPs; syscall and tile-multiplexer
        // EPs carry reply slots for the kernel's replies
        ktcu.recv_msgs(KSYS_EP0, SYSC_RBUF_ORD + 5, SYSC_RBUF_ORD, true)?;
        ktcu.recv_msgs(KSYS_EP1, SYSC_RBUF_ORD + 5, SYSC_RBUF_ORD, true)?;
        ktcu.recv_msgs(KSRV_EP, 12, 8, false)?;
        ktcu.recv_msgs(KTMUX_EP, TMUX_RBUF_ORD + 4, TMUX_RBUF_ORD, true)?;

        let mem = seed_memory(&platform, boot);

        let mut tiles = TileMng::new();
        for tile in platform.user_tiles() {
            let mux = TileMux::new(tile);
            mux.init(&mut ktcu)?;
            tiles.add(mux);
        }

        let sched = Sched::new();
        let exit_event = sched.alloc_event();

        let ctx = Rc::new(Kctx {
            platform,
            ktcu: RefCell::new(ktcu),
            mem: RefCell::new(mem),
            caps: RefCell::new(CapForest::new()),
            vpes: RefCell::new(VpeMng::new(exit_event)),
            tiles,
            services: RefCell::new(ServiceList::new()),
            sched,
            root_kmem: KMemObject::new(0, ROOT_KMEM_QUOTA),
            next_obj_id: Cell::new(1),
        });

        log::info!("kernel is ready on {}", ctx.platform.kernel_tile());

        Ok(Self {
            ctx,
            tasks: RefCell::new(BTreeMap::new()),
            next_task: Cell::new(1),
        })
    }

    /// The kernel context.
    #[must_use]
    pub fn ctx(&self) -> &Rc<Kctx> {
        &self.ctx
    }

    /// Create a root-level VPE on `tile`, backed by the root kernel
    /// memory. Used by the boot path (and test harnesses) to bring up
    /// the first user program.
    pub fn create_vpe(&self, name: &str, tile: TileId) -> Result<Rc<Vpe>> {
        let mux = self
            .ctx
            .tiles
            .get(tile)
            .ok_or(weft_syscall::Error::new(weft_syscall::Code::InvArgs))?;
        let vpe = tiles::create_vpe(
            &self.ctx,
            name,
            mux.tile_obj().clone(),
            self.ctx.root_kmem.clone(),
            true,
        )?;
        // the boot path loads and starts root itself
        vpe.set_state(VpeState::Running);
        Ok(vpe)
    }

    fn spawn<F: Future<Output = ()> + 'static>(&self, fut: F) {
        let id = self.next_task.get();
        self.next_task.set(id + 1);
        self.tasks.borrow_mut().insert(id, Box::pin(fut));
        self.ctx.sched.mark_ready(id);
    }

    fn poll_task(&self, id: TaskId) {
        let mut task = match self.tasks.borrow_mut().remove(&id) {
            Some(t) => t,
            None => return,
        };
        self.ctx.sched.set_current(id);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        if task.as_mut().poll(&mut cx) == Poll::Pending {
            self.tasks.borrow_mut().insert(id, task);
        }
    }

    fn route_reply(&self, msg: RecvdMsg) {
        let ctx = &self.ctx;
        let (kind, id) = match QueueId::from_raw(msg.label) {
            Some(k) => k,
            None => {
                log::warn!("dropping reply with unknown label {:#x}", msg.label);
                return;
            },
        };

        if QueueId::is_serv(kind) {
            let serv = ctx.services.borrow().get(id);
            if let Some(serv) = serv {
                serv.queue().borrow_mut().received_reply(ctx, msg.data);
            }
        } else if QueueId::is_tmux(kind) {
            if let Some(mux) = ctx.tiles.get(TileId::new(id as u16)) {
                mux.queue().borrow_mut().received_reply(ctx, msg.data);
            }
        } else {
            let vpe = ctx.vpes.borrow().vpe(id as u16);
            if let Some(vpe) = vpe {
                vpe.upcall_queue().borrow_mut().received_reply(ctx, msg.data);
            }
        }
    }

    /// One iteration of the work loop: fetch messages from all four
    /// receive EPs, then run ready tasks until they all suspend.
    /// Returns whether any work was done.
    pub fn run_once(&self) -> bool {
        let ctx = &self.ctx;
        let mut progress = false;

        for ep in [KSYS_EP0, KSYS_EP1] {
            loop {
                let msg = ctx.ktcu.borrow_mut().fetch_msg(ep);
                match msg {
                    Some(msg) => {
                        progress = true;
                        self.spawn(syscall::handle_async(ctx.clone(), msg));
                    },
                    None => break,
                }
            }
        }

        loop {
            let msg = ctx.ktcu.borrow_mut().fetch_msg(KSRV_EP);
            match msg {
                Some(msg) => {
                    progress = true;
                    let off = msg.off;
                    self.route_reply(msg);
                    ctx.ktcu.borrow_mut().ack_msg(KSRV_EP, off);
                },
                None => break,
            }
        }

        loop {
            let msg = ctx.ktcu.borrow_mut().fetch_msg(KTMUX_EP);
            match msg {
                Some(msg) => {
                    progress = true;
                    self.spawn(TileMux::handle_call_async(ctx.clone(), msg));
                },
                None => break,
            }
        }

        while let Some(id) = ctx.sched.take_ready() {
            progress = true;
            self.poll_task(id);
        }

        progress
    }

    /// Run until the last VPE is gone, sleeping through idle periods.
    pub fn run(&self) {
        loop {
            if !self.run_once() {
                if self.ctx.vpes.borrow().count() == 0 && self.tasks.borrow().is_empty() {
                    break;
                }
                self.ctx.ktcu.borrow_mut().sleep();
            }
        }
        log::info!("shutting down");
    }
}

/// Seed the main-memory allocator with the memory tiles, leaving out
/// the regions occupied by boot modules.
fn seed_memory(platform: &Platform, boot: &BootInfo) -> MainMemory {
    let mut mem = MainMemory::new();
    for (tile, desc) in platform.mem_tiles() {
        // collect the module ranges on this tile, sorted by offset
        let mut mods: alloc::vec::Vec<(u64, u64)> = boot
            .mods()
            .iter()
            .filter(|m| m.addr.tile() == tile)
            .map(|m| (m.addr.offset(), m.size))
            .collect();
        mods.sort_unstable();

        let mut off = 0u64;
        for (mstart, msize) in mods {
            if mstart > off {
                mem.add_region(tile, off, mstart - off);
            }
            off = mstart + msize;
        }
        if off < desc.mem_size() as u64 {
            mem.add_region(tile, off, desc.mem_size() as u64 - off);
        }
    }
    mem
}
