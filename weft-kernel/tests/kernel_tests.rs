//! End-to-end kernel tests
//!
//! These tests boot the kernel against the software fabric and drive
//! it the way real user tiles would: syscall messages through the
//! TCU, replies out of the tiles' standard receive buffers, and
//! tile-multiplexer calls for the exit path.

use std::cell::RefCell;
use std::rc::Rc;

use weft_cap::SelRange;
use weft_common::boot::BootInfo;
use weft_common::cfg::{RBUF_STD_ADDR, RBUF_STD_SIZE};
use weft_common::{GlobAddr, Perm, TileDesc, TileId, TileKind};
use weft_kernel::caps;
use weft_kernel::mem::Allocation;
use weft_kernel::objects::{KObject, MGateObject};
use weft_kernel::tiles::{Vpe, DEF_REP_OFF, FIRST_USER_EP, STD_EPS_COUNT, SYSC_REP_OFF, SYSC_SEP_OFF, TMUX_REP, TMUX_SEP};
use weft_kernel::Kernel;
use weft_syscall::ops::{self, CapKind, CapRngDesc, Operation};
use weft_syscall::{tmcalls, Code, INVALID_SEL, SEL_KMEM, SEL_TILE, SEL_VPE};
use weft_tcu::regs::{EpId, EP_COUNT};
use weft_tcu::sim::SimFabric;
use weft_tcu::{Header, Tcu};
use zerocopy::{FromBytes, IntoBytes};

const KERNEL_TILE: TileId = TileId::new(0);
const USER_TILE: TileId = TileId::new(1);
const VM_TILE: TileId = TileId::new(2);

fn setup() -> (Rc<RefCell<SimFabric>>, Kernel) {
    let mut boot = BootInfo::empty();
    boot.kernel_tile = KERNEL_TILE.raw();
    boot.tile_count = 4;
    boot.tiles[0] = TileDesc::new(TileKind::Compute, 0, 0x1_0000);
    boot.tiles[1] = TileDesc::new(TileKind::Compute, 0, 0x1_0000);
    boot.tiles[2] = TileDesc::new(TileKind::ComputeVM, 0, 0x1_0000);
    boot.tiles[3] = TileDesc::new(TileKind::Mem, 0, 0x40_0000);

    let mut fabric = SimFabric::new();
    for i in 0..4u16 {
        fabric.add_tile(TileId::new(i), boot.tiles[i as usize]);
    }
    let fabric = Rc::new(RefCell::new(fabric));

    let tcu = Tcu::new(Box::new(SimFabric::handle(&fabric, KERNEL_TILE)));
    let kernel = Kernel::new(tcu, &boot).expect("kernel boot failed");
    (fabric, kernel)
}

fn read_msg(
    fabric: &Rc<RefCell<SimFabric>>,
    tile: TileId,
    base: u64,
    off: usize,
) -> (Header, Vec<u8>) {
    let mut hdr = [0u8; 32];
    assert_eq!(
        fabric.borrow_mut().read_mem(tile, base + off as u64, &mut hdr),
        Code::Success
    );
    let hdr = Header::read_from_bytes(&hdr[..]).unwrap();
    let mut data = vec![0u8; hdr.length()];
    assert_eq!(
        fabric
            .borrow_mut()
            .read_mem(tile, base + off as u64 + 32, &mut data),
        Code::Success
    );
    (hdr, data)
}

/// The user-tile side of one VPE: drives its TCU like a runtime would.
struct UserVpe {
    fabric: Rc<RefCell<SimFabric>>,
    tcu: Tcu,
    tile: TileId,
    eps_start: EpId,
    rbuf_base: u64,
}

impl UserVpe {
    fn new(fabric: &Rc<RefCell<SimFabric>>, vpe: &Rc<Vpe>) -> Self {
        let slot = (vpe.eps_start() - FIRST_USER_EP) as u64 / STD_EPS_COUNT as u64;
        Self {
            fabric: fabric.clone(),
            tcu: Tcu::new(Box::new(SimFabric::handle(fabric, vpe.tile_id()))),
            tile: vpe.tile_id(),
            eps_start: vpe.eps_start(),
            rbuf_base: RBUF_STD_ADDR + slot * RBUF_STD_SIZE,
        }
    }

    /// Send a syscall and give the kernel a chance to process it.
    fn send_syscall(&mut self, kernel: &Kernel, req: &[u8]) {
        self.tcu
            .send(
                self.eps_start + SYSC_SEP_OFF,
                req,
                0,
                self.eps_start + SYSC_REP_OFF,
            )
            .expect("syscall send failed");
        kernel.run_once();
    }

    /// Fetch the syscall reply, if it arrived.
    fn fetch_reply(&mut self) -> Option<Vec<u8>> {
        let rep_ep = self.eps_start + SYSC_REP_OFF;
        let off = self.tcu.fetch_msg(rep_ep)?;
        let (_, data) = read_msg(&self.fabric, self.tile, self.rbuf_base, off);
        self.tcu.ack_msg(rep_ep, off).unwrap();
        Some(data)
    }

    /// Perform a syscall and return the reply payload.
    fn call(&mut self, kernel: &Kernel, req: &[u8]) -> Vec<u8> {
        self.send_syscall(kernel, req);
        self.fetch_reply().expect("syscall did not reply")
    }

    /// Perform a syscall and return its error code.
    fn call_err(&mut self, kernel: &Kernel, req: &[u8]) -> Code {
        let data = self.call(kernel, req);
        reply_code(&data)
    }

    /// Perform a syscall, asserting success.
    fn call_ok(&mut self, kernel: &Kernel, req: &[u8]) -> Vec<u8> {
        let data = self.call(kernel, req);
        assert_eq!(reply_code(&data), Code::Success);
        data
    }
}

fn reply_code(data: &[u8]) -> Code {
    let mut w = [0u8; 8];
    w.copy_from_slice(&data[..8]);
    Code::from_raw(u64::from_le_bytes(w) as u32)
}

fn create_vpe_req(dst: u32, name: &str) -> ops::CreateVpe {
    let mut req = ops::CreateVpe {
        opcode: Operation::CreateVpe as u64,
        dst: dst as u64,
        tile: SEL_TILE as u64,
        kmem: SEL_KMEM as u64,
        namelen: name.len() as u64,
        name: [0; ops::MAX_NAME_LEN],
    };
    req.name[..name.len()].copy_from_slice(name.as_bytes());
    req
}

#[test]
fn test_create_activate_ping_pong() {
    let (fabric, kernel) = setup();
    let root = kernel.create_vpe("root", USER_TILE).unwrap();
    let mut a = UserVpe::new(&fabric, &root);

    // create the child VPE that will send to us
    let rep = a.call_ok(&kernel, create_vpe_req(0x10, "child").as_bytes());
    let rep = ops::CreateVpeReply::read_from_prefix(&rep).unwrap().0;
    let child = kernel.ctx().vpes.borrow().vpe(rep.id as u16).unwrap();
    assert_eq!(rep.eps_start, child.eps_start() as u64);
    let mut b = UserVpe::new(&fabric, &child);

    // A: receive gate with 4 slots of 64 bytes
    a.call_ok(&kernel, ops::CreateRGate {
        opcode: Operation::CreateRGate as u64,
        dst: 0x30,
        order: 8,
        msg_order: 6,
    }
    .as_bytes());

    // A: send gate towards it, one credit
    a.call_ok(&kernel, ops::CreateSGate {
        opcode: Operation::CreateSGate as u64,
        dst: 0x31,
        rgate: 0x30,
        label: 0x1234,
        credits: 1,
    }
    .as_bytes());

    // A: an EP with the rgate's 4 reply slots, and activate the rgate
    let rep = a.call_ok(&kernel, ops::AllocEp {
        opcode: Operation::AllocEp as u64,
        dst: 0x32,
        vpe: SEL_VPE as u64,
        epid: EP_COUNT as u64,
        replies: 4,
    }
    .as_bytes());
    let ep_r = ops::AllocEpReply::read_from_prefix(&rep).unwrap().0.ep as EpId;

    a.call_ok(&kernel, ops::Activate {
        opcode: Operation::Activate as u64,
        ep: 0x32,
        gate: 0x30,
        rbuf_mem: INVALID_SEL as u64,
        rbuf_off: 0x8000,
    }
    .as_bytes());

    // hand the send gate to the child
    a.call_ok(&kernel, ops::Exchange {
        opcode: Operation::Exchange as u64,
        vpe: 0x10,
        own: CapRngDesc::new(CapKind::Object, 0x31, 1).raw(),
        other: 0x40,
        obtain: 0,
    }
    .as_bytes());

    // B: EP for the send gate, activate it
    let rep = b.call_ok(&kernel, ops::AllocEp {
        opcode: Operation::AllocEp as u64,
        dst: 0x20,
        vpe: SEL_VPE as u64,
        epid: EP_COUNT as u64,
        replies: 0,
    }
    .as_bytes());
    let ep_s = ops::AllocEpReply::read_from_prefix(&rep).unwrap().0.ep as EpId;

    b.call_ok(&kernel, ops::Activate {
        opcode: Operation::Activate as u64,
        ep: 0x20,
        gate: 0x40,
        rbuf_mem: INVALID_SEL as u64,
        rbuf_off: 0,
    }
    .as_bytes());

    // B sends; A receives label, length, and payload
    let b_rep = b.eps_start + DEF_REP_OFF;
    b.tcu.send(ep_s, &[0xDE, 0xAD], 0x77, b_rep).unwrap();

    let off = a.tcu.fetch_msg(ep_r).expect("no message at rgate");
    let (hdr, data) = read_msg(&fabric, USER_TILE, 0x8000, off);
    assert_eq!(hdr.label(), 0x1234);
    assert_eq!(hdr.length(), 2);
    assert_eq!(data, vec![0xDE, 0xAD]);

    // credit exhaustion until A replies
    assert_eq!(
        b.tcu.send(ep_s, &[0x00], 0x77, b_rep).unwrap_err().code(),
        Code::NoCredits
    );

    a.tcu.reply(ep_r, &[0xBE, 0xEF], off).unwrap();

    let off = b.tcu.fetch_msg(b_rep).expect("no reply for B");
    let (hdr, data) = read_msg(&fabric, USER_TILE, b.rbuf_base + (1 << 9) + (1 << 7), off);
    assert!(hdr.is_reply());
    assert_eq!(hdr.label(), 0x77);
    assert_eq!(data, vec![0xBE, 0xEF]);
    b.tcu.ack_msg(b_rep, off).unwrap();

    // the reply restored the credit
    b.tcu.send(ep_s, &[0x01], 0x77, b_rep).unwrap();
}

#[test]
fn test_sgate_activation_waits_for_rgate() {
    let (fabric, kernel) = setup();
    let root = kernel.create_vpe("root", USER_TILE).unwrap();
    let mut a = UserVpe::new(&fabric, &root);

    let rep = a.call_ok(&kernel, create_vpe_req(0x10, "child").as_bytes());
    let rep = ops::CreateVpeReply::read_from_prefix(&rep).unwrap().0;
    let child = kernel.ctx().vpes.borrow().vpe(rep.id as u16).unwrap();
    let mut b = UserVpe::new(&fabric, &child);

    a.call_ok(&kernel, ops::CreateRGate {
        opcode: Operation::CreateRGate as u64,
        dst: 0x30,
        order: 7,
        msg_order: 6,
    }
    .as_bytes());
    a.call_ok(&kernel, ops::CreateSGate {
        opcode: Operation::CreateSGate as u64,
        dst: 0x31,
        rgate: 0x30,
        label: 5,
        credits: 1,
    }
    .as_bytes());
    a.call_ok(&kernel, ops::Exchange {
        opcode: Operation::Exchange as u64,
        vpe: 0x10,
        own: CapRngDesc::new(CapKind::Object, 0x31, 1).raw(),
        other: 0x40,
        obtain: 0,
    }
    .as_bytes());

    b.call_ok(&kernel, ops::AllocEp {
        opcode: Operation::AllocEp as u64,
        dst: 0x20,
        vpe: SEL_VPE as u64,
        epid: EP_COUNT as u64,
        replies: 0,
    }
    .as_bytes());

    // activating the send gate blocks while the rgate is inactive
    b.send_syscall(&kernel, ops::Activate {
        opcode: Operation::Activate as u64,
        ep: 0x20,
        gate: 0x40,
        rbuf_mem: INVALID_SEL as u64,
        rbuf_off: 0,
    }
    .as_bytes());
    assert!(b.fetch_reply().is_none());

    // once A activates the rgate, B's syscall completes
    a.call_ok(&kernel, ops::AllocEp {
        opcode: Operation::AllocEp as u64,
        dst: 0x32,
        vpe: SEL_VPE as u64,
        epid: EP_COUNT as u64,
        replies: 2,
    }
    .as_bytes());
    a.call_ok(&kernel, ops::Activate {
        opcode: Operation::Activate as u64,
        ep: 0x32,
        gate: 0x30,
        rbuf_mem: INVALID_SEL as u64,
        rbuf_off: 0x8000,
    }
    .as_bytes());

    let rep = b.fetch_reply().expect("activate did not resume");
    assert_eq!(reply_code(&rep), Code::Success);
}

#[test]
fn test_revoked_sem_wakes_waiter() {
    let (fabric, kernel) = setup();
    let root = kernel.create_vpe("root", USER_TILE).unwrap();
    let mut a = UserVpe::new(&fabric, &root);

    let rep = a.call_ok(&kernel, create_vpe_req(0x10, "child").as_bytes());
    let rep = ops::CreateVpeReply::read_from_prefix(&rep).unwrap().0;
    let child = kernel.ctx().vpes.borrow().vpe(rep.id as u16).unwrap();
    let mut b = UserVpe::new(&fabric, &child);

    a.call_ok(&kernel, ops::CreateSem {
        opcode: Operation::CreateSem as u64,
        dst: 7,
        value: 0,
    }
    .as_bytes());
    a.call_ok(&kernel, ops::Exchange {
        opcode: Operation::Exchange as u64,
        vpe: 0x10,
        own: CapRngDesc::new(CapKind::Object, 7, 1).raw(),
        other: 7,
        obtain: 0,
    }
    .as_bytes());

    // B blocks in down() on the empty semaphore
    b.send_syscall(&kernel, ops::SemCtrl {
        opcode: Operation::SemCtrl as u64,
        sem: 7,
        op: ops::SemOp::Down as u64,
    }
    .as_bytes());
    assert!(b.fetch_reply().is_none());

    // revoking the semaphore wakes the waiter with "gone"
    a.call_ok(&kernel, ops::Revoke {
        opcode: Operation::Revoke as u64,
        vpe: SEL_VPE as u64,
        caps: CapRngDesc::new(CapKind::Object, 7, 1).raw(),
        own: 1,
    }
    .as_bytes());

    let rep = b.fetch_reply().expect("down did not resume");
    assert_eq!(reply_code(&rep), Code::RecvGone);
}

#[test]
fn test_cascading_revoke_returns_kmem() {
    let (fabric, kernel) = setup();
    let root = kernel.create_vpe("root", USER_TILE).unwrap();
    let mut a = UserVpe::new(&fabric, &root);

    let kmem_before = kernel.ctx().root_kmem.left();
    let vpes_before = kernel.ctx().vpes.borrow().count();

    let rep = a.call_ok(&kernel, create_vpe_req(0x10, "child").as_bytes());
    let rep = ops::CreateVpeReply::read_from_prefix(&rep).unwrap().0;
    let child_id = rep.id as u16;

    // the parent got the VPE cap plus EP range and memory gate
    {
        let ctx = kernel.ctx();
        let caps = ctx.caps.borrow();
        assert!(caps.get(root.obj_space(), 0x10).is_some());
        assert!(caps.get(root.obj_space(), 0x11).is_some());
        assert!(caps.get(root.obj_space(), 0x1F).is_some());
        assert!(caps.get(root.obj_space(), 0x20).is_some());
    }
    assert!(kernel.ctx().root_kmem.left() < kmem_before);

    // revoking the VPE cap destroys the whole subtree and the VPE
    a.call_ok(&kernel, ops::Revoke {
        opcode: Operation::Revoke as u64,
        vpe: SEL_VPE as u64,
        caps: CapRngDesc::new(CapKind::Object, 0x10, 1).raw(),
        own: 1,
    }
    .as_bytes());
    kernel.run_once();

    {
        let ctx = kernel.ctx();
        assert!(ctx.vpes.borrow().vpe(child_id).is_none());
        let caps = ctx.caps.borrow();
        assert!(caps.get(root.obj_space(), 0x10).is_none());
        assert!(caps.get(root.obj_space(), 0x11).is_none());
        assert!(caps.get(root.obj_space(), 0x20).is_none());
    }
    assert_eq!(kernel.ctx().vpes.borrow().count(), vpes_before);
    assert_eq!(kernel.ctx().root_kmem.left(), kmem_before);
}

#[test]
fn test_vpe_wait_resumes_on_exit() {
    let (fabric, kernel) = setup();
    let root = kernel.create_vpe("root", USER_TILE).unwrap();
    let mut a = UserVpe::new(&fabric, &root);

    let rep = a.call_ok(&kernel, create_vpe_req(0x10, "child").as_bytes());
    let rep = ops::CreateVpeReply::read_from_prefix(&rep).unwrap().0;
    let child_id = rep.id;

    // the parent waits before the child exits: suspends
    let mut wait = ops::VpeWait {
        opcode: Operation::VpeWait as u64,
        event: 0,
        count: 1,
        sels: [0; ops::MAX_WAIT_VPES],
    };
    wait.sels[0] = 0x10;
    a.send_syscall(&kernel, wait.as_bytes());
    assert!(a.fetch_reply().is_none());

    // the tile multiplexer reports the child's exit with code 7
    let mut tmux = Tcu::new(Box::new(SimFabric::handle(&fabric, USER_TILE)));
    tmux.send(
        TMUX_SEP,
        tmcalls::Exit {
            op: tmcalls::TmuxCall::Exit as u64,
            vpe: child_id,
            code: 7,
        }
        .as_bytes(),
        0,
        TMUX_REP,
    )
    .unwrap();
    kernel.run_once();

    let rep = a.fetch_reply().expect("vpe_wait did not resume");
    let rep = ops::VpeWaitReply::read_from_prefix(&rep).unwrap().0;
    assert_eq!(reply_code(rep.as_bytes()), Code::Success);
    assert_eq!(rep.vpe_sel, 0x10);
    assert_eq!(rep.exitcode, 7);

    // the multiplexer's own call was answered as well
    assert!(tmux.fetch_msg(TMUX_REP).is_some());
}

#[test]
fn test_create_map_and_revoke_roundtrip() {
    let (fabric, kernel) = setup();
    let root = kernel.create_vpe("root", USER_TILE).unwrap();
    let mut a = UserVpe::new(&fabric, &root);

    // a VM-tile VPE whose page tables the kernel manages
    let vm = kernel.create_vpe("vm", VM_TILE).unwrap();
    let ctx = kernel.ctx().clone();

    // hand root a cap for the VM VPE and a 4-page memory gate
    caps::insert_cap(
        &ctx,
        &root,
        root.obj_space(),
        SelRange::new(0x50),
        KObject::Vpe(Rc::downgrade(&vm)),
    )
    .unwrap();
    let phys = ctx
        .mem
        .borrow_mut()
        .allocate(0x4000, 0x1000)
        .unwrap()
        .global();
    caps::insert_cap(
        &ctx,
        &root,
        root.obj_space(),
        SelRange::new(0x51),
        KObject::MGate(MGateObject::new(
            Allocation::new(phys, 0x4000),
            Perm::RW,
            false,
        )),
    )
    .unwrap();

    let kmem_before = kernel.ctx().root_kmem.left();

    // map 4 pages at virt 0x1000
    a.call_ok(&kernel, ops::CreateMap {
        opcode: Operation::CreateMap as u64,
        dst: 1,
        vpe: 0x50,
        mgate: 0x51,
        first: 0,
        pages: 4,
        perms: Perm::RW.bits() as u64,
    }
    .as_bytes());

    // three intermediate PT frames were charged
    assert_eq!(
        kernel.ctx().root_kmem.left(),
        kmem_before - 3 * 0x1000
    );

    // walk the tree in fabric memory and check the leaf PTE
    let leaf = walk(&fabric, vm.aspace().unwrap().root(), 0x2000);
    assert_eq!(weft_paging::pte_addr(leaf), phys + 0x1000);
    assert!(weft_paging::pte_flags(leaf).contains(weft_common::PageFlags::RW));

    // revoking the map zeroes the PTEs and credits the PT frames back
    a.call_ok(&kernel, ops::Revoke {
        opcode: Operation::Revoke as u64,
        vpe: 0x50,
        caps: CapRngDesc::new(CapKind::Map, 1, 4).raw(),
        own: 1,
    }
    .as_bytes());

    let leaf = walk(&fabric, vm.aspace().unwrap().root(), 0x2000);
    assert_eq!(leaf, 0);
    assert_eq!(kernel.ctx().root_kmem.left(), kmem_before);
}

/// Walk the page tables in fabric memory.
fn walk(fabric: &Rc<RefCell<SimFabric>>, root: GlobAddr, virt: u64) -> weft_paging::Pte {
    let mut table = root;
    for level in (0..weft_paging::LEVEL_CNT).rev() {
        let addr = table + weft_paging::pte_idx(virt, level) * 8;
        let mut w = [0u8; 8];
        assert_eq!(
            fabric
                .borrow_mut()
                .read_mem(addr.tile(), addr.offset(), &mut w),
            Code::Success
        );
        let pte = u64::from_le_bytes(w);
        if level == 0 || pte == 0 {
            return pte;
        }
        table = weft_paging::pte_addr(pte);
    }
    unreachable!();
}

#[test]
fn test_quota_introspection_and_derive() {
    let (fabric, kernel) = setup();
    let root = kernel.create_vpe("root", USER_TILE).unwrap();
    let mut a = UserVpe::new(&fabric, &root);

    let rep = a.call_ok(&kernel, ops::KMemQuota {
        opcode: Operation::KMemQuota as u64,
        kmem: SEL_KMEM as u64,
    }
    .as_bytes());
    let q = ops::QuotaReply::read_from_prefix(&rep).unwrap().0;
    assert!(q.left <= q.total);
    let parent_left = q.left;

    // derive a child quota of 64 KiB
    a.call_ok(&kernel, ops::DeriveKMem {
        opcode: Operation::DeriveKMem as u64,
        kmem: SEL_KMEM as u64,
        dst: 8,
        quota: 0x1_0000,
    }
    .as_bytes());

    let rep = a.call_ok(&kernel, ops::KMemQuota {
        opcode: Operation::KMemQuota as u64,
        kmem: 8,
    }
    .as_bytes());
    let child = ops::QuotaReply::read_from_prefix(&rep).unwrap().0;
    assert_eq!(child.total, 0x1_0000);
    assert_eq!(child.left, 0x1_0000);

    // revoking the child returns its quota to the parent
    a.call_ok(&kernel, ops::Revoke {
        opcode: Operation::Revoke as u64,
        vpe: SEL_VPE as u64,
        caps: CapRngDesc::new(CapKind::Object, 8, 1).raw(),
        own: 1,
    }
    .as_bytes());

    let rep = a.call_ok(&kernel, ops::KMemQuota {
        opcode: Operation::KMemQuota as u64,
        kmem: SEL_KMEM as u64,
    }
    .as_bytes());
    let q = ops::QuotaReply::read_from_prefix(&rep).unwrap().0;
    assert_eq!(q.left, parent_left);

    // tile quota reflects the standard EPs
    let rep = a.call_ok(&kernel, ops::TileQuota {
        opcode: Operation::TileQuota as u64,
        tile: SEL_TILE as u64,
    }
    .as_bytes());
    let t = ops::QuotaReply::read_from_prefix(&rep).unwrap().0;
    assert!(t.left < t.total);
}

#[test]
fn test_noop_and_unknown_opcode() {
    let (fabric, kernel) = setup();
    let root = kernel.create_vpe("root", USER_TILE).unwrap();
    let mut a = UserVpe::new(&fabric, &root);

    assert_eq!(
        a.call_err(&kernel, ops::Noop {
            opcode: Operation::Noop as u64,
        }
        .as_bytes()),
        Code::Success
    );

    assert_eq!(
        a.call_err(&kernel, &u64::to_le_bytes(0xBAD)),
        Code::InvArgs
    );
}

#[test]
fn test_reserved_selectors_not_revocable() {
    let (fabric, kernel) = setup();
    let root = kernel.create_vpe("root", USER_TILE).unwrap();
    let mut a = UserVpe::new(&fabric, &root);

    assert_eq!(
        a.call_err(&kernel, ops::Revoke {
            opcode: Operation::Revoke as u64,
            vpe: SEL_VPE as u64,
            caps: CapRngDesc::new(CapKind::Object, SEL_VPE, 1).raw(),
            own: 1,
        }
        .as_bytes()),
        Code::InvArgs
    );
}
