//! Address-space management
//!
//! Binds the generic walker from `weft-paging` to the kernel: page
//! tables live in main memory, PTEs are written through the TCU, every
//! PT frame debits the owning VPE's kmem quota, and TLB entries are
//! flushed on the target tile.

use alloc::rc::Rc;

use weft_common::cfg::PAGE_SIZE;
use weft_common::{GlobAddr, PageFlags};
use weft_paging::{PtMem, Pte};
use weft_syscall::{Code, Error, Result};

use crate::mem::Allocation;
use crate::tiles::Vpe;
use crate::workloop::Kctx;

struct KernelPtMem<'c> {
    ctx: &'c Kctx,
    vpe: &'c Rc<Vpe>,
}

impl PtMem for KernelPtMem<'_> {
    fn alloc_table(&mut self) -> Result<GlobAddr> {
        if !self.vpe.kmem().alloc(PAGE_SIZE) {
            return Err(Error::new(Code::NoKmem));
        }
        let frame = match self
            .ctx
            .mem
            .borrow_mut()
            .allocate(PAGE_SIZE as u64, PAGE_SIZE as u64)
        {
            Ok(f) => f,
            Err(e) => {
                self.vpe.kmem().free(PAGE_SIZE);
                return Err(e);
            },
        };
        let glob = frame.global();
        self.ctx
            .ktcu
            .borrow_mut()
            .clear(glob.tile(), glob.offset(), PAGE_SIZE)?;
        Ok(glob)
    }

    fn free_table(&mut self, table: GlobAddr) -> Result<()> {
        self.ctx
            .mem
            .borrow_mut()
            .free(Allocation::new(table, PAGE_SIZE as u64));
        self.vpe.kmem().free(PAGE_SIZE);
        Ok(())
    }

    fn read_pte(&mut self, addr: GlobAddr) -> Result<Pte> {
        self.ctx
            .ktcu
            .borrow_mut()
            .read_obj::<Pte>(addr.tile(), addr.offset())
    }

    fn write_pte(&mut self, addr: GlobAddr, pte: Pte) -> Result<()> {
        self.ctx
            .ktcu
            .borrow_mut()
            .try_write_mem(addr.tile(), addr.offset(), &pte.to_le_bytes())
    }

    fn read_table(&mut self, table: GlobAddr, buf: &mut [Pte]) -> Result<()> {
        self.ctx
            .ktcu
            .borrow_mut()
            .try_read_regs(table.tile(), table.offset(), buf)
    }

    fn flush_tlb(&mut self, virt: u64) -> Result<()> {
        self.ctx
            .ktcu
            .borrow_mut()
            .invalidate_tlb_page(self.vpe.tile_id(), self.vpe.id(), virt)
    }
}

/// Install `pages` PTEs at `virt` of `vpe`, pointing at `phys`.
pub fn map(
    ctx: &Rc<Kctx>,
    vpe: &Rc<Vpe>,
    virt: u64,
    phys: GlobAddr,
    pages: usize,
    flags: PageFlags,
) -> Result<()> {
    let aspace = vpe.aspace().ok_or(Error::new(Code::InvArgs))?;
    let mut mem = KernelPtMem { ctx, vpe };
    aspace.map(&mut mem, virt, phys, pages, flags)
}

/// Remove `pages` PTEs at `virt` of `vpe`.
pub fn unmap(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>, virt: u64, pages: usize) -> Result<()> {
    map(ctx, vpe, virt, GlobAddr::new(0), pages, PageFlags::NONE)
}

/// Tear down the whole tree, freeing every PT frame including the
/// root and crediting the VPE's kmem.
pub fn destroy(ctx: &Rc<Kctx>, vpe: &Rc<Vpe>) -> Result<()> {
    let aspace = vpe.aspace().ok_or(Error::new(Code::InvArgs))?;
    let mut mem = KernelPtMem { ctx, vpe };
    aspace.destroy(&mut mem)
}
