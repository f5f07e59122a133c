//! The table walk

use weft_common::cfg::{LPAGE_SIZE, PAGE_BITS, PAGE_SIZE};
use weft_common::{GlobAddr, PageFlags};
use weft_syscall::Result;

use crate::{
    pte_addr, pte_flags, pte_idx, pte_new, Pte, LEVEL_CNT, PTES_PER_TABLE,
};

const LPAGE_PAGES: usize = LPAGE_SIZE / PAGE_SIZE;

/// Backend performing the actual memory operations of a walk.
pub trait PtMem {
    /// Allocate a zeroed page-table frame.
    fn alloc_table(&mut self) -> Result<GlobAddr>;

    /// Free a page-table frame allocated by [`PtMem::alloc_table`].
    fn free_table(&mut self, table: GlobAddr) -> Result<()>;

    /// Read the PTE at the given global address.
    fn read_pte(&mut self, addr: GlobAddr) -> Result<Pte>;

    /// Write the PTE at the given global address.
    fn write_pte(&mut self, addr: GlobAddr, pte: Pte) -> Result<()>;

    /// Read a whole table frame at once.
    ///
    /// Backends that transfer in bulk should override this.
    fn read_table(&mut self, table: GlobAddr, buf: &mut [Pte]) -> Result<()> {
        for (i, pte) in buf.iter_mut().enumerate() {
            *pte = self.read_pte(table + (i * 8) as u64)?;
        }
        Ok(())
    }

    /// Flush the TLB entry for `virt` on the owning tile.
    fn flush_tlb(&mut self, virt: u64) -> Result<()>;
}

/// One VPE's address space: a root page table in a memory tile.
#[derive(Clone, Copy, Debug)]
pub struct AddrSpace {
    root: GlobAddr,
}

impl AddrSpace {
    /// Create an address space over an existing (zeroed) root table.
    #[must_use]
    pub const fn new(root: GlobAddr) -> Self {
        Self { root }
    }

    /// The root table frame.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> GlobAddr {
        self.root
    }

    /// Map `pages` pages at `virt` to the physical range at `phys`
    /// with the given permissions. Empty `perm` unmaps; unmapping a
    /// non-existent range is a no-op.
    pub fn map<M: PtMem>(
        &self,
        mem: &mut M,
        virt: u64,
        phys: GlobAddr,
        pages: usize,
        perm: PageFlags,
    ) -> Result<()> {
        let mut virt = virt;
        let mut phys = phys;
        let mut left = pages;

        while left > 0 {
            let lpage = !perm.perms().is_empty()
                && left >= LPAGE_PAGES
                && virt as usize % LPAGE_SIZE == 0
                && phys.offset() as usize % LPAGE_SIZE == 0;
            let stepped = self.map_one(mem, virt, phys, perm, lpage)?;
            let step = if stepped { LPAGE_PAGES } else { 1 };
            virt += (step << PAGE_BITS) as u64;
            phys = phys + (step << PAGE_BITS) as u64;
            left -= step.min(left);
        }

        if perm.perms().is_empty() {
            // drop page tables that the unmap left empty
            let virt_start = virt - ((pages as u64) << PAGE_BITS);
            self.prune(mem, self.root, LEVEL_CNT - 1, 0, virt_start, virt)?;
        }
        Ok(())
    }

    /// Install (or clear) one leaf, possibly as a large page. Returns
    /// whether a large page was used.
    fn map_one<M: PtMem>(
        &self,
        mem: &mut M,
        virt: u64,
        phys: GlobAddr,
        perm: PageFlags,
        lpage: bool,
    ) -> Result<bool> {
        let mut target = if lpage { 1 } else { 0 };
        let mut table = self.root;
        let mut level = LEVEL_CNT - 1;

        loop {
            let pte_at = table + pte_idx(virt, level) * 8;

            if level == target {
                let old = mem.read_pte(pte_at)?;
                if level == 1 {
                    if old != 0 && !pte_flags(old).contains(PageFlags::LARGE) {
                        // an inner table already exists here, fall back
                        // to small pages below it
                        target = 0;
                        table = pte_addr(old);
                        level -= 1;
                        continue;
                    }
                }
                let mut flags = perm;
                if level == 1 {
                    flags = flags | PageFlags::LARGE;
                }
                let new = if perm.perms().is_empty() {
                    0
                } else {
                    pte_new(phys, flags)
                };
                if old != new {
                    mem.write_pte(pte_at, new)?;
                    if old != 0 {
                        mem.flush_tlb(virt)?;
                    }
                }
                return Ok(level == 1);
            }

            let pte = mem.read_pte(pte_at)?;
            if pte == 0 {
                if perm.perms().is_empty() {
                    // unmap of a non-existent range
                    return Ok(false);
                }
                let nt = mem.alloc_table()?;
                mem.write_pte(pte_at, pte_new(nt, PageFlags::RWX))?;
                table = nt;
            } else if level == 1 && pte_flags(pte).contains(PageFlags::LARGE) {
                // a large leaf sits above the target level
                if perm.perms().is_empty() {
                    mem.write_pte(pte_at, 0)?;
                    mem.flush_tlb(virt)?;
                    return Ok(true);
                }
                // remapping parts of a large page is not supported
                return Err(weft_syscall::Error::new(weft_syscall::Code::InvArgs));
            } else {
                table = pte_addr(pte);
            }
            level -= 1;
        }
    }

    /// Look up the PTE covering `virt`, along with its level.
    pub fn translate<M: PtMem>(&self, mem: &mut M, virt: u64) -> Result<(Pte, usize)> {
        let mut table = self.root;
        let mut level = LEVEL_CNT - 1;
        loop {
            let pte = mem.read_pte(table + pte_idx(virt, level) * 8)?;
            if level == 0 || pte == 0 || pte_flags(pte).contains(PageFlags::LARGE) {
                return Ok((pte, level));
            }
            table = pte_addr(pte);
            level -= 1;
        }
    }

    /// Free page tables within `[virt_start, virt_end)` that hold no
    /// mappings anymore. Returns whether `table` itself became empty.
    fn prune<M: PtMem>(
        &self,
        mem: &mut M,
        table: GlobAddr,
        level: usize,
        table_base: u64,
        virt_start: u64,
        virt_end: u64,
    ) -> Result<bool> {
        let mut ptes = [0 as Pte; PTES_PER_TABLE];
        mem.read_table(table, &mut ptes)?;

        let entry_size = 1u64 << (PAGE_BITS + level as u32 * crate::LEVEL_BITS);

        let mut empty = true;
        for (i, &pte) in ptes.iter().enumerate() {
            if pte == 0 {
                continue;
            }
            let entry_virt = table_base + i as u64 * entry_size;
            let overlaps = entry_virt < virt_end && entry_virt + entry_size > virt_start;
            if level > 0 && overlaps && !pte_flags(pte).contains(PageFlags::LARGE) {
                let child = pte_addr(pte);
                if self.prune(mem, child, level - 1, entry_virt, virt_start, virt_end)? {
                    mem.free_table(child)?;
                    mem.write_pte(table + i as u64 * 8, 0)?;
                    continue;
                }
            }
            empty = false;
        }
        Ok(empty)
    }

    /// Tear the whole tree down, freeing every table frame including
    /// the root.
    pub fn destroy<M: PtMem>(&self, mem: &mut M) -> Result<()> {
        self.destroy_rec(mem, self.root, LEVEL_CNT - 1)?;
        mem.free_table(self.root)
    }

    fn destroy_rec<M: PtMem>(&self, mem: &mut M, table: GlobAddr, level: usize) -> Result<()> {
        if level == 0 {
            return Ok(());
        }
        let mut ptes = [0 as Pte; PTES_PER_TABLE];
        mem.read_table(table, &mut ptes)?;
        for &pte in ptes.iter() {
            if pte != 0 && !pte_flags(pte).contains(PageFlags::LARGE) {
                let child = pte_addr(pte);
                self.destroy_rec(mem, child, level - 1)?;
                mem.free_table(child)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use alloc::collections::BTreeMap;
    use weft_common::TileId;

    struct TestMem {
        tables: BTreeMap<u64, [Pte; PTES_PER_TABLE]>,
        next: u64,
        flushes: usize,
        frees: usize,
    }

    impl TestMem {
        fn new() -> (Self, AddrSpace) {
            let root = GlobAddr::new_with(TileId::new(8), 0x10_0000);
            let mut m = Self {
                tables: BTreeMap::new(),
                next: 0x20_0000,
                flushes: 0,
                frees: 0,
            };
            m.tables.insert(root.raw(), [0; PTES_PER_TABLE]);
            (m, AddrSpace::new(root))
        }

        fn live_tables(&self) -> usize {
            self.tables.len()
        }
    }

    impl PtMem for TestMem {
        fn alloc_table(&mut self) -> Result<GlobAddr> {
            let addr = GlobAddr::new_with(TileId::new(8), self.next);
            self.next += 0x1000;
            self.tables.insert(addr.raw(), [0; PTES_PER_TABLE]);
            Ok(addr)
        }

        fn free_table(&mut self, table: GlobAddr) -> Result<()> {
            assert!(self.tables.remove(&table.raw()).is_some());
            self.frees += 1;
            Ok(())
        }

        fn read_pte(&mut self, addr: GlobAddr) -> Result<Pte> {
            let base = addr.raw() & !0xFFF;
            let idx = (addr.raw() & 0xFFF) as usize / 8;
            Ok(self.tables[&base][idx])
        }

        fn write_pte(&mut self, addr: GlobAddr, pte: Pte) -> Result<()> {
            let base = addr.raw() & !0xFFF;
            let idx = (addr.raw() & 0xFFF) as usize / 8;
            self.tables.get_mut(&base).unwrap()[idx] = pte;
            Ok(())
        }

        fn flush_tlb(&mut self, _virt: u64) -> Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_map_unmap_roundtrip() {
        let (mut mem, aspace) = TestMem::new();
        let phys = GlobAddr::new_with(TileId::new(8), 0x4_0000);

        aspace.map(&mut mem, 0x1000, phys, 4, PageFlags::RW).unwrap();
        // three intermediate levels were allocated
        assert_eq!(mem.live_tables(), 4);

        let (pte, level) = aspace.translate(&mut mem, 0x2000).unwrap();
        assert_eq!(level, 0);
        assert_eq!(pte_addr(pte), phys + 0x1000);
        assert_eq!(pte_flags(pte).perms(), PageFlags::RW);

        aspace
            .map(&mut mem, 0x1000, GlobAddr::new(0), 4, PageFlags::NONE)
            .unwrap();
        let (pte, _) = aspace.translate(&mut mem, 0x2000).unwrap();
        assert_eq!(pte, 0);
        // the empty tables were pruned again
        assert_eq!(mem.live_tables(), 1);
        assert_eq!(mem.frees, 3);
    }

    #[test]
    fn test_large_page_coalescing() {
        let (mut mem, aspace) = TestMem::new();
        let phys = GlobAddr::new_with(TileId::new(8), 0x20_0000);

        aspace
            .map(&mut mem, 0x20_0000, phys, LPAGE_PAGES + 1, PageFlags::R)
            .unwrap();

        let (pte, level) = aspace.translate(&mut mem, 0x20_0000).unwrap();
        assert_eq!(level, 1);
        assert!(pte_flags(pte).contains(PageFlags::LARGE));
        assert_eq!(pte_addr(pte), phys);

        // the page behind the large region is a small one
        let (pte, level) = aspace.translate(&mut mem, 0x40_0000).unwrap();
        assert_eq!(level, 0);
        assert!(!pte_flags(pte).contains(PageFlags::LARGE));
    }

    #[test]
    fn test_downgrade_flushes_tlb() {
        let (mut mem, aspace) = TestMem::new();
        let phys = GlobAddr::new_with(TileId::new(8), 0x4_0000);

        aspace.map(&mut mem, 0x5000, phys, 2, PageFlags::RW).unwrap();
        assert_eq!(mem.flushes, 0);

        aspace.map(&mut mem, 0x5000, phys, 2, PageFlags::R).unwrap();
        assert_eq!(mem.flushes, 2);

        let (pte, _) = aspace.translate(&mut mem, 0x5000).unwrap();
        assert_eq!(pte_flags(pte).perms(), PageFlags::R);
    }

    #[test]
    fn test_unmap_nonexistent_is_noop() {
        let (mut mem, aspace) = TestMem::new();
        aspace
            .map(&mut mem, 0x9000, GlobAddr::new(0), 8, PageFlags::NONE)
            .unwrap();
        assert_eq!(mem.live_tables(), 1);
        assert_eq!(mem.flushes, 0);
    }

    #[test]
    fn test_destroy_frees_everything() {
        let (mut mem, aspace) = TestMem::new();
        let phys = GlobAddr::new_with(TileId::new(8), 0x4_0000);
        aspace.map(&mut mem, 0x1000, phys, 1, PageFlags::RW).unwrap();
        aspace
            .map(&mut mem, 0x8000_0000, phys, 1, PageFlags::R)
            .unwrap();
        aspace.destroy(&mut mem).unwrap();
        assert_eq!(mem.live_tables(), 0);
    }
}
