//! Main-memory allocator
//!
//! Tracks the free space of every memory tile as a sorted list of
//! extents. Allocation is first-fit with power-of-two alignment; free
//! coalesces adjacent extents, so the lists stay pairwise-disjoint,
//! sorted, and with no two neighbours touching.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use weft_common::{GlobAddr, GlobOff, TileId};
use weft_syscall::{Code, Error, Result};

/// A chunk of main memory handed out by the allocator.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    glob: GlobAddr,
    size: GlobOff,
}

impl Allocation {
    /// Describe a memory region without involving the allocator (for
    /// derived gates over foreign memory).
    #[must_use]
    pub const fn new(glob: GlobAddr, size: GlobOff) -> Self {
        Self { glob, size }
    }

    /// The region's global address.
    #[inline]
    #[must_use]
    pub const fn global(self) -> GlobAddr {
        self.glob
    }

    /// The region's size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(self) -> GlobOff {
        self.size
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Alloc[{:?}, {:#x}]", self.glob, self.size)
    }
}

#[derive(Clone, Copy)]
struct Extent {
    off: GlobOff,
    size: GlobOff,
}

/// The free space of all memory tiles.
pub struct MainMemory {
    tiles: BTreeMap<u16, Vec<Extent>>,
}

impl Default for MainMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MainMemory {
    /// Create an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tiles: BTreeMap::new(),
        }
    }

    /// Register a free region of a memory tile.
    pub fn add_region(&mut self, tile: TileId, off: GlobOff, size: GlobOff) {
        log::info!("mem: adding {:?} {:#x}..{:#x}", tile, off, off + size);
        let exts = self.tiles.entry(tile.raw()).or_default();
        exts.push(Extent { off, size });
        exts.sort_by_key(|e| e.off);
    }

    /// Allocate `size` bytes aligned to `align` (a power of two) from
    /// any memory tile, first fit.
    pub fn allocate(&mut self, size: GlobOff, align: GlobOff) -> Result<Allocation> {
        let tiles: Vec<u16> = self.tiles.keys().copied().collect();
        for t in tiles {
            if let Ok(a) = self.allocate_on(TileId::new(t), size, align) {
                return Ok(a);
            }
        }
        Err(Error::new(Code::NoSpace))
    }

    /// Allocate from a specific memory tile.
    pub fn allocate_on(&mut self, tile: TileId, size: GlobOff, align: GlobOff) -> Result<Allocation> {
        debug_assert!(align.is_power_of_two());
        let exts = self
            .tiles
            .get_mut(&tile.raw())
            .ok_or(Error::new(Code::NoSpace))?;

        for i in 0..exts.len() {
            let e = exts[i];
            let start = (e.off + align - 1) & !(align - 1);
            let pad = start - e.off;
            if pad + size > e.size {
                continue;
            }

            // carve [start, start+size) out of the extent
            let tail = e.size - pad - size;
            if pad == 0 && tail == 0 {
                exts.remove(i);
            } else if pad == 0 {
                exts[i] = Extent {
                    off: start + size,
                    size: tail,
                };
            } else if tail == 0 {
                exts[i] = Extent { off: e.off, size: pad };
            } else {
                exts[i] = Extent { off: e.off, size: pad };
                exts.insert(
                    i + 1,
                    Extent {
                        off: start + size,
                        size: tail,
                    },
                );
            }

            let glob = GlobAddr::new_with(tile, start);
            log::trace!("mem: allocated {:?} ({} bytes)", glob, size);
            return Ok(Allocation { glob, size });
        }
        Err(Error::new(Code::NoSpace))
    }

    /// Return an allocation, merging it with adjacent free extents.
    pub fn free(&mut self, alloc: Allocation) {
        let tile = alloc.glob.tile();
        let off = alloc.glob.offset();
        log::trace!("mem: freeing {:?}", alloc);

        let exts = self.tiles.entry(tile.raw()).or_default();
        let pos = exts.partition_point(|e| e.off < off);
        exts.insert(
            pos,
            Extent {
                off,
                size: alloc.size,
            },
        );

        // merge with successor, then with predecessor
        if pos + 1 < exts.len() && exts[pos].off + exts[pos].size == exts[pos + 1].off {
            exts[pos].size += exts[pos + 1].size;
            exts.remove(pos + 1);
        }
        if pos > 0 && exts[pos - 1].off + exts[pos - 1].size == exts[pos].off {
            exts[pos - 1].size += exts[pos].size;
            exts.remove(pos);
        }
    }

    /// The size of the largest contiguous free extent.
    #[must_use]
    pub fn largest_contiguous(&self) -> GlobOff {
        self.tiles
            .values()
            .flat_map(|exts| exts.iter().map(|e| e.size))
            .max()
            .unwrap_or(0)
    }

    /// Total free bytes across all tiles.
    #[must_use]
    pub fn available(&self) -> GlobOff {
        self.tiles
            .values()
            .flat_map(|exts| exts.iter().map(|e| e.size))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> MainMemory {
        let mut m = MainMemory::new();
        m.add_region(TileId::new(8), 0x1000, 0x10000);
        m
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let mut m = mem();
        let before = m.available();
        let a = m.allocate(0x2000, 0x1000).unwrap();
        let b = m.allocate(0x1000, 0x1000).unwrap();
        assert_eq!(m.available(), before - 0x3000);

        m.free(a);
        m.free(b);
        assert_eq!(m.available(), before);
        // coalescing restored a single extent
        assert_eq!(m.largest_contiguous(), before);
    }

    #[test]
    fn test_alignment() {
        let mut m = MainMemory::new();
        m.add_region(TileId::new(8), 0x1800, 0x10000);
        let a = m.allocate(0x1000, 0x1000).unwrap();
        assert_eq!(a.global().offset() % 0x1000, 0);
        assert_eq!(a.global().tile(), TileId::new(8));
    }

    #[test]
    fn test_exhaustion() {
        let mut m = mem();
        let a = m.allocate(0x10000, 1).unwrap();
        assert_eq!(
            m.allocate(0x1000, 1).unwrap_err().code(),
            Code::NoSpace
        );
        m.free(a);
        m.allocate(0x1000, 1).unwrap();
    }

    #[test]
    fn test_coalesce_middle() {
        let mut m = mem();
        let a = m.allocate(0x1000, 1).unwrap();
        let b = m.allocate(0x1000, 1).unwrap();
        let c = m.allocate(0x1000, 1).unwrap();
        m.free(a);
        m.free(c);
        m.free(b);
        assert_eq!(m.largest_contiguous(), 0x10000);
    }
}
