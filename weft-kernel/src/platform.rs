//! Platform view
//!
//! The kernel's static picture of the fabric, built from the boot-info
//! block: which tiles exist, what kind they are, and where the kernel
//! itself runs.

use alloc::vec::Vec;

use weft_common::boot::BootInfo;
use weft_common::{TileDesc, TileId};

/// The fabric as enumerated at boot.
pub struct Platform {
    tiles: Vec<TileDesc>,
    kernel_tile: TileId,
}

impl Platform {
    /// Build the platform view from a validated boot-info block.
    ///
    /// # Panics
    ///
    /// Panics if the block fails magic/version validation; a kernel
    /// cannot run on a fabric it cannot enumerate.
    #[must_use]
    pub fn new(info: &BootInfo) -> Self {
        assert!(info.is_valid(), "invalid boot info block");
        Self {
            tiles: info.tiles().to_vec(),
            kernel_tile: TileId::new(info.kernel_tile),
        }
    }

    /// The tile the kernel runs on.
    #[inline]
    #[must_use]
    pub fn kernel_tile(&self) -> TileId {
        self.kernel_tile
    }

    /// The descriptor of `tile`.
    #[must_use]
    pub fn tile_desc(&self, tile: TileId) -> TileDesc {
        self.tiles[tile.raw() as usize]
    }

    /// Check whether `tile` exists in the fabric.
    #[must_use]
    pub fn has_tile(&self, tile: TileId) -> bool {
        (tile.raw() as usize) < self.tiles.len()
    }

    /// All compute tiles except the kernel's own.
    pub fn user_tiles(&self) -> impl Iterator<Item = TileId> + '_ {
        self.tiles.iter().enumerate().filter_map(move |(i, d)| {
            let id = TileId::new(i as u16);
            if !d.is_mem() && id != self.kernel_tile {
                Some(id)
            } else {
                None
            }
        })
    }

    /// All memory tiles.
    pub fn mem_tiles(&self) -> impl Iterator<Item = (TileId, TileDesc)> + '_ {
        self.tiles.iter().enumerate().filter_map(|(i, d)| {
            if d.is_mem() {
                Some((TileId::new(i as u16), *d))
            } else {
                None
            }
        })
    }
}
