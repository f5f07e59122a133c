//! Boot Handoff Protocol
//!
//! The boot environment places a [`BootInfo`] block at a known global
//! address in the first memory tile. It enumerates the tiles of the
//! fabric and the boot modules, from which the kernel builds its
//! platform view and seeds the main-memory allocator.

use crate::addr::GlobAddr;
use crate::tile::TileDesc;

/// Magic number for boot info validation: "WEFTBOOT" as u64.
pub const BOOT_INFO_MAGIC: u64 = 0x54_4F_4F_42_54_46_45_57;

/// Boot info version for compatibility checking.
pub const BOOT_INFO_VERSION: u32 = 2;

/// Maximum number of tiles described by the boot info.
pub const MAX_TILES: usize = 64;

/// Maximum number of boot modules.
pub const MAX_MODS: usize = 16;

/// Maximum length of a boot-module name, including NUL.
pub const MOD_NAME_LEN: usize = 64;

/// One boot module: a program image placed in a memory tile.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct BootModule {
    /// Global address of the image.
    pub addr: GlobAddr,
    /// Size of the image in bytes.
    pub size: u64,
    /// NUL-terminated name plus command line.
    pub name: [u8; MOD_NAME_LEN],
}

impl BootModule {
    /// Create an empty module entry.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            addr: GlobAddr::new(0),
            size: 0,
            name: [0; MOD_NAME_LEN],
        }
    }

    /// Get the module name as a string slice (up to the first NUL).
    #[must_use]
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }
}

/// Boot information block.
///
/// This struct uses a fixed layout to ensure ABI stability between the
/// boot environment and the kernel, even if compiled separately.
#[repr(C)]
pub struct BootInfo {
    /// Magic number for validation (must be [`BOOT_INFO_MAGIC`]).
    pub magic: u64,
    /// Version of the boot info structure.
    pub version: u32,
    /// The tile the kernel runs on.
    pub kernel_tile: u16,
    _pad: u16,
    /// Number of valid entries in `tiles`.
    pub tile_count: u32,
    /// Number of valid entries in `mods`.
    pub mod_count: u32,
    /// Per-tile descriptors, indexed by raw tile id.
    pub tiles: [TileDesc; MAX_TILES],
    /// Boot modules.
    pub mods: [BootModule; MAX_MODS],
}

impl BootInfo {
    /// Create an empty boot info block (for construction by the boot
    /// environment or a test harness).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            magic: BOOT_INFO_MAGIC,
            version: BOOT_INFO_VERSION,
            kernel_tile: 0,
            _pad: 0,
            tile_count: 0,
            mod_count: 0,
            tiles: [TileDesc::new(crate::tile::TileKind::Compute, 0, 0); MAX_TILES],
            mods: [BootModule::empty(); MAX_MODS],
        }
    }

    /// Check if the block is valid (correct magic and version).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == BOOT_INFO_MAGIC && self.version == BOOT_INFO_VERSION
    }

    /// Get the valid tile descriptors.
    #[must_use]
    pub fn tiles(&self) -> &[TileDesc] {
        &self.tiles[..self.tile_count as usize]
    }

    /// Get the valid boot modules.
    #[must_use]
    pub fn mods(&self) -> &[BootModule] {
        &self.mods[..self.mod_count as usize]
    }
}

// Compile-time layout verification: the block is read over the fabric
// as raw bytes, so field offsets are ABI.
const _: () = {
    assert!(core::mem::offset_of!(BootInfo, tile_count) == 16);
    assert!(core::mem::offset_of!(BootInfo, tiles) == 24);
    assert!(core::mem::size_of::<TileDesc>() == 8);
    assert!(core::mem::size_of::<BootModule>() == 16 + MOD_NAME_LEN);
};
