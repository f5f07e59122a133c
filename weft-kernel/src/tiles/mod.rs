//! Tiles, tile multiplexers, and VPEs

mod tilemux;
mod vpe;
mod vpemng;

pub use tilemux::{TileMux, FIRST_USER_EP, TMSIDE_REP, TMSIDE_RPLEP, TMUX_REP, TMUX_SEP};
pub use vpe::{
    ActId, Vpe, VpeState, DEF_REP_OFF, STD_EPS_COUNT, SYSC_REP_OFF, SYSC_SEP_OFF,
    UPCALL_REP_OFF, UPCALL_RPLEP_OFF,
};
pub use vpemng::{
    create_vpe, destroy_vpe_boxed, fetch_exit, init_vpe_async, start_vpe_async, stop_vpe_async,
    wait_exit_async, VpeMng,
};

use alloc::collections::BTreeMap;
use alloc::rc::Rc;

use weft_common::TileId;

/// The kernel's table of tile-multiplexer proxies, one per user tile.
/// Fixed after boot.
pub struct TileMng {
    muxes: BTreeMap<u16, Rc<TileMux>>,
}

impl Default for TileMng {
    fn default() -> Self {
        Self::new()
    }
}

impl TileMng {
    #[must_use]
    pub fn new() -> Self {
        Self {
            muxes: BTreeMap::new(),
        }
    }

    /// Register the multiplexer proxy of a tile.
    pub fn add(&mut self, mux: Rc<TileMux>) {
        self.muxes.insert(mux.tile_id().raw(), mux);
    }

    /// The multiplexer proxy of `tile`.
    ///
    /// # Panics
    ///
    /// Panics for tiles that have none (memory tiles, the kernel tile).
    #[must_use]
    pub fn tilemux(&self, tile: TileId) -> Rc<TileMux> {
        self.muxes[&tile.raw()].clone()
    }

    /// The multiplexer proxy of `tile`, if it has one.
    #[must_use]
    pub fn get(&self, tile: TileId) -> Option<Rc<TileMux>> {
        self.muxes.get(&tile.raw()).cloned()
    }
}
