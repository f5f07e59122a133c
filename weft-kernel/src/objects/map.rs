//! Map objects

use alloc::rc::Rc;
use core::cell::Cell;
use core::fmt;

use weft_common::{GlobAddr, PageFlags};

/// A mapping of a contiguous range of virtual pages in the owning VPE.
///
/// The covered range is implied by the capability's selector range:
/// `[sel * PAGE_SIZE, (sel + length) * PAGE_SIZE)`.
pub struct MapObject {
    glob: Cell<GlobAddr>,
    flags: Cell<PageFlags>,
    mapped: Cell<bool>,
}

impl MapObject {
    pub fn new(glob: GlobAddr, flags: PageFlags) -> Rc<Self> {
        Rc::new(Self {
            glob: Cell::new(glob),
            flags: Cell::new(flags),
            mapped: Cell::new(false),
        })
    }

    #[must_use]
    pub fn global(&self) -> GlobAddr {
        self.glob.get()
    }

    #[must_use]
    pub fn flags(&self) -> PageFlags {
        self.flags.get()
    }

    #[must_use]
    pub fn mapped(&self) -> bool {
        self.mapped.get()
    }

    /// Record that the PTEs were installed.
    pub fn set_mapped(&self, glob: GlobAddr, flags: PageFlags) {
        self.glob.set(glob);
        self.flags.set(flags);
        self.mapped.set(true);
    }
}

impl fmt::Debug for MapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Map[glob={:?}, flags={:?}]", self.global(), self.flags())
    }
}
