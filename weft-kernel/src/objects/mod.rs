//! Kernel objects
//!
//! Every capability's root either owns one of these objects or shares
//! ownership through the reference count of its `Rc`. Destruction of
//! the last owning capability runs an object-specific teardown (see
//! [`crate::caps`]).

mod gates;
mod map;
mod quota;
mod sem;
mod serv;

pub use gates::{GateEp, GateObject, MGateObject, RGateObject, SGateObject};
pub use map::MapObject;
pub use quota::{EpObject, KMemObject, TileObject};
pub use sem::SemObject;
pub use serv::{ServObject, SessObject};

use alloc::rc::{Rc, Weak};
use core::fmt;

use crate::tiles::Vpe;

/// Kernel-memory cost of one capability.
pub const CAP_SIZE: usize = 64;

/// The tagged union of all kernel objects a capability can refer to.
#[derive(Clone)]
pub enum KObject {
    RGate(Rc<RGateObject>),
    SGate(Rc<SGateObject>),
    MGate(Rc<MGateObject>),
    Map(Rc<MapObject>),
    Serv(Rc<ServObject>),
    Sess(Rc<SessObject>),
    Sem(Rc<SemObject>),
    // only the VPE manager owns a VPE; break the cycle with Weak
    Vpe(Weak<Vpe>),
    KMem(Rc<KMemObject>),
    Tile(Rc<TileObject>),
    Ep(Rc<EpObject>),
}

const fn kobj_size<T>() -> usize {
    let size = core::mem::size_of::<T>();
    if size <= 64 {
        64
    } else if size <= 128 {
        128
    } else {
        size
    }
}

impl KObject {
    /// Kernel-memory cost of the object behind this capability, for
    /// quota accounting.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::RGate(_) => kobj_size::<RGateObject>(),
            Self::SGate(_) => kobj_size::<SGateObject>(),
            Self::MGate(_) => kobj_size::<MGateObject>(),
            Self::Map(_) => kobj_size::<MapObject>(),
            Self::Serv(_) => kobj_size::<ServObject>(),
            Self::Sess(_) => kobj_size::<SessObject>(),
            Self::Sem(_) => kobj_size::<SemObject>(),
            Self::Vpe(_) => kobj_size::<Vpe>(),
            Self::KMem(_) => kobj_size::<KMemObject>(),
            Self::Tile(_) => kobj_size::<TileObject>(),
            Self::Ep(_) => kobj_size::<EpObject>(),
        }
    }

    /// Short kind name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RGate(_) => "RGate",
            Self::SGate(_) => "SGate",
            Self::MGate(_) => "MGate",
            Self::Map(_) => "Map",
            Self::Serv(_) => "Serv",
            Self::Sess(_) => "Sess",
            Self::Sem(_) => "Sem",
            Self::Vpe(_) => "Vpe",
            Self::KMem(_) => "KMem",
            Self::Tile(_) => "Tile",
            Self::Ep(_) => "Ep",
        }
    }
}

impl fmt::Debug for KObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RGate(r) => write!(f, "{:?}", r),
            Self::SGate(s) => write!(f, "{:?}", s),
            Self::MGate(m) => write!(f, "{:?}", m),
            Self::Map(m) => write!(f, "{:?}", m),
            Self::Serv(s) => write!(f, "{:?}", s),
            Self::Sess(s) => write!(f, "{:?}", s),
            Self::Sem(s) => write!(f, "{:?}", s),
            Self::Vpe(_) => write!(f, "Vpe[..]"),
            Self::KMem(k) => write!(f, "{:?}", k),
            Self::Tile(t) => write!(f, "{:?}", t),
            Self::Ep(e) => write!(f, "{:?}", e),
        }
    }
}
