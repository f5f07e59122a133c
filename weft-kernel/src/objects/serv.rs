//! Service and session objects

use alloc::rc::Rc;
use core::fmt;

use crate::com::Service;

/// A registered service, possibly a derived view of it.
pub struct ServObject {
    serv: Rc<Service>,
    /// Whether this is the owning registration (first creator).
    owner: bool,
    creator: usize,
}

impl ServObject {
    pub fn new(serv: Rc<Service>, owner: bool, creator: usize) -> Rc<Self> {
        Rc::new(Self {
            serv,
            owner,
            creator,
        })
    }

    #[must_use]
    pub fn service(&self) -> &Rc<Service> {
        &self.serv
    }

    #[must_use]
    pub fn owner(&self) -> bool {
        self.owner
    }

    #[must_use]
    pub fn creator(&self) -> usize {
        self.creator
    }
}

impl fmt::Debug for ServObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Serv[name={}, owner={}, creator={}]",
            self.serv.name(),
            self.owner,
            self.creator
        )
    }
}

/// A session: one client's connection to a service.
pub struct SessObject {
    srv: Rc<ServObject>,
    creator: usize,
    ident: u64,
}

impl SessObject {
    pub fn new(srv: &Rc<ServObject>, creator: usize, ident: u64) -> Rc<Self> {
        Rc::new(Self {
            srv: srv.clone(),
            creator,
            ident,
        })
    }

    #[must_use]
    pub fn service(&self) -> &Rc<ServObject> {
        &self.srv
    }

    #[must_use]
    pub fn creator(&self) -> usize {
        self.creator
    }

    #[must_use]
    pub fn ident(&self) -> u64 {
        self.ident
    }
}

impl fmt::Debug for SessObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sess[service={}, ident={:#x}]",
            self.srv.service().name(),
            self.ident
        )
    }
}
