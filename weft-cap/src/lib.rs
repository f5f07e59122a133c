//! # weft-cap
//!
//! Capability storage for the Weft kernel.
//!
//! # Model
//!
//! Every VPE owns two capability tables (objects and mappings), each a
//! flat namespace of 32-bit selectors. A capability covers a contiguous
//! selector range and is a node in a *derivation forest*: deriving or
//! obtaining a capability creates a child of the source, and revocation
//! removes whole subtrees. Subtrees freely span tables of different
//! VPEs (a cap obtained by another VPE stays a child of the original).
//!
//! # Representation
//!
//! Following the usual trouble with parent/child/sibling raw-pointer
//! graphs, nodes live in one arena and link to each other by stable
//! 32-bit ids: `parent`, `first_child`, `next_sibling`, `prev_sibling`.
//! Each table is an ordered map from starting selector to node id; a
//! lookup finds the nearest capability at or below the selector and
//! checks that its range covers it. Revocation is an iterative walk over
//! the arena that detaches the subtree and hands the released payloads
//! back to the caller in child-before-parent order, so that the kernel
//! can run object teardown without holding any table borrow.
//!
//! The crate is generic over the payload type; the kernel instantiates
//! it with its kernel-object handle.

#![no_std]

extern crate alloc;

mod forest;
mod sel;

pub use forest::{CapForest, CapNode, NodeId, Released, SpaceId};
pub use sel::{CapSel, SelRange};

/// Errors from capability-table operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapError {
    /// The selector (range) is already in use.
    Exists,
    /// No capability at the selector.
    NoSuchCap,
    /// The capability's `can_revoke` predicate refused.
    NotRevocable,
}
