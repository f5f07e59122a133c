//! # weft-kernel
//!
//! The Weft microkernel for TCU-based tile fabrics.
//!
//! The kernel runs on one tile and, using its own TCU, programs the
//! TCUs of all other tiles: user tiles can only issue commands on
//! endpoints the kernel configured for them. Protection is expressed as
//! capabilities in per-VPE tables; all kernel work is driven by
//! messages arriving on four receive endpoints (two for syscalls, one
//! for service replies, one for tile-multiplexer calls).
//!
//! The kernel is single-threaded and cooperative: handlers run as
//! async tasks that only suspend while waiting on a cross-tile reply,
//! a receive-gate activation, a VPE exit, or a semaphore. Everything
//! between suspension points is atomic with respect to other handlers,
//! so no locking is needed around kernel state.
//!
//! This crate is a library; platform entry glue is the embedder's
//! concern. A [`Kernel`] is constructed from a TCU backend plus the
//! boot-info block and driven by [`Kernel::run`] (or [`Kernel::run_once`]
//! from a test harness).

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod caps;
pub mod com;
pub mod ktcu;
pub mod logging;
pub mod mem;
pub mod objects;
pub mod platform;
pub mod sched;
pub mod syscall;
pub mod tiles;
pub mod workloop;

mod aspace;

pub use workloop::{Kernel, Kctx};
