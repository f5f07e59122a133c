//! Volatile-MMIO register-file backend
//!
//! On hardware the TCU register file is memory-mapped at a fixed
//! address in every tile. All accesses are 64-bit volatile operations
//! to keep the compiler from reordering or eliding device accesses.

use core::ptr::{read_volatile, write_volatile};

use crate::driver::TcuRegs;
use crate::regs::{Reg, NUM_REGS};

/// The memory-mapped register file of the local TCU.
pub struct MmioTcu {
    base: usize,
}

impl MmioTcu {
    /// Create a backend for the register file at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address the local TCU's MMIO area is
    /// mapped at, with device-memory attributes, and nothing else may
    /// access it concurrently.
    #[must_use]
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl TcuRegs for MmioTcu {
    fn read_reg(&self, idx: usize) -> Reg {
        debug_assert!(idx < NUM_REGS);
        // SAFETY: base points to the mapped register file per new()
        unsafe { read_volatile((self.base + idx * 8) as *const Reg) }
    }

    fn write_reg(&mut self, idx: usize, val: Reg) {
        debug_assert!(idx < NUM_REGS);
        // SAFETY: as above
        unsafe { write_volatile((self.base + idx * 8) as *mut Reg, val) }
    }
}
