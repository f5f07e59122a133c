//! Fabric-wide configuration constants

/// Number of bits in a small page.
pub const PAGE_BITS: u32 = 12;

/// Size of a small page.
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Mask covering the in-page offset.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Number of bits in a large page.
pub const LPAGE_BITS: u32 = 21;

/// Size of a large page.
pub const LPAGE_SIZE: usize = 1 << LPAGE_BITS;

/// Maximum number of live VPEs.
pub const MAX_VPES: usize = 64;

/// Maximum number of slots in a receive buffer (bounded by the
/// 32-bit occupied/unread masks in the receive EP registers).
pub const MAX_RB_SLOTS: usize = 32;

/// Slot-size order of the per-VPE syscall receive buffer.
pub const SYSC_RBUF_ORD: u32 = 9;

/// Slot-size order of the per-VPE upcall receive buffer.
pub const UPCALL_RBUF_ORD: u32 = 7;

/// Slot-size order of the per-VPE default receive buffer.
pub const DEF_RBUF_ORD: u32 = 8;

/// Slot-size order of the tile-multiplexer kernel-call buffer.
pub const TMUX_RBUF_ORD: u32 = 7;

/// Base address of the standard receive buffers on scratchpad tiles.
pub const RBUF_STD_ADDR: u64 = 0xE000;

/// Size of one VPE's standard receive-buffer area (syscall + upcall +
/// default buffers, rounded up).
pub const RBUF_STD_SIZE: u64 = 0x400;

/// Base address of the tile-multiplexer receive buffers.
pub const RBUF_TMUX_ADDR: u64 = 0xD000;
