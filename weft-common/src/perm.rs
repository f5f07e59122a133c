//! Permission flags
//!
//! Two closely related flag sets: [`Perm`] is what TCU memory endpoints
//! and memory gates carry (read/write), [`PageFlags`] is the superset
//! used in page-table entries and map capabilities. Both are hand-packed
//! bit sets with fixed encodings since they cross the kernel boundary.

use core::fmt;
use core::ops;

/// Memory-endpoint permissions.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct Perm(u32);

impl Perm {
    /// No access.
    pub const NONE: Self = Self(0);
    /// Read access.
    pub const R: Self = Self(1 << 0);
    /// Write access.
    pub const W: Self = Self(1 << 1);
    /// Execute access (ignored by memory endpoints, meaningful in maps).
    pub const X: Self = Self(1 << 2);
    /// Read + write.
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
    /// Read + write + execute.
    pub const RWX: Self = Self(Self::R.0 | Self::W.0 | Self::X.0);

    /// Create from raw bits, dropping unknown ones.
    #[inline]
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::RWX.0)
    }

    /// Get the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check whether all of `other`'s bits are set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check whether no bit is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitAnd for Perm {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl ops::BitOr for Perm {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::Not for Perm {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::RWX.0)
    }
}

impl fmt::Debug for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Self::R) { "r" } else { "-" };
        let w = if self.contains(Self::W) { "w" } else { "-" };
        let x = if self.contains(Self::X) { "x" } else { "-" };
        write!(f, "{}{}{}", r, w, x)
    }
}

/// Page-table entry flags.
///
/// The low bits share the encoding of [`Perm`] so that conversions are
/// free; the remaining bits are kernel-internal attributes that end up
/// in map capabilities and PTEs.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct PageFlags(u64);

impl PageFlags {
    /// Not mapped.
    pub const NONE: Self = Self(0);
    /// Readable.
    pub const R: Self = Self(1 << 0);
    /// Writable.
    pub const W: Self = Self(1 << 1);
    /// Executable.
    pub const X: Self = Self(1 << 2);
    /// Large page (2 MiB leaf one level up).
    pub const LARGE: Self = Self(1 << 3);
    /// Mapping installed by the kernel; not revocable by userspace.
    pub const KERNEL: Self = Self(1 << 4);
    /// The physical pages belong to this mapping alone and are freed
    /// back to the main-memory allocator on revocation.
    pub const EXCLUSIVE: Self = Self(1 << 5);
    /// Read + write.
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
    /// All permission bits.
    pub const RWX: Self = Self(Self::R.0 | Self::W.0 | Self::X.0);

    /// Create from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Get the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Check whether all of `other`'s bits are set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check whether no bit is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Keep only the permission bits.
    #[inline]
    #[must_use]
    pub const fn perms(self) -> Self {
        Self(self.0 & Self::RWX.0)
    }
}

impl From<Perm> for PageFlags {
    fn from(p: Perm) -> Self {
        Self(p.bits() as u64)
    }
}

impl From<PageFlags> for Perm {
    fn from(f: PageFlags) -> Self {
        Perm::from_bits_truncate(f.bits() as u32)
    }
}

impl ops::BitAnd for PageFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl ops::BitOr for PageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::Not for PageFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageFlags({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perm_ops() {
        let p = Perm::RW;
        assert!(p.contains(Perm::R));
        assert!(!p.contains(Perm::X));
        assert_eq!(p & Perm::R, Perm::R);
        assert_eq!(!Perm::R, Perm::W | Perm::X);
    }

    #[test]
    fn test_perm_pageflags_roundtrip() {
        let f = PageFlags::from(Perm::RW);
        assert!(f.contains(PageFlags::R));
        assert!(f.contains(PageFlags::W));
        assert_eq!(Perm::from(f), Perm::RW);
    }
}
