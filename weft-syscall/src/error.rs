//! Error codes
//!
//! The canonical error taxonomy. TCU hardware errors and kernel software
//! errors share one numbering so that any result can be surfaced to
//! userspace unchanged: replies carry the raw `u32`.

use core::fmt;

/// The error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Code {
    /// No error.
    #[default]
    Success = 0,

    // TCU errors
    /// The endpoint is not a memory endpoint.
    NoMep,
    /// The endpoint is not a send endpoint.
    NoSep,
    /// The endpoint is not a receive endpoint.
    NoRep,
    /// The send endpoint has no credits left.
    NoCredits,
    /// The receive buffer has no free slot.
    RecvNoSpace,
    /// The receive buffer offset is out of bounds.
    RecvOutOfBounds,
    /// The receive gate is gone.
    RecvGone,
    /// The transfer leaves the memory endpoint's region.
    OutOfBounds,
    /// The endpoint does not permit the access.
    NoPerm,
    /// The message is not properly aligned.
    MsgUnaligned,
    /// The message offset is invalid.
    InvMsgOff,
    /// The receive endpoint has replies disabled.
    RepliesDisabled,
    /// Send endpoints cannot be used to reply.
    SendReplyEp,
    /// The receive endpoint's reply range is invalid.
    RecvInvRplEps,
    /// The send endpoint's credit-origin endpoint is invalid.
    SendInvCrdEp,
    /// The message exceeds the endpoint's message size.
    SendInvMsgSz,
    /// Unknown TCU command.
    UnknownCmd,

    // Kernel errors
    /// Invalid arguments.
    InvArgs,
    /// The selector or name already exists.
    Exists,
    /// Out of kernel-memory quota.
    NoKmem,
    /// Out of space (endpoints, memory, quota).
    NoSpace,
    /// The VPE is gone.
    VpeGone,
    /// The capability is not revocable.
    NotRevocable,
    /// The operation timed out.
    Timeout,
}

impl Code {
    const MAX: u32 = Code::Timeout as u32;

    /// Convert from the raw wire representation; unknown values decode
    /// as [`Code::UnknownCmd`].
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        if raw > Self::MAX {
            return Self::UnknownCmd;
        }
        // SAFETY: Code is repr(u32), dense, and raw is within range.
        unsafe { core::mem::transmute::<u32, Code>(raw) }
    }

    /// Get the error name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::NoMep => "NoMep",
            Self::NoSep => "NoSep",
            Self::NoRep => "NoRep",
            Self::NoCredits => "NoCredits",
            Self::RecvNoSpace => "RecvNoSpace",
            Self::RecvOutOfBounds => "RecvOutOfBounds",
            Self::RecvGone => "RecvGone",
            Self::OutOfBounds => "OutOfBounds",
            Self::NoPerm => "NoPerm",
            Self::MsgUnaligned => "MsgUnaligned",
            Self::InvMsgOff => "InvMsgOff",
            Self::RepliesDisabled => "RepliesDisabled",
            Self::SendReplyEp => "SendReplyEp",
            Self::RecvInvRplEps => "RecvInvRplEps",
            Self::SendInvCrdEp => "SendInvCrdEp",
            Self::SendInvMsgSz => "SendInvMsgSz",
            Self::UnknownCmd => "UnknownCmd",
            Self::InvArgs => "InvArgs",
            Self::Exists => "Exists",
            Self::NoKmem => "NoKmem",
            Self::NoSpace => "NoSpace",
            Self::VpeGone => "VpeGone",
            Self::NotRevocable => "NotRevocable",
            Self::Timeout => "Timeout",
        }
    }

    /// Check if this represents success.
    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// The error type passed around in the kernel.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error {
    code: Code,
}

impl Error {
    /// Create a new error with the given code.
    #[inline]
    #[must_use]
    pub const fn new(code: Code) -> Self {
        Self { code }
    }

    /// Get the error code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> Code {
        self.code
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        Self::new(code)
    }
}

impl From<Error> for Code {
    fn from(e: Error) -> Self {
        e.code()
    }
}

impl From<Code> for Result<()> {
    fn from(code: Code) -> Self {
        match code {
            Code::Success => Ok(()),
            e => Err(Error::new(e)),
        }
    }
}

impl<T> From<core::result::Result<T, Error>> for Code {
    fn from(res: core::result::Result<T, Error>) -> Self {
        match res {
            Ok(_) => Code::Success,
            Err(e) => e.code(),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code.name())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code.name())
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip() {
        for raw in 0..=Code::MAX {
            assert_eq!(Code::from_raw(raw) as u32, raw);
        }
        assert_eq!(Code::from_raw(Code::MAX + 7), Code::UnknownCmd);
    }

    #[test]
    fn test_result_conversion() {
        assert!(Result::from(Code::Success).is_ok());
        assert_eq!(
            Result::from(Code::NoCredits).unwrap_err().code(),
            Code::NoCredits
        );
    }
}
