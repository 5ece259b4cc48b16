//! Error types and their errno mapping.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CdevError>;

/// Errors returned by MMLS device operations.
///
/// Every variant maps to a distinct errno (see [`CdevError::errno`]) so callers sitting behind a
/// syscall-style boundary can branch on the cause. Short reads and writes are never errors: an
/// over-long request is clipped to the device size and reported through the returned count.
#[derive(Debug, Error)]
pub enum CdevError {
    #[error("out of range: offset={offset} len={len} size={size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A copy to or from caller memory failed part-way.
    ///
    /// `at` is the byte index within the caller buffer that could not be accessed. Bytes before
    /// it may already have been transferred.
    #[error("bad caller address at buffer index {at}")]
    Fault { at: usize },

    #[error("interrupted while waiting for the device lock")]
    Interrupted,

    /// Initialization could not produce a usable device; nothing was made reachable.
    #[error("fatal initialization failure: {0}")]
    Fatal(String),

    /// The subsystem is disabled, or the device has been torn down.
    #[error("no such device")]
    NoDevice,

    #[error("inappropriate control command 0x{cmd:08x}")]
    NotTty { cmd: u32 },

    #[error("failed to install mapping: {0}")]
    MapFailed(String),

    #[error("backing {op} command failed: {reason}")]
    Command { op: &'static str, reason: String },
}

pub const ERANGE: i32 = 34;
pub const EOPNOTSUPP: i32 = 95;
pub const EINVAL: i32 = 22;
pub const EFAULT: i32 = 14;
pub const EINTR: i32 = 4;
pub const ENODEV: i32 = 19;
pub const ENXIO: i32 = 6;
pub const ENOTTY: i32 = 25;
pub const EAGAIN: i32 = 11;
pub const EIO: i32 = 5;

impl CdevError {
    /// Linux errno (positive) for this error.
    pub fn errno(&self) -> i32 {
        match self {
            CdevError::OutOfRange { .. } => ERANGE,
            CdevError::Unsupported(_) => EOPNOTSUPP,
            CdevError::InvalidArgument(_) => EINVAL,
            CdevError::Fault { .. } => EFAULT,
            CdevError::Interrupted => EINTR,
            CdevError::Fatal(_) => ENODEV,
            CdevError::NoDevice => ENXIO,
            CdevError::NotTty { .. } => ENOTTY,
            CdevError::MapFailed(_) => EAGAIN,
            CdevError::Command { .. } => EIO,
        }
    }
}

impl From<CdevError> for std::io::Error {
    fn from(err: CdevError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            CdevError::OutOfRange { .. } | CdevError::InvalidArgument(_) => {
                ErrorKind::InvalidInput
            }
            CdevError::Unsupported(_) | CdevError::NotTty { .. } => ErrorKind::Unsupported,
            // `ErrorKind::Interrupted` makes `read_exact` and friends retry, which would spin on a
            // still-raised token until the lock frees.
            CdevError::Interrupted => ErrorKind::Other,
            CdevError::NoDevice | CdevError::Fatal(_) => ErrorKind::NotFound,
            CdevError::MapFailed(_) => ErrorKind::WouldBlock,
            CdevError::Fault { .. } | CdevError::Command { .. } => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// A direct access through a [`crate::Mapping`] hit memory it may not touch.
///
/// This is the bus-error path: mappings are populated eagerly, so any fault is a caller bug and
/// is never resolved by mapping more pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapFault {
    #[error("bus error: address 0x{addr:x} is outside the mapping")]
    Outside { addr: u64 },

    #[error("bus error: address 0x{addr:x} belongs to a torn-down device")]
    Revoked { addr: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_distinct() {
        let errors = [
            CdevError::OutOfRange {
                offset: 0,
                len: 0,
                size: 0,
            },
            CdevError::Unsupported("x"),
            CdevError::InvalidArgument("x"),
            CdevError::Fault { at: 0 },
            CdevError::Interrupted,
            CdevError::Fatal(String::new()),
            CdevError::NoDevice,
            CdevError::NotTty { cmd: 0 },
            CdevError::MapFailed(String::new()),
            CdevError::Command {
                op: "read",
                reason: String::new(),
            },
        ];

        let mut seen = std::collections::HashSet::new();
        for err in &errors {
            assert!(seen.insert(err.errno()), "duplicate errno for {err:?}");
        }
    }

    #[test]
    fn interrupted_io_error_is_not_retryable() {
        let err: std::io::Error = CdevError::Interrupted.into();
        assert_ne!(err.kind(), std::io::ErrorKind::Interrupted);
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<CdevError>());
        assert!(matches!(inner, Some(CdevError::Interrupted)));
    }
}
