//! Error kinds surfaced across the syscall and file-system ABI.
//!
//! Every kind has a fixed small negative code; the numeric dispatcher speaks
//! codes, everything above it matches on the kind. Kernel-internal invariant
//! violations are not errors - they panic.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("unspecified error")]
    Unspecified,
    #[error("bad environment id")]
    BadEnv,
    #[error("invalid argument")]
    Inval,
    #[error("out of memory")]
    NoMem,
    #[error("out of environments")]
    NoFreeEnv,
    #[error("target not receiving")]
    IpcNotRecv,
    #[error("out of disk blocks")]
    NoDisk,
    #[error("not found")]
    NotFound,
    #[error("bad path")]
    BadPath,
    #[error("file exists")]
    Exists,
    #[error("not an executable image")]
    NotExec,
    #[error("operation not supported")]
    NotSupported,
}

impl KernelError {
    /// The ABI code: a small negative integer.
    pub fn code(self) -> i32 {
        match self {
            KernelError::Unspecified => -1,
            KernelError::BadEnv => -2,
            KernelError::Inval => -3,
            KernelError::NoMem => -4,
            KernelError::NoFreeEnv => -5,
            KernelError::IpcNotRecv => -6,
            KernelError::NoDisk => -8,
            KernelError::NotFound => -10,
            KernelError::BadPath => -11,
            KernelError::Exists => -12,
            KernelError::NotExec => -13,
            KernelError::NotSupported => -14,
        }
    }

    /// Decode an ABI return value. Unknown negatives collapse to
    /// `Unspecified`; non-negative values are not errors.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0.. => return None,
            -2 => KernelError::BadEnv,
            -3 => KernelError::Inval,
            -4 => KernelError::NoMem,
            -5 => KernelError::NoFreeEnv,
            -6 => KernelError::IpcNotRecv,
            -8 => KernelError::NoDisk,
            -10 => KernelError::NotFound,
            -11 => KernelError::BadPath,
            -12 => KernelError::Exists,
            -13 => KernelError::NotExec,
            -14 => KernelError::NotSupported,
            _ => KernelError::Unspecified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for e in [
            KernelError::BadEnv,
            KernelError::Inval,
            KernelError::NoMem,
            KernelError::NoFreeEnv,
            KernelError::IpcNotRecv,
            KernelError::NoDisk,
            KernelError::NotFound,
            KernelError::BadPath,
            KernelError::Exists,
            KernelError::NotExec,
            KernelError::NotSupported,
        ] {
            assert!(e.code() < 0);
            assert_eq!(KernelError::from_code(e.code()), Some(e));
        }
        assert_eq!(KernelError::from_code(0), None);
        assert_eq!(KernelError::from_code(42), None);
    }
}
