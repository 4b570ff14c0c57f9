//! Runtime error and status codes.

use core::fmt;

use thiserror::Error;

/// Errors returned by runtime operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmError {
    /// The operation could not complete (timeout, device failure, unknown module).
    #[error("operation failed")]
    Failure,
    /// An argument was out of range.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The thread or mutex identifier is not known.
    #[error("invalid identifier")]
    InvalidId,
    /// The target is in the wrong state for the operation.
    #[error("invalid state")]
    InvalidState,
}

/// Result alias used by every runtime call.
pub type VmResult<T> = Result<T, VmError>;

/// Numeric status codes for hosts that exchange plain integers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success = 0,
    Failure = 1,
    ErrorInvalidParameter = 2,
    ErrorInvalidId = 3,
    ErrorInvalidState = 4,
}

impl Status {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<VmError> for Status {
    fn from(err: VmError) -> Self {
        match err {
            VmError::Failure => Self::Failure,
            VmError::InvalidParameter => Self::ErrorInvalidParameter,
            VmError::InvalidId => Self::ErrorInvalidId,
            VmError::InvalidState => Self::ErrorInvalidState,
        }
    }
}

impl<T> From<&VmResult<T>> for Status {
    fn from(result: &VmResult<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(err) => (*err).into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "VM_STATUS_SUCCESS"),
            Self::Failure => write!(f, "VM_STATUS_FAILURE"),
            Self::ErrorInvalidParameter => write!(f, "VM_STATUS_ERROR_INVALID_PARAMETER"),
            Self::ErrorInvalidId => write!(f, "VM_STATUS_ERROR_INVALID_ID"),
            Self::ErrorInvalidState => write!(f, "VM_STATUS_ERROR_INVALID_STATE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(Status::Success.code(), 0);
        assert_eq!(Status::from(VmError::Failure).code(), 1);
        assert_eq!(Status::from(VmError::InvalidParameter).code(), 2);
        assert_eq!(Status::from(VmError::InvalidId).code(), 3);
        assert_eq!(Status::from(VmError::InvalidState).code(), 4);
    }

    #[test]
    fn results_map_to_status() {
        let ok: VmResult<u8> = Ok(7);
        let err: VmResult<u8> = Err(VmError::InvalidState);
        assert!(Status::from(&ok).is_success());
        assert_eq!(Status::from(&err), Status::ErrorInvalidState);
        assert_eq!(Status::from(&err).to_string(), "VM_STATUS_ERROR_INVALID_STATE");
    }
}
