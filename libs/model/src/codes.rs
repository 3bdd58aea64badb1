//! Numeric operation contract.
//!
//! These codes form the wire/exit contract between the agent-side helper
//! process and the coordinator. Positive values are reserved for sub-states
//! (see [`crate::substate::ExecutorSubState`]); zero and negatives are
//! operation outcomes. The values are frozen.

use serde::{Deserialize, Serialize};

/// Outcome of an operation at the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCode {
    /// Operation completed successfully.
    Success,
    /// Fatal, non-retryable failure.
    Failure,
    /// A repair task was observed in a state the contract does not cover.
    RepairTaskInvalidState,
    /// Caller supplied an invalid argument.
    InvalidArgument,
    /// Target service does not exist.
    ServiceNotFound,
    /// The helper process was terminated before producing a result.
    ProcessTerminated,
    /// Transient platform error; the caller should retry.
    RetryableException,
    /// An operation deadline expired.
    TimeoutException,
    /// Target application does not exist.
    ApplicationNotFound,
    /// A required OS library is missing; the host should restart the service.
    DllNotFound,
}

impl OperationCode {
    /// Numeric value of this code.
    pub fn value(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => -1,
            Self::RepairTaskInvalidState => -5,
            Self::InvalidArgument => -6,
            Self::ServiceNotFound => -7,
            Self::ProcessTerminated => -8,
            Self::RetryableException => -9,
            Self::TimeoutException => -10,
            Self::ApplicationNotFound => -11,
            Self::DllNotFound => -12,
        }
    }

    /// Parse a numeric value back into a code.
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            -1 => Some(Self::Failure),
            -5 => Some(Self::RepairTaskInvalidState),
            -6 => Some(Self::InvalidArgument),
            -7 => Some(Self::ServiceNotFound),
            -8 => Some(Self::ProcessTerminated),
            -9 => Some(Self::RetryableException),
            -10 => Some(Self::TimeoutException),
            -11 => Some(Self::ApplicationNotFound),
            -12 => Some(Self::DllNotFound),
            _ => None,
        }
    }

    /// Whether a caller should retry the same operation later.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RetryableException | Self::TimeoutException)
    }
}

impl std::fmt::Display for OperationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::RepairTaskInvalidState => "RepairTaskInvalidState",
            Self::InvalidArgument => "InvalidArgument",
            Self::ServiceNotFound => "ServiceNotFound",
            Self::ProcessTerminated => "ProcessTerminated",
            Self::RetryableException => "RetryableException",
            Self::TimeoutException => "TimeoutException",
            Self::ApplicationNotFound => "ApplicationNotFound",
            Self::DllNotFound => "DllNotFoundException",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_frozen() {
        assert_eq!(OperationCode::Success.value(), 0);
        assert_eq!(OperationCode::Failure.value(), -1);
        assert_eq!(OperationCode::RepairTaskInvalidState.value(), -5);
        assert_eq!(OperationCode::InvalidArgument.value(), -6);
        assert_eq!(OperationCode::ServiceNotFound.value(), -7);
        assert_eq!(OperationCode::ProcessTerminated.value(), -8);
        assert_eq!(OperationCode::RetryableException.value(), -9);
        assert_eq!(OperationCode::TimeoutException.value(), -10);
        assert_eq!(OperationCode::ApplicationNotFound.value(), -11);
        assert_eq!(OperationCode::DllNotFound.value(), -12);
    }

    #[test]
    fn test_value_roundtrip() {
        for code in [
            OperationCode::Success,
            OperationCode::Failure,
            OperationCode::RepairTaskInvalidState,
            OperationCode::InvalidArgument,
            OperationCode::ServiceNotFound,
            OperationCode::ProcessTerminated,
            OperationCode::RetryableException,
            OperationCode::TimeoutException,
            OperationCode::ApplicationNotFound,
            OperationCode::DllNotFound,
        ] {
            assert_eq!(OperationCode::from_value(code.value()), Some(code));
        }
        assert_eq!(OperationCode::from_value(-2), None);
        assert_eq!(OperationCode::from_value(1), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(OperationCode::RetryableException.is_retryable());
        assert!(OperationCode::TimeoutException.is_retryable());
        assert!(!OperationCode::Failure.is_retryable());
        assert!(!OperationCode::Success.is_retryable());
    }
}
