//! The agent's nested update state machine.
//!
//! The sub-state lives inside a repair task's executor data and advances
//! monotonically within one task. `OperationAborted` is the only terminal
//! branch reachable from any non-terminal state.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Per-task sub-state of the node update agent.
///
/// Numeric values double as positive exit codes of the agent-side helper and
/// are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorSubState {
    /// No operation in flight.
    None,
    /// Updates searched and downloaded; waiting for cluster-side approval.
    DownloadCompleted,
    /// Coordinator approved installation for this node.
    InstallationApproved,
    /// Installation is running.
    InstallationInProgress,
    /// Installation finished; reboot decision pending.
    InstallationCompleted,
    /// Node restart was requested; the agent process is about to go down.
    RestartRequested,
    /// The node came back after a requested restart.
    RestartCompleted,
    /// Installation finished and no reboot is needed.
    RestartNotNeeded,
    /// The whole operation is done; the task can be restored and completed.
    OperationCompleted,
    /// The operation was abandoned. Terminal.
    OperationAborted,
}

impl ExecutorSubState {
    /// Numeric value (positive helper exit code).
    pub fn value(self) -> i32 {
        match self {
            Self::None => 1,
            Self::DownloadCompleted => 2,
            Self::InstallationApproved => 3,
            Self::InstallationInProgress => 4,
            Self::InstallationCompleted => 5,
            Self::RestartRequested => 6,
            Self::RestartCompleted => 7,
            Self::RestartNotNeeded => 8,
            Self::OperationCompleted => 9,
            Self::OperationAborted => 11,
        }
    }

    /// Parse a numeric value back into a sub-state.
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::DownloadCompleted),
            3 => Some(Self::InstallationApproved),
            4 => Some(Self::InstallationInProgress),
            5 => Some(Self::InstallationCompleted),
            6 => Some(Self::RestartRequested),
            7 => Some(Self::RestartCompleted),
            8 => Some(Self::RestartNotNeeded),
            9 => Some(Self::OperationCompleted),
            11 => Some(Self::OperationAborted),
            _ => None,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Repeating the current state is always legal; updates are idempotent
    /// given the same input state.
    pub fn can_advance_to(self, next: ExecutorSubState) -> bool {
        use ExecutorSubState::*;

        if self == next {
            return true;
        }
        // Any non-terminal state may be abandoned.
        if next == OperationAborted {
            return self != OperationAborted;
        }

        matches!(
            (self, next),
            (None, DownloadCompleted)
                | (None, OperationCompleted)
                | (DownloadCompleted, InstallationApproved)
                | (InstallationApproved, InstallationInProgress)
                | (InstallationInProgress, InstallationCompleted)
                | (InstallationCompleted, RestartRequested)
                | (InstallationCompleted, RestartNotNeeded)
                | (RestartRequested, RestartCompleted)
                | (RestartCompleted, OperationCompleted)
                | (RestartNotNeeded, OperationCompleted)
                | (OperationCompleted, None)
        )
    }

    /// Advance to `next`, rejecting transitions the state machine forbids.
    pub fn advance_to(self, next: ExecutorSubState) -> Result<ExecutorSubState, ModelError> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(ModelError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Whether this state marks the tail of an installation: the node already
    /// did the disruptive work and is only finishing up.
    pub fn is_post_install(self) -> bool {
        matches!(
            self,
            Self::InstallationCompleted | Self::RestartRequested | Self::RestartCompleted
        )
    }
}

impl std::fmt::Display for ExecutorSubState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::DownloadCompleted => "DownloadCompleted",
            Self::InstallationApproved => "InstallationApproved",
            Self::InstallationInProgress => "InstallationInProgress",
            Self::InstallationCompleted => "InstallationCompleted",
            Self::RestartRequested => "RestartRequested",
            Self::RestartCompleted => "RestartCompleted",
            Self::RestartNotNeeded => "RestartNotNeeded",
            Self::OperationCompleted => "OperationCompleted",
            Self::OperationAborted => "OperationAborted",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for ExecutorSubState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(Self::None),
            "DownloadCompleted" => Ok(Self::DownloadCompleted),
            "InstallationApproved" => Ok(Self::InstallationApproved),
            "InstallationInProgress" => Ok(Self::InstallationInProgress),
            "InstallationCompleted" => Ok(Self::InstallationCompleted),
            "RestartRequested" => Ok(Self::RestartRequested),
            "RestartCompleted" => Ok(Self::RestartCompleted),
            "RestartNotNeeded" => Ok(Self::RestartNotNeeded),
            "OperationCompleted" => Ok(Self::OperationCompleted),
            "OperationAborted" => Ok(Self::OperationAborted),
            other => Err(ModelError::UnknownSubState(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ExecutorSubState; 10] = [
        ExecutorSubState::None,
        ExecutorSubState::DownloadCompleted,
        ExecutorSubState::InstallationApproved,
        ExecutorSubState::InstallationInProgress,
        ExecutorSubState::InstallationCompleted,
        ExecutorSubState::RestartRequested,
        ExecutorSubState::RestartCompleted,
        ExecutorSubState::RestartNotNeeded,
        ExecutorSubState::OperationCompleted,
        ExecutorSubState::OperationAborted,
    ];

    #[test]
    fn test_values_are_frozen() {
        assert_eq!(ExecutorSubState::None.value(), 1);
        assert_eq!(ExecutorSubState::DownloadCompleted.value(), 2);
        assert_eq!(ExecutorSubState::InstallationApproved.value(), 3);
        assert_eq!(ExecutorSubState::InstallationInProgress.value(), 4);
        assert_eq!(ExecutorSubState::InstallationCompleted.value(), 5);
        assert_eq!(ExecutorSubState::RestartRequested.value(), 6);
        assert_eq!(ExecutorSubState::RestartCompleted.value(), 7);
        assert_eq!(ExecutorSubState::RestartNotNeeded.value(), 8);
        assert_eq!(ExecutorSubState::OperationCompleted.value(), 9);
        assert_eq!(ExecutorSubState::OperationAborted.value(), 11);
    }

    #[test]
    fn test_value_roundtrip() {
        for state in ALL {
            assert_eq!(ExecutorSubState::from_value(state.value()), Some(state));
        }
        assert_eq!(ExecutorSubState::from_value(10), None);
        assert_eq!(ExecutorSubState::from_value(0), None);
    }

    #[test]
    fn test_name_roundtrip() {
        for state in ALL {
            let parsed: ExecutorSubState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("downloadcompleted".parse::<ExecutorSubState>().is_err());
    }

    #[test]
    fn test_happy_path_is_legal() {
        use ExecutorSubState::*;
        let path = [
            None,
            DownloadCompleted,
            InstallationApproved,
            InstallationInProgress,
            InstallationCompleted,
            RestartNotNeeded,
            OperationCompleted,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_reboot_path_is_legal() {
        use ExecutorSubState::*;
        assert!(InstallationCompleted.can_advance_to(RestartRequested));
        assert!(RestartRequested.can_advance_to(RestartCompleted));
        assert!(RestartCompleted.can_advance_to(OperationCompleted));
    }

    #[test]
    fn test_backwards_is_illegal() {
        use ExecutorSubState::*;
        assert!(!InstallationInProgress.can_advance_to(DownloadCompleted));
        assert!(!OperationCompleted.can_advance_to(InstallationApproved));
        assert!(!RestartCompleted.can_advance_to(RestartRequested));
    }

    #[test]
    fn test_abort_is_terminal() {
        use ExecutorSubState::*;
        for state in ALL {
            if state != OperationAborted {
                assert!(state.can_advance_to(OperationAborted));
            }
        }
        assert!(!OperationAborted.can_advance_to(None));
        assert!(!OperationAborted.can_advance_to(OperationCompleted));
        // Idempotent repeat is still allowed.
        assert!(OperationAborted.can_advance_to(OperationAborted));
    }

    #[test]
    fn test_advance_to_reports_pair() {
        use ExecutorSubState::*;
        let err = InstallationInProgress.advance_to(DownloadCompleted).unwrap_err();
        match err {
            ModelError::InvalidTransition { from, to } => {
                assert_eq!(from, InstallationInProgress);
                assert_eq!(to, DownloadCompleted);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_post_install_states() {
        use ExecutorSubState::*;
        assert!(InstallationCompleted.is_post_install());
        assert!(RestartRequested.is_post_install());
        assert!(RestartCompleted.is_post_install());
        assert!(!InstallationInProgress.is_post_install());
        assert!(!RestartNotNeeded.is_post_install());
    }
}
