//! Session state and the status published to BLE clients.

use crate::supervisor::JoinError;
use crate::wifi::LeaseInfo;
use serde::Serialize;
use std::fmt;

/// Provisioning state. There is exactly one per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Scanning,
    Joining,
    AwaitingLease,
    Connected,
    /// Transient: reported once, then the session returns to Scanning.
    Failed,
}

impl SessionState {
    /// Check if a join owns the interface.
    pub fn is_joining(&self) -> bool {
        matches!(self, Self::Joining | Self::AwaitingLease)
    }

    /// Check if a new join request would be accepted.
    pub fn accepts_join(&self) -> bool {
        matches!(self, Self::Idle | Self::Scanning)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why the last join failed. Serialized as-is into `lastError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    AuthFailed,
    NetworkNotFound,
    AssociationTimeout,
    LeaseTimeout,
    Busy,
    DriverError,
    Cancelled,
}

impl From<&JoinError> for FailureReason {
    fn from(e: &JoinError) -> Self {
        match e {
            JoinError::AuthFailed => Self::AuthFailed,
            JoinError::NetworkNotFound(_) => Self::NetworkNotFound,
            JoinError::AssociationTimeout => Self::AssociationTimeout,
            JoinError::LeaseTimeout => Self::LeaseTimeout,
            JoinError::Cancelled => Self::Cancelled,
            JoinError::Busy => Self::Busy,
            JoinError::Driver(_) => Self::DriverError,
        }
    }
}

/// Everything a client can learn about the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Target of the current or last join.
    pub ssid: Option<String>,
    /// Present only while Connected.
    pub lease: Option<LeaseInfo>,
    /// Kept until the next successful join.
    pub last_error: Option<FailureReason>,
    pub online: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            ssid: None,
            lease: None,
            last_error: None,
            online: false,
        }
    }
}

/// One state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Increments by one per transition.
    pub seq: u64,
    pub from: SessionState,
    pub to: SessionState,
    /// Set on transitions into Failed.
    pub reason: Option<FailureReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_acceptance() {
        assert!(SessionState::Idle.accepts_join());
        assert!(SessionState::Scanning.accepts_join());
        for state in [
            SessionState::Joining,
            SessionState::AwaitingLease,
            SessionState::Connected,
            SessionState::Failed,
        ] {
            assert!(!state.accepts_join(), "{} should reject joins", state);
        }
    }

    #[test]
    fn test_failure_reason_from_join_error() {
        assert_eq!(
            FailureReason::from(&JoinError::NetworkNotFound("x".into())),
            FailureReason::NetworkNotFound
        );
        assert_eq!(
            FailureReason::from(&JoinError::Driver("boom".into())),
            FailureReason::DriverError
        );
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(
            serde_json::to_string(&SessionState::AwaitingLease).unwrap(),
            "\"AwaitingLease\""
        );
        assert_eq!(
            serde_json::to_string(&FailureReason::LeaseTimeout).unwrap(),
            "\"LeaseTimeout\""
        );
    }
}
