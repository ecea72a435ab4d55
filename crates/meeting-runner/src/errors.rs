//! Meeting Runner error types.
//!
//! Every variant maps to a stable client error code. Internal details
//! (store failures, channel errors) are logged server-side and replaced with
//! a generic message before reaching a client.

use crate::model::Phase;
use thiserror::Error;

/// Meeting Runner error type.
///
/// Maps to client error codes:
/// - `NotAuthorized`: `NOT_AUTHORIZED` (3)
/// - `NotFound`: `NOT_FOUND` (4)
/// - `StaleState`: `STALE_STATE` (5)
/// - `InvalidTransition`: `INVALID_TRANSITION` (8)
/// - `Persistence`, `Config`, `Internal`: `INTERNAL_ERROR` (6)
/// - `Draining`: `UNAVAILABLE` (7)
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Caller does not hold scribe authority for this meeting.
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// Caller's view of the meeting is out of date and must be refreshed.
    #[error("Stale state: {0}")]
    StaleState(StaleReason),

    /// The requested change is not legal from the current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Meeting, turn, or user does not exist.
    #[error("Not found: {0}")]
    NotFound(NotFoundKind),

    /// Underlying store write or read failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Runner is shutting down and no longer accepts work.
    #[error("Runner is draining")]
    Draining,

    /// Internal error (actor channel failures and similar).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a request was judged stale.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StaleReason {
    /// Caller's expected phase does not match the authoritative phase.
    #[error("expected phase {expected}, meeting is in {actual}")]
    PhaseMismatch { expected: Phase, actual: Phase },

    /// Store rejected the write because the meeting version moved.
    #[error("expected version {expected}, store has {actual}")]
    VersionMismatch { expected: u64, actual: u64 },
}

/// What could not be found.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotFoundKind {
    #[error("meeting")]
    Meeting,
    #[error("turn")]
    Turn,
    #[error("user")]
    User,
}

impl RunnerError {
    /// Returns the client error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            RunnerError::NotAuthorized(_) => 3,
            RunnerError::NotFound(_) => 4,
            RunnerError::StaleState(_) => 5,
            RunnerError::Persistence(_) | RunnerError::Config(_) | RunnerError::Internal(_) => 6,
            RunnerError::Draining => 7,
            RunnerError::InvalidTransition(_) => 8,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RunnerError::Persistence(_) | RunnerError::Config(_) | RunnerError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            RunnerError::NotAuthorized(_) => "Only the scribe can do that".to_string(),
            RunnerError::StaleState(_) => {
                "The meeting has moved on, refresh and try again".to_string()
            }
            RunnerError::InvalidTransition(msg) => msg.clone(),
            RunnerError::NotFound(kind) => format!("{kind} not found"),
            RunnerError::Draining => "Server is shutting down, please reconnect".to_string(),
        }
    }

    /// Short label used for the `reason` metric dimension.
    #[must_use]
    pub const fn reason_label(&self) -> &'static str {
        match self {
            RunnerError::NotAuthorized(_) => "not_authorized",
            RunnerError::StaleState(_) => "stale_state",
            RunnerError::InvalidTransition(_) => "invalid_transition",
            RunnerError::NotFound(_) => "not_found",
            RunnerError::Persistence(_) => "persistence",
            RunnerError::Config(_) => "config",
            RunnerError::Draining => "draining",
            RunnerError::Internal(_) => "internal",
        }
    }

    /// Whether the caller must refresh authoritative state before retrying.
    #[must_use]
    pub fn requires_refresh(&self) -> bool {
        matches!(
            self,
            RunnerError::StaleState(_) | RunnerError::NotAuthorized(_)
        )
    }
}

impl From<StaleReason> for RunnerError {
    fn from(reason: StaleReason) -> Self {
        RunnerError::StaleState(reason)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            RunnerError::NotAuthorized("not scribe".to_string()).error_code(),
            3
        );
        assert_eq!(RunnerError::NotFound(NotFoundKind::Turn).error_code(), 4);
        assert_eq!(
            RunnerError::StaleState(StaleReason::VersionMismatch {
                expected: 3,
                actual: 4
            })
            .error_code(),
            5
        );
        assert_eq!(
            RunnerError::Persistence("redis down".to_string()).error_code(),
            6
        );
        assert_eq!(RunnerError::Draining.error_code(), 7);
        assert_eq!(
            RunnerError::InvalidTransition("backward".to_string()).error_code(),
            8
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = RunnerError::Persistence("connection refused at 10.0.0.7:6379".to_string());
        assert!(!err.client_message().contains("10.0.0.7"));
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_stale_state_display() {
        let err: RunnerError = StaleReason::PhaseMismatch {
            expected: Phase::LightningRound,
            actual: Phase::FullCheckins,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Stale state: expected phase lightning_round, meeting is in full_checkins"
        );
        assert!(err.requires_refresh());
    }

    #[test]
    fn test_not_found_client_message() {
        assert_eq!(
            RunnerError::NotFound(NotFoundKind::Meeting).client_message(),
            "meeting not found"
        );
    }
}
