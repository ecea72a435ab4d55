//! Scribe authority.
//!
//! A meeting has exactly one scribe. Every mutation is checked against it
//! here, and a hand-off is validated here before the runner commits it as a
//! version-guarded write.

use crate::errors::{NotFoundKind, RunnerError};
use crate::model::{Attendee, Meeting};
use common::types::UserId;

/// Reject `caller` unless it holds scribe authority.
///
/// # Errors
///
/// `NotAuthorized` when `caller` is not the scribe.
pub fn authorize(meeting: &Meeting, caller: UserId) -> Result<(), RunnerError> {
    if meeting.scribe_id == caller {
        Ok(())
    } else {
        Err(RunnerError::NotAuthorized(format!(
            "user {caller} is not the scribe of meeting {}",
            meeting.id
        )))
    }
}

/// Validate a hand-off from `caller` to `new_scribe`.
///
/// # Errors
///
/// `NotAuthorized` if `caller` is not the scribe, `NotFound(User)` if
/// `new_scribe` is not a checked-in attendee.
pub fn validate_reassign(
    meeting: &Meeting,
    attendance: &[Attendee],
    caller: UserId,
    new_scribe: UserId,
) -> Result<(), RunnerError> {
    authorize(meeting, caller)?;

    let checked_in = attendance
        .iter()
        .any(|a| a.user_id == new_scribe && a.is_checked_in());
    if !checked_in {
        return Err(RunnerError::NotFound(NotFoundKind::User));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::types::MeetingId;

    fn attendee(user_id: UserId, checked_in: bool) -> Attendee {
        Attendee {
            user_id,
            display_name: "member".to_string(),
            checked_in_at: checked_in.then(Utc::now),
            priority: None,
            requested_support: false,
        }
    }

    #[test]
    fn test_only_scribe_is_authorized() {
        let scribe = UserId::new();
        let meeting = Meeting::scheduled(MeetingId::new(), scribe, Utc::now(), 90);

        assert!(authorize(&meeting, scribe).is_ok());
        assert!(matches!(
            authorize(&meeting, UserId::new()),
            Err(RunnerError::NotAuthorized(_))
        ));
    }

    #[test]
    fn test_reassign_requires_checked_in_target() {
        let scribe = UserId::new();
        let meeting = Meeting::scheduled(MeetingId::new(), scribe, Utc::now(), 90);
        let present = UserId::new();
        let absent = UserId::new();
        let attendance = vec![attendee(present, true), attendee(absent, false)];

        assert!(validate_reassign(&meeting, &attendance, scribe, present).is_ok());
        assert!(matches!(
            validate_reassign(&meeting, &attendance, scribe, absent),
            Err(RunnerError::NotFound(NotFoundKind::User))
        ));
        assert!(matches!(
            validate_reassign(&meeting, &attendance, present, present),
            Err(RunnerError::NotAuthorized(_))
        ));
    }
}
