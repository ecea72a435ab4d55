//! Common identifier types shared by the meeting runner crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a `Uuid` newtype with the constructors and formatting every
/// identifier in this crate shares.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a meeting
    MeetingId
);

uuid_id!(
    /// Unique identifier for a chapter member (attendee, scribe)
    UserId
);

uuid_id!(
    /// Unique identifier for a turn log entry
    TurnLogId
);

uuid_id!(
    /// Unique identifier for a stretch goal
    StretchGoalId
);

uuid_id!(
    /// Unique identifier for a feedback entry
    FeedbackId
);

uuid_id!(
    /// Client-generated identifier for a single mutating call.
    ///
    /// Echoed on every change event produced by that call so clients can
    /// confirm or discard optimistic local state.
    MutationId
);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(MeetingId::new(), MeetingId::new());
        assert_ne!(UserId::new(), UserId::new());
    }

    #[test]
    fn test_id_display_and_parse() {
        let id = UserId::new();
        let parsed: UserId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_serializes_as_plain_uuid() {
        let uuid = Uuid::new_v4();
        let id = MeetingId::from_uuid(uuid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));
    }
}
