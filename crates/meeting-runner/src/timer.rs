//! Turn timer arithmetic.
//!
//! A turn is `idle -> running -> stopped -> logged`. Only the running part
//! lives on the meeting (as [`ActiveTimer`]); everything here is derived from
//! it and the trusted clock.

use crate::clock::elapsed_seconds;
use crate::model::{ActiveTimer, Phase};
use chrono::{DateTime, Utc};
use common::types::UserId;
use serde::{Deserialize, Serialize};

/// Seconds remaining at which a running turn shows a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarningThresholds {
    pub lightning_round: u32,
    pub full_checkins: u32,
}

impl Default for WarningThresholds {
    fn default() -> Self {
        Self {
            lightning_round: 15,
            full_checkins: 60,
        }
    }
}

impl WarningThresholds {
    #[must_use]
    pub fn for_section(&self, section: Phase) -> u32 {
        match section {
            Phase::LightningRound => self.lightning_round,
            _ => self.full_checkins,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    OnTime,
    Warning,
    Overtime,
}

/// Point-in-time view of the running turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerReading {
    pub participant_id: UserId,
    pub section: Phase,
    pub started_at: DateTime<Utc>,
    pub allotted_seconds: u32,
    pub elapsed_seconds: u32,
    pub remaining_seconds: u32,
    pub overtime_seconds: u32,
    pub status: TimerStatus,
}

/// Measured outcome of stopping a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoppedTurn {
    pub stopped_at: DateTime<Utc>,
    pub duration_seconds: u32,
    pub overtime_seconds: u32,
}

/// `max(0, elapsed - allotted)`.
#[must_use]
pub const fn overtime_seconds(elapsed: u32, allotted: u32) -> u32 {
    elapsed.saturating_sub(allotted)
}

/// Read the running turn at `now`.
#[must_use]
pub fn read(timer: &ActiveTimer, now: DateTime<Utc>, thresholds: &WarningThresholds) -> TimerReading {
    let elapsed = elapsed_seconds(timer.started_at, now);
    let remaining = timer.allotted_seconds.saturating_sub(elapsed);
    let overtime = overtime_seconds(elapsed, timer.allotted_seconds);

    let status = if overtime > 0 {
        TimerStatus::Overtime
    } else if remaining <= thresholds.for_section(timer.section) {
        TimerStatus::Warning
    } else {
        TimerStatus::OnTime
    };

    TimerReading {
        participant_id: timer.participant_id,
        section: timer.section,
        started_at: timer.started_at,
        allotted_seconds: timer.allotted_seconds,
        elapsed_seconds: elapsed,
        remaining_seconds: remaining,
        overtime_seconds: overtime,
        status,
    }
}

/// Measure the running turn as stopped at `now`.
#[must_use]
pub fn stop(timer: &ActiveTimer, now: DateTime<Utc>) -> StoppedTurn {
    let duration = elapsed_seconds(timer.started_at, now);
    StoppedTurn {
        stopped_at: now,
        duration_seconds: duration,
        overtime_seconds: overtime_seconds(duration, timer.allotted_seconds),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::types::TurnLogId;

    fn timer(section: Phase, allotted: u32) -> ActiveTimer {
        ActiveTimer {
            participant_id: UserId::new(),
            section,
            started_at: Utc.with_ymd_and_hms(2026, 3, 4, 19, 30, 0).unwrap(),
            allotted_seconds: allotted,
            turn_log_id: TurnLogId::new(),
        }
    }

    #[test]
    fn test_overtime_formula() {
        assert_eq!(overtime_seconds(45, 60), 0);
        assert_eq!(overtime_seconds(60, 60), 0);
        assert_eq!(overtime_seconds(95, 60), 35);
    }

    #[test]
    fn test_lightning_status_thresholds() {
        let thresholds = WarningThresholds::default();
        let t = timer(Phase::LightningRound, 60);

        let on_time = read(&t, t.started_at + Duration::seconds(44), &thresholds);
        assert_eq!(on_time.status, TimerStatus::OnTime);
        assert_eq!(on_time.remaining_seconds, 16);

        let warning = read(&t, t.started_at + Duration::seconds(45), &thresholds);
        assert_eq!(warning.status, TimerStatus::Warning);

        let over = read(&t, t.started_at + Duration::seconds(72), &thresholds);
        assert_eq!(over.status, TimerStatus::Overtime);
        assert_eq!(over.overtime_seconds, 12);
        assert_eq!(over.remaining_seconds, 0);
    }

    #[test]
    fn test_full_checkin_warning_at_one_minute() {
        let thresholds = WarningThresholds::default();
        let t = timer(Phase::FullCheckins, 300);

        assert_eq!(
            read(&t, t.started_at + Duration::seconds(239), &thresholds).status,
            TimerStatus::OnTime
        );
        assert_eq!(
            read(&t, t.started_at + Duration::seconds(240), &thresholds).status,
            TimerStatus::Warning
        );
    }

    #[test]
    fn test_stop_measures_duration_and_overtime() {
        let t = timer(Phase::FullCheckins, 120);
        let stopped = stop(&t, t.started_at + Duration::milliseconds(150_700));

        assert_eq!(stopped.duration_seconds, 150);
        assert_eq!(stopped.overtime_seconds, 30);
    }
}
