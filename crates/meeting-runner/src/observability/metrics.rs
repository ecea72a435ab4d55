//! Metrics definitions for the Meeting Runner.
//!
//! All metrics follow Prometheus naming conventions:
//! - `runner_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `section`: 2 values (`lightning_round`, `full_checkins`)
//! - `reason`: bounded by `RunnerError` variants
//! - `actor_type`: 2 values (controller, meeting)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Store commits are local or single-hop Redis calls
        .set_buckets_for_metric(
            Matcher::Full("runner_commit_latency_seconds".to_string()),
            &[
                0.001, 0.002, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set commit latency buckets: {e}"))?
        // Overtime is measured in whole seconds of speaking time
        .set_buckets_for_metric(
            Matcher::Full("runner_turn_overtime_seconds".to_string()),
            &[0.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0],
        )
        .map_err(|e| format!("Failed to set overtime buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Set the number of meetings with a live runner.
///
/// Metric: `runner_meetings_active`
pub fn set_meetings_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("runner_meetings_active").set(count as f64);
}

/// Adjust the number of open change-feed subscriptions.
///
/// Metric: `runner_subscribers_active`
pub fn subscriber_opened() {
    gauge!("runner_subscribers_active").increment(1.0);
}

/// See [`subscriber_opened`].
pub fn subscriber_closed() {
    gauge!("runner_subscribers_active").decrement(1.0);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `runner_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("runner_actor_mailbox_depth", "actor_type" => actor_type.to_string())
        .set(depth as f64);
}

// ============================================================================
// Turn Metrics
// ============================================================================

/// Record a finalized turn and its overtime.
///
/// Metrics: `runner_turns_completed_total`, `runner_turn_overtime_seconds`
/// Labels: `section`
pub fn record_turn_completed(section: &str, overtime_seconds: u32) {
    counter!("runner_turns_completed_total", "section" => section.to_string()).increment(1);
    histogram!("runner_turn_overtime_seconds", "section" => section.to_string())
        .record(f64::from(overtime_seconds));
}

/// Record a skipped turn.
///
/// Metric: `runner_turns_skipped_total`
/// Labels: `section`
pub fn record_turn_skipped(section: &str) {
    counter!("runner_turns_skipped_total", "section" => section.to_string()).increment(1);
}

// ============================================================================
// Authority & Rejections
// ============================================================================

/// Record a completed scribe hand-off.
///
/// Metric: `runner_handoffs_total`
pub fn record_handoff() {
    counter!("runner_handoffs_total").increment(1);
}

/// Record a rejected mutation.
///
/// Metric: `runner_rejections_total`
/// Labels: `reason`
pub fn record_rejection(reason: &str) {
    counter!("runner_rejections_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Store
// ============================================================================

/// Record latency of one store commit.
///
/// Metric: `runner_commit_latency_seconds`
pub fn record_commit_latency(duration: Duration) {
    histogram!("runner_commit_latency_seconds").record(duration.as_secs_f64());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::DebuggingRecorder;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        set_meetings_active(3);
        subscriber_opened();
        subscriber_closed();
        record_turn_completed("lightning_round", 0);
        record_turn_skipped("full_checkins");
        record_rejection("not_authorized");
    }

    #[test]
    fn test_runner_metrics_are_recorded() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_meetings_active(2);
            set_actor_mailbox_depth("meeting", 4);
            subscriber_opened();
            record_turn_completed("full_checkins", 42);
            record_turn_skipped("full_checkins");
            record_handoff();
            record_rejection("stale_state");
            record_commit_latency(Duration::from_millis(3));
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "runner_meetings_active",
            "runner_actor_mailbox_depth",
            "runner_subscribers_active",
            "runner_turns_completed_total",
            "runner_turn_overtime_seconds",
            "runner_turns_skipped_total",
            "runner_handoffs_total",
            "runner_rejections_total",
            "runner_commit_latency_seconds",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing metric {expected}, got {names:?}"
            );
        }
    }
}
