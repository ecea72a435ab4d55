//! Observability for the Meeting Runner.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Metric labels are bounded (see [`metrics`]).
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `runner_meetings_active` | Gauge | none |
//! | `runner_subscribers_active` | Gauge | none |
//! | `runner_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `runner_turns_completed_total` | Counter | `section` |
//! | `runner_turns_skipped_total` | Counter | `section` |
//! | `runner_turn_overtime_seconds` | Histogram | `section` |
//! | `runner_handoffs_total` | Counter | none |
//! | `runner_rejections_total` | Counter | `reason` |
//! | `runner_commit_latency_seconds` | Histogram | none |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
