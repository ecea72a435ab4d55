//! # Runner Test Utilities
//!
//! Shared test utilities for the Meeting Runner.
//!
//! ## Modules
//!
//! - `fixtures` - Seeded meetings and a spawned runner over the in-memory store
//! - `failing_store` - Store wrapper that fails commits on demand
//! - `assertions` - Invariant checks over turn logs and change streams
//!
//! ## Usage
//!
//! ```rust,ignore
//! use runner_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestMeeting::new()
//!         .with_member(Some(PriorityTier::P1))
//!         .with_member(None)
//!         .spawn()
//!         .await;
//!
//!     harness.advance_to(Phase::LightningRound).await;
//!     // ...
//! }
//! ```

pub mod assertions;
pub mod failing_store;
pub mod fixtures;

pub use assertions::*;
pub use failing_store::FailingStore;
pub use fixtures::*;
