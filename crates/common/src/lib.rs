//! Identifier and secret types shared across the meeting runner crates.

#![warn(clippy::pedantic)]

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for common identifier types
pub mod types;
