//! Secret types for values that must never reach logs.
//!
//! Re-exports [`secrecy`]. `SecretString` and `SecretBox<T>` implement
//! `Debug` with redaction, so a config struct that derives `Debug` stays safe
//! to log even when it holds connection strings with embedded credentials.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let redis_url = SecretString::from("redis://:hunter2@localhost:6379");
//! assert!(!format!("{redis_url:?}").contains("hunter2"));
//! assert!(redis_url.expose_secret().starts_with("redis://"));
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
