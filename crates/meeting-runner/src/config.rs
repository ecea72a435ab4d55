//! Meeting Runner configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::allocator::AllocationPolicy;
use crate::timer::WarningThresholds;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default health/metrics bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8091";

/// Default runner instance ID prefix.
pub const DEFAULT_RUNNER_ID_PREFIX: &str = "runner";

/// Default per-subscriber change event buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Default cap on concurrently running meetings.
pub const DEFAULT_MAX_MEETINGS: usize = 1000;

/// Where meeting records live.
#[derive(Clone)]
pub enum StoreBackend {
    /// Process memory. Not durable; local dev and tests.
    Memory,
    /// Redis at the given URL.
    Redis { url: SecretString },
}

impl fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Memory => f.write_str("Memory"),
            StoreBackend::Redis { .. } => f
                .debug_struct("Redis")
                .field("url", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Meeting Runner configuration.
#[derive(Clone)]
pub struct Config {
    /// Unique identifier for this runner instance.
    pub runner_id: String,

    pub store: StoreBackend,

    /// Bind address for `/health`, `/ready`, `/metrics`.
    pub health_bind_address: String,

    /// Maximum meetings with a live runner.
    pub max_meetings: usize,

    /// Change events buffered per subscriber before it lags.
    pub event_buffer: usize,

    /// Turn budgeting constants.
    pub allocation: AllocationPolicy,

    /// Timer warning thresholds.
    pub warnings: WarningThresholds,

    /// Emit JSON logs.
    pub log_json: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("runner_id", &self.runner_id)
            .field("store", &self.store)
            .field("health_bind_address", &self.health_bind_address)
            .field("max_meetings", &self.max_meetings)
            .field("event_buffer", &self.event_buffer)
            .field("allocation", &self.allocation)
            .field("warnings", &self.warnings)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `MissingEnvVar` when the Redis store is selected without `REDIS_URL`;
    /// `InvalidValue` for unparseable numbers or an unknown store.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let store = match vars.get("RUNNER_STORE").map(String::as_str) {
            None | Some("redis") => StoreBackend::Redis {
                url: SecretString::from(
                    vars.get("REDIS_URL")
                        .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                        .clone(),
                ),
            },
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!("RUNNER_STORE={other}")));
            }
        };

        let health_bind_address = vars
            .get("RUNNER_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let defaults = AllocationPolicy::default();
        let allocation = AllocationPolicy {
            lightning_seconds: parse_or(vars, "RUNNER_LIGHTNING_SECONDS", defaults.lightning_seconds)?,
            curriculum_reserve_seconds: parse_or(
                vars,
                "RUNNER_CURRICULUM_RESERVE_SECONDS",
                defaults.curriculum_reserve_seconds,
            )?,
            min_turn_seconds: parse_or(vars, "RUNNER_MIN_TURN_SECONDS", defaults.min_turn_seconds)?,
        };

        let default_warnings = WarningThresholds::default();
        let warnings = WarningThresholds {
            lightning_round: parse_or(
                vars,
                "RUNNER_LIGHTNING_WARNING_SECONDS",
                default_warnings.lightning_round,
            )?,
            full_checkins: parse_or(
                vars,
                "RUNNER_FULL_CHECKIN_WARNING_SECONDS",
                default_warnings.full_checkins,
            )?,
        };

        let event_buffer = parse_or(vars, "RUNNER_EVENT_BUFFER", DEFAULT_EVENT_BUFFER)?;
        if event_buffer == 0 {
            return Err(ConfigError::InvalidValue("RUNNER_EVENT_BUFFER=0".to_string()));
        }

        let max_meetings = parse_or(vars, "RUNNER_MAX_MEETINGS", DEFAULT_MAX_MEETINGS)?;
        let log_json = parse_or(vars, "RUNNER_LOG_JSON", false)?;

        let runner_id = vars.get("RUNNER_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_RUNNER_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            runner_id,
            store,
            health_bind_address,
            max_meetings,
            event_buffer,
            allocation,
            warnings,
            log_json,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "REDIS_URL".to_string(),
            "redis://:hunter2@localhost:6379".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        match &config.store {
            StoreBackend::Redis { url } => {
                assert_eq!(url.expose_secret(), "redis://:hunter2@localhost:6379");
            }
            StoreBackend::Memory => panic!("expected redis store"),
        }
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.max_meetings, DEFAULT_MAX_MEETINGS);
        assert_eq!(config.event_buffer, DEFAULT_EVENT_BUFFER);
        assert_eq!(config.allocation, AllocationPolicy::default());
        assert_eq!(config.warnings, WarningThresholds::default());
        assert!(!config.log_json);
        assert!(config.runner_id.starts_with("runner-"));
    }

    #[test]
    fn test_from_vars_custom_values() {
        let vars = HashMap::from([
            ("RUNNER_STORE".to_string(), "memory".to_string()),
            ("RUNNER_ID".to_string(), "runner-test-01".to_string()),
            ("RUNNER_LIGHTNING_SECONDS".to_string(), "45".to_string()),
            ("RUNNER_CURRICULUM_RESERVE_SECONDS".to_string(), "1200".to_string()),
            ("RUNNER_MIN_TURN_SECONDS".to_string(), "90".to_string()),
            ("RUNNER_LIGHTNING_WARNING_SECONDS".to_string(), "10".to_string()),
            ("RUNNER_FULL_CHECKIN_WARNING_SECONDS".to_string(), "30".to_string()),
            ("RUNNER_EVENT_BUFFER".to_string(), "64".to_string()),
            ("RUNNER_MAX_MEETINGS".to_string(), "20".to_string()),
            ("RUNNER_LOG_JSON".to_string(), "true".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert!(matches!(config.store, StoreBackend::Memory));
        assert_eq!(config.runner_id, "runner-test-01");
        assert_eq!(config.allocation.lightning_seconds, 45);
        assert_eq!(config.allocation.curriculum_reserve_seconds, 1200);
        assert_eq!(config.allocation.min_turn_seconds, 90);
        assert_eq!(config.warnings.lightning_round, 10);
        assert_eq!(config.warnings.full_checkins, 30);
        assert_eq!(config.event_buffer, 64);
        assert_eq!(config.max_meetings, 20);
        assert!(config.log_json);
    }

    #[test]
    fn test_memory_store_needs_no_redis_url() {
        let vars = HashMap::from([("RUNNER_STORE".to_string(), "memory".to_string())]);
        assert!(Config::from_vars(&vars).is_ok());
    }

    #[test]
    fn test_from_vars_missing_redis_url() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "REDIS_URL"));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let mut vars = base_vars();
        vars.insert("RUNNER_MIN_TURN_SECONDS".to_string(), "sixty".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(v)) if v == "RUNNER_MIN_TURN_SECONDS=sixty")
        );
    }

    #[test]
    fn test_unknown_store_rejected() {
        let vars = HashMap::from([("RUNNER_STORE".to_string(), "postgres".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("redis://"));
        assert!(!debug_output.contains("hunter2"));
    }
}
