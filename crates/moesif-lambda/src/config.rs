// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_BASE_URI: &str = "https://api.moesif.net";
pub const DEFAULT_BATCH_SIZE: usize = 25;
pub const DEFAULT_BATCH_MAX_TIME: Duration = Duration::from_millis(2000);
pub const DEFAULT_GOVERNANCE_WAIT: Duration = Duration::from_millis(1000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the telemetry middleware
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    /// Application id sent with every request to the ingestion and configuration APIs
    pub application_id: String,
    pub base_uri: String,
    /// Whether request and response bodies are captured
    pub log_body: bool,
    /// Submit every record on its own instead of buffering
    pub disable_batching: bool,
    pub batch_size: usize,
    pub batch_max_time: Duration,
    /// Bounded wait for the first governance rules fetch. `None` never waits.
    pub governance_wait_for_rules: Option<Duration>,
    pub request_timeout: Duration,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            application_id: String::new(),
            base_uri: DEFAULT_BASE_URI.to_string(),
            log_body: true,
            disable_batching: false,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_max_time: DEFAULT_BATCH_MAX_TIME,
            governance_wait_for_rules: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

impl MiddlewareConfig {
    pub fn new(application_id: &str) -> Self {
        Self {
            application_id: application_id.to_string(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let application_id = env::var("MOESIF_APPLICATION_ID").unwrap_or_default();
        let base_uri = env::var("MOESIF_BASE_URI").unwrap_or(defaults.base_uri);
        let log_body = env_flag("MOESIF_LOG_BODY").unwrap_or(defaults.log_body);
        let disable_batching =
            env_flag("MOESIF_DISABLE_BATCHING").unwrap_or(defaults.disable_batching);
        let batch_size = env::var("MOESIF_BATCH_SIZE")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(defaults.batch_size);
        let batch_max_time =
            env_millis("MOESIF_BATCH_MAX_TIME_MS").unwrap_or(defaults.batch_max_time);
        let governance_wait_for_rules = match env::var("MOESIF_GOVERNANCE_WAIT_MS") {
            Ok(val) if val.eq_ignore_ascii_case("true") => Some(DEFAULT_GOVERNANCE_WAIT),
            Ok(val) => val
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            Err(_) => None,
        };
        let https_proxy = env::var("HTTPS_PROXY").ok().filter(|p| !p.is_empty());
        let log_level = env::var("MOESIF_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            application_id,
            base_uri,
            log_body,
            disable_batching,
            batch_size,
            batch_max_time,
            governance_wait_for_rules,
            request_timeout: defaults.request_timeout,
            https_proxy,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_id.trim().is_empty() {
            return Err(ConfigError::MissingApplicationId);
        }

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "batch size must be greater than 0".to_string(),
            ));
        }

        if self.base_uri.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "MOESIF_BASE_URI cannot be empty".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

fn env_flag(key: &str) -> Option<bool> {
    match env::var(key).ok()?.to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_KEYS: [&str; 9] = [
        "MOESIF_APPLICATION_ID",
        "MOESIF_BASE_URI",
        "MOESIF_LOG_BODY",
        "MOESIF_DISABLE_BATCHING",
        "MOESIF_BATCH_SIZE",
        "MOESIF_BATCH_MAX_TIME_MS",
        "MOESIF_GOVERNANCE_WAIT_MS",
        "MOESIF_LOG_LEVEL",
        "HTTPS_PROXY",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_config_with_application_id_is_valid() {
        assert!(MiddlewareConfig::new("app-id").validate().is_ok());
    }

    #[test]
    fn test_validate_missing_application_id() {
        assert!(matches!(
            MiddlewareConfig::default().validate(),
            Err(ConfigError::MissingApplicationId)
        ));
        assert!(matches!(
            MiddlewareConfig::new("  ").validate(),
            Err(ConfigError::MissingApplicationId)
        ));
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let config = MiddlewareConfig {
            batch_size: 0,
            ..MiddlewareConfig::new("app-id")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_base_uri() {
        let config = MiddlewareConfig {
            base_uri: " ".to_string(),
            ..MiddlewareConfig::new("app-id")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_log_levels() {
        for level in VALID_LOG_LEVELS {
            let config = MiddlewareConfig {
                log_level: level.to_string(),
                ..MiddlewareConfig::new("app-id")
            };
            assert!(
                config.validate().is_ok(),
                "Log level '{}' should be valid",
                level
            );
        }
        let config = MiddlewareConfig {
            log_level: "verbose".to_string(),
            ..MiddlewareConfig::new("app-id")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        env::set_var("MOESIF_APPLICATION_ID", "app-id");

        let config = MiddlewareConfig::from_env().unwrap();
        assert_eq!(config.application_id, "app-id");
        assert_eq!(config.base_uri, DEFAULT_BASE_URI);
        assert!(config.log_body);
        assert!(!config.disable_batching);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.batch_max_time, Duration::from_millis(2000));
        assert_eq!(config.governance_wait_for_rules, None);
        assert_eq!(config.https_proxy, None);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("MOESIF_APPLICATION_ID", "app-id");
        env::set_var("MOESIF_BASE_URI", "http://localhost:9000");
        env::set_var("MOESIF_LOG_BODY", "false");
        env::set_var("MOESIF_DISABLE_BATCHING", "TRUE");
        env::set_var("MOESIF_BATCH_SIZE", "5");
        env::set_var("MOESIF_BATCH_MAX_TIME_MS", "250");
        env::set_var("MOESIF_GOVERNANCE_WAIT_MS", "300");
        env::set_var("MOESIF_LOG_LEVEL", "DEBUG");
        env::set_var("HTTPS_PROXY", "http://proxy:3128");

        let config = MiddlewareConfig::from_env().unwrap();
        assert_eq!(config.base_uri, "http://localhost:9000");
        assert!(!config.log_body);
        assert!(config.disable_batching);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.batch_max_time, Duration::from_millis(250));
        assert_eq!(
            config.governance_wait_for_rules,
            Some(Duration::from_millis(300))
        );
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy:3128"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_unparsable_numbers_fall_back() {
        clear_env();
        env::set_var("MOESIF_APPLICATION_ID", "app-id");
        env::set_var("MOESIF_BATCH_SIZE", "lots");
        env::set_var("MOESIF_BATCH_MAX_TIME_MS", "-1");
        env::set_var("MOESIF_GOVERNANCE_WAIT_MS", "true");

        let config = MiddlewareConfig::from_env().unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.batch_max_time, DEFAULT_BATCH_MAX_TIME);
        assert_eq!(
            config.governance_wait_for_rules,
            Some(DEFAULT_GOVERNANCE_WAIT)
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_requires_application_id() {
        clear_env();
        assert!(matches!(
            MiddlewareConfig::from_env(),
            Err(ConfigError::MissingApplicationId)
        ));
    }
}
