// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use dm_emitter::entity::EntityId;
use dm_emitter::errors::ConfigError;
use std::env;
use std::time::Duration;

const DEFAULT_IDENTITY_URL: &str = "https://identity-api.newrelic.com";
const DEFAULT_METRICS_URL: &str = "https://metric-api.newrelic.com/metric/v1";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Settings of the forwarder process itself. Pipeline tuning lives in `EmitterConfig`.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub log_level: String,
    pub license_key: String,
    pub identity_url: String,
    pub metrics_url: String,
    pub agent_id: EntityId,
    pub integration_name: String,
    pub integration_interval: Duration,
    pub integration_user: String,
    pub protocol_v4_enabled: bool,
    pub request_timeout: Duration,
}

impl ForwarderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup("NRI_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|| "info".to_string());
        let license_key = lookup("NRI_LICENSE_KEY").unwrap_or_default();
        let identity_url =
            lookup("NRI_IDENTITY_URL").unwrap_or_else(|| DEFAULT_IDENTITY_URL.to_string());
        let metrics_url =
            lookup("NRI_METRICS_URL").unwrap_or_else(|| DEFAULT_METRICS_URL.to_string());
        let agent_id = match lookup("NRI_AGENT_ID") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(EntityId::new)
                .map_err(|_| ConfigError::Invalid(format!("NRI_AGENT_ID '{raw}' is not an id")))?,
            None => EntityId::EMPTY,
        };
        let integration_name =
            lookup("NRI_INTEGRATION_NAME").unwrap_or_else(|| "stdin".to_string());
        let integration_interval = lookup("NRI_INTEGRATION_INTERVAL_SECS")
            .and_then(|val| val.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INTERVAL);
        let integration_user = lookup("NRI_INTEGRATION_USER").unwrap_or_default();
        let protocol_v4_enabled = lookup("NRI_FEATURE_PROTOCOL_V4")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(true);

        let config = Self {
            log_level,
            license_key,
            identity_url,
            metrics_url,
            agent_id,
            integration_name,
            integration_interval,
            integration_user,
            protocol_v4_enabled,
            request_timeout: Duration::from_secs(10),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.license_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "NRI_LICENSE_KEY cannot be empty".to_string(),
            ));
        }
        if self.agent_id.is_empty() {
            return Err(ConfigError::Invalid(
                "NRI_AGENT_ID must be a non-zero entity id".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_minimal_config() {
        let config = ForwarderConfig::from_lookup(lookup(&[
            ("NRI_LICENSE_KEY", "abc"),
            ("NRI_AGENT_ID", "12"),
        ]))
        .expect("valid config");

        assert_eq!(config.agent_id, EntityId::new(12));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.integration_interval, Duration::from_secs(30));
        assert!(config.protocol_v4_enabled);
    }

    #[test]
    fn test_protocol_v4_can_be_disabled() {
        let config = ForwarderConfig::from_lookup(lookup(&[
            ("NRI_LICENSE_KEY", "abc"),
            ("NRI_AGENT_ID", "12"),
            ("NRI_FEATURE_PROTOCOL_V4", "FALSE"),
            ("NRI_LOG_LEVEL", "DEBUG"),
        ]))
        .expect("valid config");

        assert!(!config.protocol_v4_enabled);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_missing_license_key() {
        let err = ForwarderConfig::from_lookup(lookup(&[("NRI_AGENT_ID", "12")])).unwrap_err();
        assert!(err.to_string().contains("NRI_LICENSE_KEY"));
    }

    #[test]
    fn test_invalid_agent_id() {
        assert!(ForwarderConfig::from_lookup(lookup(&[
            ("NRI_LICENSE_KEY", "abc"),
            ("NRI_AGENT_ID", "agent"),
        ]))
        .is_err());
        assert!(ForwarderConfig::from_lookup(lookup(&[("NRI_LICENSE_KEY", "abc")])).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let err = ForwarderConfig::from_lookup(lookup(&[
            ("NRI_LICENSE_KEY", "abc"),
            ("NRI_AGENT_ID", "12"),
            ("NRI_LOG_LEVEL", "loud"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }
}
