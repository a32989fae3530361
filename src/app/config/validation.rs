use super::{Config, ConfigError};
use url::Url;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instrumentation_key.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Instrumentation key must not be empty".to_string(),
            ));
        }

        Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid endpoint URL '{}': {}", self.endpoint, e))
        })?;

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.batch_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch interval must be greater than 0".to_string(),
            ));
        }

        if self.file_retention_period_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "File retention period must be greater than 0".to_string(),
            ));
        }

        if self.max_redirects == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max redirects must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 || self.connection_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Timeouts must be greater than 0".to_string(),
            ));
        }

        if self.bearer_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ConfigError::InvalidConfig(
                "Bearer token must not be empty when set".to_string(),
            ));
        }

        Ok(())
    }
}
