//! Typed configuration groups derived from the flat [`Config`].

use super::Config;
use crate::buffer::ChannelConfig;
use crate::reliability::DiskConfig;
use crate::sender::SenderConfig;
use std::path::PathBuf;
use std::time::Duration;

impl Config {
    pub fn channel_group(&self) -> ChannelConfig {
        ChannelConfig {
            batch_size: self.batch_size,
            batch_interval: Duration::from_millis(self.batch_interval_ms),
        }
    }

    pub fn sender_group(&self) -> SenderConfig {
        SenderConfig {
            endpoint: self.endpoint.clone(),
            instrumentation_key: self.instrumentation_key.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            max_redirects: self.max_redirects,
            disk_retry_enabled: self.disk_retry_enabled,
            resend_interval: Duration::from_millis(self.disk_retry_interval_ms),
            ..SenderConfig::default()
        }
    }

    pub fn disk_group(&self) -> DiskConfig {
        DiskConfig {
            storage_dir: DiskConfig::storage_dir_for(
                &self.storage_base_dir(),
                &self.instrumentation_key,
            ),
            max_bytes_on_disk: self.max_bytes_on_disk,
            retention_period: Duration::from_millis(self.file_retention_period_ms),
            ..DiskConfig::default()
        }
    }

    pub fn storage_base_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
