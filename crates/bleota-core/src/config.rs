//! Receiver configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::constants::{FLASH_WRITE_BLOCK, MAX_ATTR_VALUE_LEN, STAGING_FILE_NAME};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue_capacity must be at least 1")]
    ZeroQueueCapacity,

    #[error("write_block_size must be at least 1")]
    ZeroBlockSize,

    #[error("max_message_len must be at least 1")]
    ZeroMessageLen,

    #[error("status_interval_ms must be at least 1")]
    ZeroStatusInterval,
}

/// Configuration for an OTA receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Directory holding the staged image.
    pub staging_dir: PathBuf,
    /// Staged image file name.
    pub staging_file: String,
    /// Staging store capacity in bytes.
    pub staging_capacity: u64,
    /// File standing in for the update partition.
    pub flash_path: PathBuf,
    /// Update partition size in bytes.
    pub flash_capacity: u64,
    /// Inbound queue depth.
    pub queue_capacity: usize,
    /// Largest accepted inbound message.
    pub max_message_len: usize,
    /// Status notification cadence.
    pub status_interval_ms: u64,
    /// Reset a receiving session after this long without input.
    pub idle_timeout_secs: u64,
    /// Flash programming block size.
    pub write_block_size: usize,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("staging"),
            staging_file: STAGING_FILE_NAME.to_string(),
            staging_capacity: 4 * 1024 * 1024,
            flash_path: PathBuf::from("ota_partition.bin"),
            flash_capacity: 0x1E_0000,
            queue_capacity: 16,
            max_message_len: MAX_ATTR_VALUE_LEN,
            status_interval_ms: 500,
            idle_timeout_secs: 30,
            write_block_size: FLASH_WRITE_BLOCK,
        }
    }
}

impl OtaConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OtaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.write_block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.max_message_len == 0 {
            return Err(ConfigError::ZeroMessageLen);
        }
        if self.status_interval_ms == 0 {
            return Err(ConfigError::ZeroStatusInterval);
        }
        Ok(())
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    /// `None` disables the idle timeout.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OtaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.max_message_len, 512);
        assert_eq!(config.status_interval(), Duration::from_millis(500));
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.staging_file, "firmware.bin");
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let config = OtaConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroQueueCapacity));

        let config = OtaConfig {
            write_block_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroBlockSize));

        let config = OtaConfig {
            status_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroStatusInterval));
    }

    #[test]
    fn test_idle_timeout_disabled() {
        let config = OtaConfig {
            idle_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_toml_roundtrip_and_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ota.toml");

        let config = OtaConfig {
            flash_capacity: 1234,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(OtaConfig::load_from_file(&path).unwrap(), config);

        std::fs::write(&path, "queue_capacity = 4\n").unwrap();
        let loaded = OtaConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.queue_capacity, 4);
        assert_eq!(loaded.write_block_size, 4096);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ota.toml");
        std::fs::write(&path, "queue_capacity = 0\n").unwrap();
        assert!(OtaConfig::load_from_file(&path).is_err());
    }
}
