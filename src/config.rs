//! # Publisher Configuration
//!
//! Loaded from `~/.config/geopublisher/config.toml`. A default file is written on first
//! start so the available options are discoverable; every field falls back to its
//! default when missing.
//!
//! ```toml
//! student_id = "816034662"
//!
//! [broker]
//! host = "localhost"
//! port = 1883
//! topic = "assignment/location"
//!
//! [queue]
//! capacity = 50
//! overflow_policy = "drop_oldest"
//! ```

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::location::{SimulatedTrack, UpdateRequest};
use crate::mqtt::payload::FIELD_SEPARATOR;
use crate::mqtt::{Backoff, BrokerSettings, ConnectionSettings};
use crate::queue::OverflowPolicy;

const CONFIG_DIR: &str = ".config/geopublisher";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("student_id must not contain '|' or line breaks")]
    InvalidStudentId,

    #[error("min_interval_ms must not exceed interval_ms")]
    IntervalOrder,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PublisherConfig {
    /// First field of every payload line
    pub student_id: String,
    pub log_level: String,
    /// Upper bound for `stop()` waiting on the drain loop
    pub stop_grace_ms: u64,
    pub broker: BrokerSettings,
    pub queue: QueueSettings,
    pub retry: RetrySettings,
    pub location: LocationSettings,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            student_id: String::new(),
            log_level: "info".to_string(),
            stop_grace_ms: 2000,
            broker: BrokerSettings::default(),
            queue: QueueSettings::default(),
            retry: RetrySettings::default(),
            location: LocationSettings::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Only used with the `block` policy
    pub block_timeout_ms: u64,
    pub batch_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 50,
            overflow_policy: OverflowPolicy::DropOldest,
            block_timeout_ms: 1000,
            batch_size: 10,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_reconnect_attempts: u32,
    pub max_publish_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            max_publish_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LocationSettings {
    pub interval_ms: u64,
    pub min_interval_ms: u64,
    /// Track followed by the desktop simulated provider
    pub simulated: SimulatedTrack,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            min_interval_ms: 2000,
            simulated: SimulatedTrack::default(),
        }
    }
}

impl LocationSettings {
    pub fn update_request(&self) -> UpdateRequest {
        UpdateRequest {
            interval: Duration::from_millis(self.interval_ms),
            min_interval: Duration::from_millis(self.min_interval_ms),
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .student_id
            .contains([FIELD_SEPARATOR, '\r', '\n'])
        {
            return Err(ConfigError::InvalidStudentId);
        }
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Empty("broker.host"));
        }
        if self.broker.topic.trim().is_empty() {
            return Err(ConfigError::Empty("broker.topic"));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Zero("broker.port"));
        }
        if self.broker.connect_timeout_ms == 0 {
            return Err(ConfigError::Zero("broker.connect_timeout_ms"));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Zero("queue.capacity"));
        }
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Zero("queue.batch_size"));
        }
        if self.retry.initial_backoff_ms == 0 {
            return Err(ConfigError::Zero("retry.initial_backoff_ms"));
        }
        if self.location.interval_ms == 0 {
            return Err(ConfigError::Zero("location.interval_ms"));
        }
        if self.location.min_interval_ms > self.location.interval_ms {
            return Err(ConfigError::IntervalOrder);
        }
        Ok(())
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.block_timeout_ms)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: self.broker.connect_timeout(),
            max_reconnect_attempts: self.retry.max_reconnect_attempts,
            max_publish_retries: self.retry.max_publish_retries,
            backoff: Backoff::new(
                Duration::from_millis(self.retry.initial_backoff_ms),
                Duration::from_millis(self.retry.max_backoff_ms),
            ),
            batch_size: self.queue.batch_size,
        }
    }

    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }

    /// Loads `path`, writing a default configuration there first if it does not exist
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;

        if exists {
            Self::load(path).await
        } else {
            info!("Creating default configuration at {}", path.display());
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = PublisherConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.topic, "assignment/location");
        assert_eq!(config.queue.capacity, 50);
        assert_eq!(config.stop_grace(), Duration::from_secs(2));
    }

    #[test]
    fn student_id_with_separator_is_rejected() {
        let config = PublisherConfig {
            student_id: "81|60".to_string(),
            ..PublisherConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidStudentId));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = PublisherConfig::default();
        config.queue.capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("queue.capacity")));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: PublisherConfig = toml::from_str(
            r#"
            student_id = "816034662"

            [broker]
            host = "broker.example.com"

            [queue]
            overflow_policy = "block"
            "#,
        )
        .unwrap();

        assert_eq!(config.student_id, "816034662");
        assert_eq!(config.broker.host, "broker.example.com");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.queue.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.queue.capacity, 50);
        assert_eq!(config.retry.max_backoff_ms, 30_000);
    }

    #[test]
    fn connection_settings_follow_config() {
        let mut config = PublisherConfig::default();
        config.retry.max_reconnect_attempts = 7;
        config.broker.connect_timeout_ms = 2500;
        let settings = config.connection_settings();
        assert_eq!(settings.max_reconnect_attempts, 7);
        assert_eq!(settings.connect_timeout, Duration::from_millis(2500));
        assert_eq!(settings.backoff.delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn load_or_create_writes_defaults_then_reads_them_back() {
        let tmp = TempDir::new().expect("create tempdir");
        let path = tmp.path().join("nested").join(CONFIG_FILE);

        let created = PublisherConfig::load_or_create(&path).await.unwrap();
        assert!(path.exists());

        let mut edited = created.clone();
        edited.student_id = "42".to_string();
        edited.save(&path).await.unwrap();

        let loaded = PublisherConfig::load_or_create(&path).await.unwrap();
        assert_eq!(loaded, edited);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let tmp = TempDir::new().expect("create tempdir");
        let path = tmp.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "broker = 5").await.unwrap();
        assert!(PublisherConfig::load(&path).await.is_err());
    }
}
