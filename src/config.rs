//! Pipeline configuration.
//!
//! Configuration is immutable once the pipeline starts. It can be built in
//! code or loaded from a TOML file; either way it is validated before use.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level device pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Hub hostname, e.g. `contoso.example-hub.net`.
    pub hostname: String,
    /// Device identifier (must match `[a-zA-Z0-9._-]+`).
    pub device_id: String,
    /// Module identifier for module identities.
    #[serde(default)]
    pub module_id: Option<String>,
    /// Tunnel the pub/sub protocol over websockets (port 443).
    #[serde(default)]
    pub websockets: bool,
    /// Transparently connect when a network-bound operation arrives while
    /// disconnected. When off, such operations fail immediately.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// Reconnect with backoff after an unsolicited connection drop.
    #[serde(default = "default_true")]
    pub connection_retry: bool,
    /// Keep-alive interval for the pub/sub transport, in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// How long a request/response operation may wait for its response.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Lead time before credential expiry at which renewal begins.
    #[serde(default = "default_renewal_margin_secs")]
    pub sas_renewal_margin_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_renewal_margin_secs() -> u64 {
    120
}

/// Exponential backoff policy shared by operation retry and reconnect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap applied to the doubled delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Total attempts (first try included) before an operation fails
    /// terminally with its last error.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Uniform jitter applied to each delay, as a fraction of the delay.
    /// `0.1` means the delay is drawn from `[0.9 * d, 1.1 * d]`.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given retry number (1-based), without jitter:
    /// base doubling per attempt, capped at `max_delay_ms`.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Backoff delay for the given retry number with jitter applied.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_for(retry).as_millis() as f64;
        let jitter = self.jitter_ratio.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_millis(base as u64);
        }
        let factor = rand::rng().random_range(1.0 - jitter..=1.0 + jitter);
        Duration::from_millis((base * factor).round() as u64)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineConfig {
    pub fn new(hostname: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            module_id: None,
            websockets: false,
            auto_connect: default_true(),
            connection_retry: default_true(),
            keep_alive_secs: default_keep_alive_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            sas_renewal_margin_secs: default_renewal_margin_secs(),
            retry: RetryPolicy::default(),
        }
    }

    /// Load configuration from a TOML file and validate it.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.is_empty() {
            return Err(ConfigError::InvalidConfig("hostname is empty".to_string()));
        }
        validate_identifier(&self.device_id)?;
        if let Some(module_id) = &self.module_id {
            validate_identifier(module_id)?;
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(ConfigError::InvalidConfig(
                "retry.jitter_ratio must be within [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn sas_renewal_margin(&self) -> Duration {
        Duration::from_secs(self.sas_renewal_margin_secs)
    }
}

fn validate_identifier(id: &str) -> Result<(), ConfigError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidDeviceId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::new("hub.example.net", "device-1");
        assert!(config.auto_connect);
        assert!(config.connection_retry);
        assert!(!config.websockets);
        assert_eq!(config.keep_alive_secs, 60);
        assert_eq!(config.sas_renewal_margin_secs, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_device_id() {
        let mut config = PipelineConfig::new("hub.example.net", "device/one");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDeviceId(_))
        ));

        config.device_id = "device-one_2.a".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = PipelineConfig::new("hub.example.net", "d1");
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            max_attempts: 10,
            jitter_ratio: 0.0,
        };
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(5_000));
        assert_eq!(policy.base_delay_for(40), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
            jitter_ratio: 0.25,
        };
        for retry in 1..=5 {
            let base = policy.base_delay_for(retry).as_millis() as f64;
            let jittered = policy.delay_for(retry).as_millis() as f64;
            assert!(jittered >= (base * 0.75).floor());
            assert!(jittered <= (base * 1.25).ceil());
        }
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.toml");
        std::fs::write(
            &path,
            r#"
hostname = "hub.example.net"
device_id = "sensor-7"
websockets = true

[retry]
base_delay_ms = 500
max_delay_ms = 8000
max_attempts = 3
jitter_ratio = 0.2
"#,
        )
        .unwrap();

        let config = PipelineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.device_id, "sensor-7");
        assert!(config.websockets);
        assert!(config.auto_connect); // default survives partial files
        assert_eq!(config.retry.max_attempts, 3);
    }

    proptest! {
        // Consecutive backoff delays never decrease up to the cap.
        #[test]
        fn prop_backoff_non_decreasing(base in 1u64..5_000, cap in 5_000u64..120_000) {
            let policy = RetryPolicy {
                base_delay_ms: base,
                max_delay_ms: cap,
                max_attempts: 10,
                jitter_ratio: 0.0,
            };
            let mut last = Duration::ZERO;
            for retry in 1..=16u32 {
                let delay = policy.base_delay_for(retry);
                prop_assert!(delay >= last);
                prop_assert!(delay <= Duration::from_millis(cap));
                last = delay;
            }
        }
    }
}
