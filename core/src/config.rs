/// Link configuration
///
/// Timing and capacity knobs for the scan and advertise controllers and the
/// channel adapter. Everything has a default; a JSON file only needs the
/// fields it overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ble::gatt::{DISCOVERY_CHARACTERISTIC_UUID, SERVICE_UUID};

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

fn require_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be greater than zero"));
    }
    Ok(())
}

/// Central-role settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub service_uuid: Uuid,
    pub discovery_characteristic_uuid: Uuid,
    /// Ceiling on peers between `Attempting` and `ReadingPayload`
    pub max_concurrent_connections: usize,
    /// Minimum spacing between attempts to the same peer
    pub cooldown_ms: u64,
    /// Cooldown refusals after which one attempt is let through anyway
    pub skip_threshold: u32,
    /// Cooldown overrides allowed before a successful read (`null` = no bound)
    pub max_cooldown_overrides: Option<u32>,
    pub max_quick_retries: u32,
    pub quick_retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Periodic scan restart
    pub restart_interval_ms: u64,
    /// Switch to unfiltered scanning if nothing was sighted by then
    pub fallback_after_ms: u64,
    /// Pause scanning while a connect request is outstanding
    pub pause_scan_while_connecting: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            discovery_characteristic_uuid: DISCOVERY_CHARACTERISTIC_UUID,
            max_concurrent_connections: 5,
            cooldown_ms: 3_000,
            skip_threshold: 3,
            max_cooldown_overrides: Some(3),
            max_quick_retries: 1,
            quick_retry_delay_ms: 600,
            connect_timeout_ms: 8_000,
            restart_interval_ms: 12_000,
            fallback_after_ms: 10_000,
            pause_scan_while_connecting: true,
        }
    }
}

impl ScanConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn quick_retry_delay(&self) -> Duration {
        Duration::from_millis(self.quick_retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_millis(self.restart_interval_ms)
    }

    pub fn fallback_after(&self) -> Duration {
        Duration::from_millis(self.fallback_after_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_connections == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_connections",
                "at least one connection slot is required",
            ));
        }
        if self.skip_threshold == 0 {
            return Err(ConfigError::invalid(
                "skip_threshold",
                "a zero threshold disables the cooldown",
            ));
        }
        if self.service_uuid == self.discovery_characteristic_uuid {
            return Err(ConfigError::invalid(
                "discovery_characteristic_uuid",
                "must differ from the service identifier",
            ));
        }
        require_nonzero("connect_timeout_ms", self.connect_timeout_ms)?;
        require_nonzero("restart_interval_ms", self.restart_interval_ms)?;
        require_nonzero("fallback_after_ms", self.fallback_after_ms)?;
        Ok(())
    }
}

/// Peripheral-role settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertiseConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// Advertising start retries before giving up
    pub max_retries: u32,
    /// Retry n waits n times this long
    pub retry_base_delay_ms: u64,
    pub local_name: Option<String>,
}

impl Default for AdvertiseConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            characteristic_uuid: DISCOVERY_CHARACTERISTIC_UUID,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            local_name: None,
        }
    }
}

impl AdvertiseConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_uuid == self.characteristic_uuid {
            return Err(ConfigError::invalid(
                "characteristic_uuid",
                "must differ from the service identifier",
            ));
        }
        require_nonzero("retry_base_delay_ms", self.retry_base_delay_ms)?;
        if let Some(name) = &self.local_name {
            // Legacy advertising PDUs leave little room for a name
            if name.len() > 29 {
                return Err(ConfigError::invalid("local_name", "longer than 29 bytes"));
            }
        }
        Ok(())
    }
}

/// Byte-stream channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Upper bound on one readiness wait before re-polling the stream
    pub poll_interval_ms: u64,
    /// How long an outbound channel request may stay unanswered
    pub open_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            open_timeout_ms: 10_000,
        }
    }
}

impl ChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("poll_interval_ms", self.poll_interval_ms)?;
        require_nonzero("open_timeout_ms", self.open_timeout_ms)?;
        Ok(())
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub scan: ScanConfig,
    pub advertise: AdvertiseConfig,
    pub channel: ChannelConfig,
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scan.validate()?;
        self.advertise.validate()?;
        self.channel.validate()
    }

    /// `<config_dir>/nearlink/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nearlink").join("config.json"))
    }

    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: LinkConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        info!("Loaded link config from {}", path.display());
        Ok(config)
    }

    /// Load from the default location, falling back to defaults if absent
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}
