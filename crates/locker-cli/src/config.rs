//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use locker_core::service_client::ApiConfig;
use locker_core::{BtleOptions, ClientConfig, RetryPolicy, StageTimeouts};
use locker_types::Coordinates;

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Locker API settings
    #[serde(default)]
    pub api: ApiSection,

    /// BLE scanning settings
    #[serde(default)]
    pub ble: BleSection,

    /// Per-stage handshake timeouts
    #[serde(default)]
    pub timeouts: TimeoutSection,

    /// Wireless retry settings
    #[serde(default)]
    pub retry: RetrySection,

    /// Fixed location reported for the network fallback
    #[serde(default)]
    pub location: Option<LocationSection>,
}

/// Locker API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSection {
    /// Base URL of the locker API. Without it only `scan` and `read` work.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

fn default_api_timeout() -> u64 {
    10
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_api_timeout(),
        }
    }
}

/// BLE scanning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleSection {
    /// Scan time box in seconds
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,

    /// Only consider peripherals advertising this service
    #[serde(default)]
    pub service_uuid: Option<String>,

    /// Handshake characteristic; the first one found is used when unset
    #[serde(default)]
    pub characteristic_uuid: Option<String>,
}

fn default_scan_secs() -> u64 {
    10
}

impl Default for BleSection {
    fn default() -> Self {
        Self {
            scan_secs: default_scan_secs(),
            service_uuid: None,
            characteristic_uuid: None,
        }
    }
}

/// Per-stage handshake timeouts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_stage_ms")]
    pub discovery_ms: u64,
    #[serde(default = "default_stage_ms")]
    pub read_ms: u64,
    #[serde(default = "default_stage_ms")]
    pub write_ms: u64,
    /// Deadline for one key service call.
    #[serde(default = "default_key_ms")]
    pub key_ms: u64,
}

fn default_connect_ms() -> u64 {
    15_000
}

fn default_stage_ms() -> u64 {
    10_000
}

fn default_key_ms() -> u64 {
    15_000
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            discovery_ms: default_stage_ms(),
            read_ms: default_stage_ms(),
            write_ms: default_stage_ms(),
            key_ms: default_key_ms(),
        }
    }
}

/// Wireless retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    /// Total wireless attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause before each retry, in milliseconds
    #[serde(default)]
    pub delay_ms: u64,

    /// Randomize the pause by up to 25%
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: 0,
            jitter: false,
        }
    }
}

/// A fixed location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSection {
    pub lat: f64,
    pub lng: f64,
}

fn parse_uuid(field: &str, value: Option<&str>) -> Result<Option<Uuid>> {
    value
        .map(|s| Uuid::parse_str(s).with_context(|| format!("Invalid {}: {}", field, s)))
        .transpose()
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("locker")
            .join("config.toml")
    }

    /// Load config from `path`, or the default path.
    ///
    /// A missing file at the default path yields the defaults; a missing
    /// file that was named explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path(), false),
        };
        if !path.exists() {
            if explicit {
                bail!("Config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every setting converts to a valid core setting.
    pub fn validate(&self) -> Result<()> {
        self.client_config()?;
        self.btle_options()?;
        if let Some(api) = self.api_config() {
            api.validate()?;
        }
        if let Some(location) = self.location {
            Coordinates::new(location.lat, location.lng).context("Invalid [location]")?;
        }
        Ok(())
    }

    /// Session configuration for the core client.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let t = &self.timeouts;
        let timeouts = StageTimeouts::default()
            .connecting(Duration::from_millis(t.connect_ms))
            .discovery(Duration::from_millis(t.discovery_ms))
            .read(Duration::from_millis(t.read_ms))
            .write(Duration::from_millis(t.write_ms))
            .key_service(Duration::from_millis(t.key_ms));
        let retry = RetryPolicy::new(self.retry.max_attempts)
            .initial_delay(Duration::from_millis(self.retry.delay_ms))
            .jitter(self.retry.jitter);

        let config = ClientConfig::new().stage_timeouts(timeouts).retry(retry);
        config.validate()?;
        Ok(config)
    }

    /// Options for the BLE transport.
    pub fn btle_options(&self) -> Result<BtleOptions> {
        let mut options = BtleOptions::new().scan_duration(Duration::from_secs(self.ble.scan_secs));
        if let Some(uuid) = parse_uuid("service_uuid", self.ble.service_uuid.as_deref())? {
            options = options.service_uuid(uuid);
        }
        if let Some(uuid) =
            parse_uuid("characteristic_uuid", self.ble.characteristic_uuid.as_deref())?
        {
            options = options.characteristic_uuid(uuid);
        }
        options.validate()?;
        Ok(options)
    }

    /// Locker API configuration, if a base URL is set.
    pub fn api_config(&self) -> Option<ApiConfig> {
        self.api.base_url.as_ref().map(|url| {
            ApiConfig::new(url.clone()).timeout(Duration::from_secs(self.api.timeout_secs))
        })
    }
}
