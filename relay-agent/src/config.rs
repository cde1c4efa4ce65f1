//! Configuration management
//!
//! Handles:
//! - Device identity and firmware metadata
//! - Remote store endpoints and device credentials (password from the OS keyring)
//! - Relay pin mapping, driver selection and power ratings
//! - Safety, scheduling and recovery tunables
//!
//! Every setting has a default; `validate` turns bad values into a
//! `ConfigurationFault` before the main loop starts.

use crate::error::{AgentError, ConfigurationFault};
use crate::relay::{PowerRatings, RelayDriver, RelayId, SimulatedDriver, SysfsGpio};
use keyring::Entry;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const KEYRING_SERVICE: &str = "relayhub-agent";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub device: DeviceConfig,
    pub remote: RemoteConfig,
    pub relays: RelaysConfig,
    pub safety: SafetyConfig,
    pub schedule: ScheduleConfig,
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub name: Option<String>,
    pub device_type: String,
    pub firmware_version: String,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub database_url: String,
    pub api_key: String,
    pub identity_url: String,
    pub device_email: String,
    #[serde(skip_serializing)] // Never written back; falls back to the keyring
    pub device_password: Option<String>,
    pub request_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub refresh_margin_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Simulated,
    Sysfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaysConfig {
    pub pins: Vec<u32>,
    pub names: Vec<String>,
    pub active_low: bool,
    pub driver: DriverKind,
    pub sysfs_root: PathBuf,
    pub power_ratings: BTreeMap<String, f32>,
    pub default_power_rating: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub max_active: usize,
    pub min_dwell_ms: u64,
    pub max_switch_count: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub sync_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub command_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    /// Re-execute the current binary in place
    Exec,
    /// Exit and let the supervisor restart us
    Exit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_faults: u32,
    pub min_restart_backoff_ms: u64,
    pub restart_mode: RestartMode,
}

/// Email/password pair exchanged for a session token
pub struct DeviceCredentials {
    pub email: String,
    pub password: SecretString,
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("email", &self.email)
            .field("password", &"[redacted]")
            .finish()
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "pico_w_001".to_string(),
            name: None,
            device_type: "relay_controller".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            api_key: String::new(),
            identity_url: "https://identitytoolkit.googleapis.com/v1/accounts:signInWithPassword".to_string(),
            device_email: String::new(),
            device_password: None,
            request_timeout_ms: 10_000,
            shutdown_timeout_ms: 2_000,
            refresh_margin_secs: 300,
        }
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("database_url", &self.database_url)
            .field("identity_url", &self.identity_url)
            .field("device_email", &self.device_email)
            .field("device_password", &self.device_password.as_ref().map(|_| "[redacted]"))
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("shutdown_timeout_ms", &self.shutdown_timeout_ms)
            .field("refresh_margin_secs", &self.refresh_margin_secs)
            .finish_non_exhaustive()
    }
}

impl Default for RelaysConfig {
    fn default() -> Self {
        let power_ratings = [("relay_1", 100.0), ("relay_2", 75.0), ("relay_3", 1500.0), ("relay_4", 200.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        Self {
            pins: (0..16).collect(),
            names: Vec::new(),
            active_low: true,
            driver: DriverKind::Simulated,
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            power_ratings,
            default_power_rating: 50.0,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_active: 12,
            min_dwell_ms: 1_000,
            max_switch_count: 10_000,
            enabled: true,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 3_000,
            heartbeat_interval_ms: 30_000,
            command_interval_ms: 5_000,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_faults: 10,
            min_restart_backoff_ms: 5_000,
            restart_mode: RestartMode::Exec,
        }
    }
}

impl AgentConfig {
    /// Load config from `$RELAYHUB_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self, ConfigurationFault> {
        let path = Self::config_file_path()?;

        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| ConfigurationFault::Unreadable(format!("{}: {}", path.display(), e)))?;
            Self::from_toml(&content)?
        } else {
            info!("No configuration at {}, using defaults", path.display());
            Self::default()
        };

        if config.remote.device_password.is_none() && !config.remote.device_email.is_empty() {
            config.remote.device_password = Self::load_password(&config.remote.device_email).ok();
        }

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigurationFault> {
        toml::from_str(content).map_err(|e| ConfigurationFault::Unreadable(e.to_string()))
    }

    pub fn config_file_path() -> Result<PathBuf, ConfigurationFault> {
        if let Ok(path) = std::env::var("RELAYHUB_CONFIG") {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir().ok_or(ConfigurationFault::Unreadable(
            "could not find config directory".to_string(),
        ))?;
        path.push("relayhub-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Load the device password from the secure OS keyring
    fn load_password(email: &str) -> Result<String, keyring::Error> {
        debug!("Reading device password from keyring for {}", email);
        Entry::new(KEYRING_SERVICE, email)?.get_password()
    }

    /// Store the device password in the secure OS keyring
    pub fn save_password(email: &str, password: &str) -> Result<(), keyring::Error> {
        Entry::new(KEYRING_SERVICE, email)?.set_password(password)
    }

    /// Reject anything that would make the main loop unsafe or useless
    pub fn validate(&self) -> Result<(), ConfigurationFault> {
        if self.device.device_id.trim().is_empty() {
            return Err(ConfigurationFault::MissingSetting("device.device_id"));
        }
        if self.device.device_id.contains(['/', '.', '#', '$', '[', ']']) {
            return Err(ConfigurationFault::InvalidSetting {
                key: "device.device_id",
                reason: "must not contain path characters".to_string(),
            });
        }

        let pins = &self.relays.pins;
        if pins.is_empty() {
            return Err(ConfigurationFault::InvalidPinMapping("no relay pins configured".to_string()));
        }
        if pins.len() > usize::from(RelayId::MAX) {
            return Err(ConfigurationFault::InvalidPinMapping(format!(
                "{} pins configured, at most {} supported",
                pins.len(),
                RelayId::MAX
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = pins.iter().find(|p| !seen.insert(**p)) {
            return Err(ConfigurationFault::InvalidPinMapping(format!("pin {} mapped twice", dup)));
        }
        if self.relays.names.len() > pins.len() {
            return Err(ConfigurationFault::InvalidSetting {
                key: "relays.names",
                reason: format!("{} names for {} relays", self.relays.names.len(), pins.len()),
            });
        }
        self.power_ratings()?;

        if self.remote.database_url.is_empty() {
            return Err(ConfigurationFault::MissingSetting("remote.database_url"));
        }
        reqwest::Url::parse(&self.remote.database_url).map_err(|e| ConfigurationFault::InvalidSetting {
            key: "remote.database_url",
            reason: e.to_string(),
        })?;
        if self.remote.api_key.is_empty() {
            return Err(ConfigurationFault::MissingSetting("remote.api_key"));
        }
        if self.remote.device_email.is_empty() {
            return Err(ConfigurationFault::MissingSetting("remote.device_email"));
        }
        if self.remote.device_password.is_none() {
            return Err(ConfigurationFault::MissingSetting("remote.device_password"));
        }
        if self.remote.request_timeout_ms == 0 || self.remote.shutdown_timeout_ms == 0 {
            return Err(ConfigurationFault::InvalidSetting {
                key: "remote.*_timeout_ms",
                reason: "timeouts must be non-zero".to_string(),
            });
        }

        if self.safety.max_active == 0 {
            return Err(ConfigurationFault::InvalidSetting {
                key: "safety.max_active",
                reason: "must allow at least one active relay".to_string(),
            });
        }

        let s = &self.schedule;
        if s.sync_interval_ms == 0 || s.heartbeat_interval_ms == 0 || s.command_interval_ms == 0 {
            return Err(ConfigurationFault::InvalidSetting {
                key: "schedule",
                reason: "intervals must be non-zero".to_string(),
            });
        }
        if self.recovery.max_faults == 0 {
            return Err(ConfigurationFault::InvalidSetting {
                key: "recovery.max_faults",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn power_ratings(&self) -> Result<PowerRatings, ConfigurationFault> {
        self.relays
            .power_ratings
            .iter()
            .try_fold(PowerRatings::new(self.relays.default_power_rating), |ratings, (key, watts)| {
                let relay_id: RelayId = key.parse().map_err(|e| ConfigurationFault::InvalidSetting {
                    key: "relays.power_ratings",
                    reason: e,
                })?;
                if *watts < 0.0 {
                    return Err(ConfigurationFault::InvalidSetting {
                        key: "relays.power_ratings",
                        reason: format!("negative rating for {}", key),
                    });
                }
                Ok(ratings.with_rating(relay_id, *watts))
            })
    }

    pub fn credentials(&self) -> Result<DeviceCredentials, ConfigurationFault> {
        let password = self
            .remote
            .device_password
            .as_ref()
            .ok_or(ConfigurationFault::MissingSetting("remote.device_password"))?;
        Ok(DeviceCredentials {
            email: self.remote.device_email.clone(),
            password: SecretString::new(password.clone().into_boxed_str()),
        })
    }

    pub fn open_driver(&self) -> Result<Box<dyn RelayDriver>, AgentError> {
        let driver: Box<dyn RelayDriver> = match self.relays.driver {
            DriverKind::Simulated => Box::new(SimulatedDriver::new()),
            DriverKind::Sysfs => Box::new(SysfsGpio::open(
                &self.relays.sysfs_root,
                &self.relays.pins,
                self.relays.active_low,
            )?),
        };
        Ok(driver)
    }

    pub fn device_name(&self) -> String {
        self.device
            .name
            .clone()
            .unwrap_or_else(|| format!("Relay Controller {}", self.device.device_id))
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.remote.database_url = "https://home-default-rtdb.example.com".to_string();
        config.remote.api_key = "key".to_string();
        config.remote.device_email = "device@example.com".to_string();
        config.remote.device_password = Some("hunter2".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.relays.pins.len(), 16);
        assert_eq!(config.safety.max_active, 12);
        assert_eq!(config.schedule.sync_interval_ms, 3_000);
        assert_eq!(config.schedule.heartbeat_interval_ms, 30_000);
        assert_eq!(config.recovery.max_faults, 10);
        assert_eq!(config.remote.refresh_margin(), Duration::from_secs(300));
    }

    #[test]
    fn test_valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_missing_settings_are_fatal() {
        let mut config = valid();
        config.remote.api_key.clear();
        assert_eq!(config.validate(), Err(ConfigurationFault::MissingSetting("remote.api_key")));

        let mut config = valid();
        config.remote.device_password = None;
        assert_eq!(
            config.validate(),
            Err(ConfigurationFault::MissingSetting("remote.device_password"))
        );
    }

    #[test]
    fn test_invalid_pin_mappings() {
        let mut config = valid();
        config.relays.pins = vec![0, 1, 1];
        assert!(matches!(config.validate(), Err(ConfigurationFault::InvalidPinMapping(_))));

        config.relays.pins = (0..17).collect();
        assert!(matches!(config.validate(), Err(ConfigurationFault::InvalidPinMapping(_))));

        config.relays.pins.clear();
        assert!(matches!(config.validate(), Err(ConfigurationFault::InvalidPinMapping(_))));
    }

    #[test]
    fn test_bad_power_rating_key() {
        let mut config = valid();
        config.relays.power_ratings.insert("heater".to_string(), 2000.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationFault::InvalidSetting { key: "relays.power_ratings", .. })
        ));
    }

    #[test]
    fn test_power_ratings_from_config() {
        let ratings = valid().power_ratings().unwrap();
        assert_eq!(ratings.rating_for(RelayId::new(3).unwrap()), 1500.0);
        assert_eq!(ratings.rating_for(RelayId::new(9).unwrap()), 50.0);
    }

    #[test]
    fn test_from_toml_partial_file() {
        let config = AgentConfig::from_toml(
            r#"
            [device]
            device_id = "garage"

            [relays]
            pins = [2, 3, 4, 5]
            driver = "sysfs"

            [safety]
            max_active = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.device.device_id, "garage");
        assert_eq!(config.relays.pins, vec![2, 3, 4, 5]);
        assert_eq!(config.relays.driver, DriverKind::Sysfs);
        assert_eq!(config.safety.max_active, 3);
        assert_eq!(config.safety.min_dwell_ms, 1_000);
        assert_eq!(config.recovery.restart_mode, RestartMode::Exec);
    }

    #[test]
    fn test_password_never_serialised() {
        let text = toml::to_string(&valid()).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(!format!("{:?}", valid()).contains("hunter2"));
    }

    #[test]
    fn test_config_file_path() {
        let path = AgentConfig::config_file_path().unwrap();
        let path = path.to_string_lossy();
        assert!(path.contains("relayhub") || std::env::var("RELAYHUB_CONFIG").is_ok());
    }
}
