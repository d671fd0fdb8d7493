//! Provisioner configuration.
//!
//! Every setting has a default and can be overridden from the environment:
//!
//! | Variable                                 | Default                            |
//! |------------------------------------------|------------------------------------|
//! | `PROVISIONER_DEVICE_NAME`                | `MyDevice`                         |
//! | `PROVISIONER_INTERFACE`                  | `wlan0`                            |
//! | `PROVISIONER_WIFI_BACKEND`               | `nmcli` (or `sim`)                 |
//! | `PROVISIONER_SCAN_INTERVAL_SECS`         | 10                                 |
//! | `PROVISIONER_VANISH_THRESHOLD`           | 2                                  |
//! | `PROVISIONER_QUALITY_REFERENCE`          | driver default                     |
//! | `PROVISIONER_LINK_CHECK_INTERVAL_SECS`   | 2                                  |
//! | `PROVISIONER_JOIN_TIMEOUT_SECS`          | 30                                 |
//! | `PROVISIONER_ASSOCIATION_RETRIES`        | 1                                  |
//! | `PROVISIONER_NOTIFY_INTERVAL_MS`         | 1000                               |
//! | `PROVISIONER_PROBE_HOST`                 | `connectivitycheck.gstatic.com:80` |
//! | `PROVISIONER_PROBE_TIMEOUT_SECS`         | 5                                  |
//! | `PROVISIONER_CONNECTIVITY_INTERVAL_SECS` | 30                                 |
//! | `PROVISIONER_SHUTDOWN_GRACE_SECS`        | 5                                  |
//! | `PROVISIONER_STATUS_PORT`                | unset (server disabled)            |

use crate::ble::DEFAULT_DEVICE_NAME;
use crate::connectivity::{DEFAULT_PROBE_HOST, DEFAULT_PROBE_TIMEOUT};
use crate::gatt::DEFAULT_NOTIFY_INTERVAL;
use crate::supervisor::DEFAULT_JOIN_TIMEOUT;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by all configuration variables.
pub const ENV_PREFIX: &str = "PROVISIONER_";

/// Longest name that fits a legacy advertising packet.
pub const MAX_DEVICE_NAME_LEN: usize = 29;

/// Which WiFi driver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiBackendKind {
    /// NetworkManager through `nmcli`.
    Nmcli,
    /// In-memory demo driver.
    Sim,
}

impl FromStr for WifiBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nmcli" => Ok(Self::Nmcli),
            "sim" => Ok(Self::Sim),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    InvalidValue { var: String, value: String },
    #[error("unknown WiFi backend {0:?} (expected nmcli or sim)")]
    UnknownBackend(String),
    #[error("{0}")]
    Invalid(String),
}

/// Complete provisioner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerConfig {
    pub device_name: String,
    pub interface: String,
    pub wifi_backend: WifiBackendKind,
    pub scan_interval: Duration,
    pub vanish_threshold: u32,
    /// Overrides the driver's reference when set.
    pub quality_reference: Option<i32>,
    pub link_check_interval: Duration,
    pub join_timeout: Duration,
    pub association_retries: u32,
    pub notify_interval: Duration,
    pub probe_host: String,
    pub probe_timeout: Duration,
    pub connectivity_interval: Duration,
    pub shutdown_grace: Duration,
    /// Status server port; `None` disables the server.
    pub status_port: Option<u16>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            interface: "wlan0".to_string(),
            wifi_backend: WifiBackendKind::Nmcli,
            scan_interval: Duration::from_secs(10),
            vanish_threshold: 2,
            quality_reference: None,
            link_check_interval: Duration::from_secs(2),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            association_retries: 1,
            notify_interval: DEFAULT_NOTIFY_INTERVAL,
            probe_host: DEFAULT_PROBE_HOST.to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            connectivity_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            status_port: None,
        }
    }
}

impl ProvisionerConfig {
    /// Load from `PROVISIONER_*` environment variables and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variables, then validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let defaults = Self::default();

        let config = Self {
            device_name: vars.string("DEVICE_NAME").unwrap_or(defaults.device_name),
            interface: vars.string("INTERFACE").unwrap_or(defaults.interface),
            wifi_backend: vars.parse("WIFI_BACKEND")?.unwrap_or(defaults.wifi_backend),
            scan_interval: vars.secs("SCAN_INTERVAL_SECS")?.unwrap_or(defaults.scan_interval),
            vanish_threshold: vars
                .parse("VANISH_THRESHOLD")?
                .unwrap_or(defaults.vanish_threshold),
            quality_reference: vars.parse("QUALITY_REFERENCE")?.or(defaults.quality_reference),
            link_check_interval: vars
                .secs("LINK_CHECK_INTERVAL_SECS")?
                .unwrap_or(defaults.link_check_interval),
            join_timeout: vars.secs("JOIN_TIMEOUT_SECS")?.unwrap_or(defaults.join_timeout),
            association_retries: vars
                .parse("ASSOCIATION_RETRIES")?
                .unwrap_or(defaults.association_retries),
            notify_interval: vars
                .parse("NOTIFY_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.notify_interval),
            probe_host: vars.string("PROBE_HOST").unwrap_or(defaults.probe_host),
            probe_timeout: vars.secs("PROBE_TIMEOUT_SECS")?.unwrap_or(defaults.probe_timeout),
            connectivity_interval: vars
                .secs("CONNECTIVITY_INTERVAL_SECS")?
                .unwrap_or(defaults.connectivity_interval),
            shutdown_grace: vars
                .secs("SHUTDOWN_GRACE_SECS")?
                .unwrap_or(defaults.shutdown_grace),
            status_port: vars.parse("STATUS_PORT")?.or(defaults.status_port),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the provisioner cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() || self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "device name must be 1-{} bytes",
                MAX_DEVICE_NAME_LEN
            )));
        }
        if self.interface.is_empty() {
            return Err(ConfigError::Invalid("interface cannot be empty".into()));
        }
        if self.vanish_threshold == 0 {
            return Err(ConfigError::Invalid("vanish threshold must be at least 1".into()));
        }
        if matches!(self.quality_reference, Some(r) if r <= 0) {
            return Err(ConfigError::Invalid("quality reference must be positive".into()));
        }
        if !self.probe_host.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "probe host {:?} must be host:port",
                self.probe_host
            )));
        }

        for (name, value) in [
            ("scan interval", self.scan_interval),
            ("link check interval", self.link_check_interval),
            ("join timeout", self.join_timeout),
            ("probe timeout", self.probe_timeout),
            ("connectivity interval", self.connectivity_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var = format!("{}{}", ENV_PREFIX, name);
        (self.lookup)(&var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| (var, v))
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).map(|(_, v)| v)
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.raw(name) {
            Some((var, value)) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue { var, value }),
            None => Ok(None),
        }
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }
}
