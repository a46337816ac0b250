//! Configuration parsing.
//!
//! The fencing configuration is a TOML file constructed into a
//! [`FenceConfig`] once at process start and handed by reference to the
//! prober, the backend drivers and the self-test harness. Every field has a
//! default so a missing `[section]` falls back to sensible values; unknown
//! keys are rejected so a typo cannot silently disable a setting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::credentials::CredentialConfig;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nodefence/nodefence.toml";

/// Default location of the host-binding table.
pub const DEFAULT_HOSTS_PATH: &str = "/etc/nodefence/hosts";

/// Top-level fencing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FenceConfig {
    /// Path to the host-binding table.
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,

    /// Liveness probe settings.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Direct power control (IPMI) settings.
    #[serde(default)]
    pub direct_power: DirectPowerConfig,

    /// Redundant power-management proxy (powerman) settings.
    #[serde(default)]
    pub redundant_proxy: RedundantProxyConfig,

    /// Virtualized host (vCenter) settings.
    #[serde(default)]
    pub virtualized_host: VirtualizedHostConfig,
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            hosts_file: default_hosts_file(),
            probe: ProbeConfig::default(),
            direct_power: DirectPowerConfig::default(),
            redundant_proxy: RedundantProxyConfig::default(),
            virtualized_host: VirtualizedHostConfig::default(),
        }
    }
}

impl FenceConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load configuration from `explicit` if given, otherwise from
    /// [`DEFAULT_CONFIG_PATH`].
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file that was explicitly asked for is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    Ok(Self::default())
                }
            },
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.status_locations.is_empty() {
            return Err(ConfigError::Validation(
                "probe.status_locations must list at least one file".to_string(),
            ));
        }
        if self.direct_power.status_retries == 0 {
            return Err(ConfigError::Validation(
                "direct_power.status_retries must be at least 1".to_string(),
            ));
        }
        if self.redundant_proxy.port == 0 {
            return Err(ConfigError::Validation(
                "redundant_proxy.port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Liveness probe configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    /// ssh client binary.
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    /// Remote login user; ssh's own default when unset.
    #[serde(default)]
    pub user: Option<String>,

    /// Private key passed with `-i`.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// ssh `ConnectTimeout`.
    #[serde(default = "default_probe_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Ceiling on the whole remote command, connection included.
    #[serde(default = "default_probe_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Files searched on the target node for the resource identifier.
    #[serde(default = "default_status_locations")]
    pub status_locations: Vec<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ssh_program: default_ssh_program(),
            user: None,
            identity_file: None,
            connect_timeout: default_probe_connect_timeout(),
            command_timeout: default_probe_command_timeout(),
            status_locations: default_status_locations(),
        }
    }
}

/// Direct power control (`ipmitool`) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectPowerConfig {
    /// ipmitool binary.
    #[serde(default = "default_ipmitool_program")]
    pub ipmitool_program: String,

    /// ipmitool `-I` interface.
    #[serde(default = "default_ipmi_interface")]
    pub interface: String,

    /// BMC login.
    #[serde(default)]
    pub credentials: CredentialConfig,

    /// Number of status polls after the power-off command.
    #[serde(default = "default_status_retries")]
    pub status_retries: u32,

    /// Sleep before each status poll.
    #[serde(default = "default_status_wait", with = "humantime_serde")]
    pub status_wait: Duration,

    /// Ceiling on each ipmitool invocation.
    #[serde(default = "default_backend_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for DirectPowerConfig {
    fn default() -> Self {
        Self {
            ipmitool_program: default_ipmitool_program(),
            interface: default_ipmi_interface(),
            credentials: CredentialConfig::default(),
            status_retries: default_status_retries(),
            status_wait: default_status_wait(),
            command_timeout: default_backend_command_timeout(),
        }
    }
}

/// Redundant power-management proxy (`pm`) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedundantProxyConfig {
    /// powerman client binary.
    #[serde(default = "default_pm_program")]
    pub pm_program: String,

    /// powermand TCP port, used for both the reachability check and `-h`.
    #[serde(default = "default_powerman_port")]
    pub port: u16,

    /// TCP connect timeout for the reachability check.
    #[serde(default = "default_reachability_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Ceiling on each pm invocation.
    #[serde(default = "default_backend_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for RedundantProxyConfig {
    fn default() -> Self {
        Self {
            pm_program: default_pm_program(),
            port: default_powerman_port(),
            connect_timeout: default_reachability_timeout(),
            command_timeout: default_backend_command_timeout(),
        }
    }
}

/// Virtualized host (vCenter REST) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualizedHostConfig {
    /// API login.
    #[serde(default)]
    pub credentials: CredentialConfig,

    /// Wait between the power-off request and the state poll.
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,

    /// HTTP connect timeout.
    #[serde(default = "default_http_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// HTTP request timeout.
    #[serde(default = "default_http_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Skip TLS certificate verification (self-signed vCenter appliances).
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for VirtualizedHostConfig {
    fn default() -> Self {
        Self {
            credentials: CredentialConfig::default(),
            settle: default_settle(),
            connect_timeout: default_http_connect_timeout(),
            request_timeout: default_http_request_timeout(),
            accept_invalid_certs: false,
        }
    }
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from(DEFAULT_HOSTS_PATH)
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

const fn default_probe_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_probe_command_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_status_locations() -> Vec<PathBuf> {
    vec![PathBuf::from("/proc/mounts")]
}

fn default_ipmitool_program() -> String {
    "ipmitool".to_string()
}

fn default_ipmi_interface() -> String {
    "lanplus".to_string()
}

const fn default_status_retries() -> u32 {
    5
}

const fn default_status_wait() -> Duration {
    Duration::from_secs(2)
}

const fn default_backend_command_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_pm_program() -> String {
    "pm".to_string()
}

const fn default_powerman_port() -> u16 {
    10101
}

const fn default_reachability_timeout() -> Duration {
    Duration::from_secs(3)
}

const fn default_settle() -> Duration {
    Duration::from_secs(5)
}

const fn default_http_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_http_request_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML is malformed or has unknown keys.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Validation(String),
}
