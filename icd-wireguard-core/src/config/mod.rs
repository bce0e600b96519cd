//! Configuration module
//!
//! Handles the daemon settings and the tunnel configuration store, both
//! loaded from one TOML file.

use crate::tunnel::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod provider;
pub mod store;
pub mod toml_config;

pub use provider::{ConfigProvider, ProviderInfo, TomlConfigProvider};
pub use store::{IapEntry, PeerConfig, TunnelConfig, TunnelStore};

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Daemon settings from the `[daemon]` table
///
/// Every field has a default, so an empty or missing table yields a working
/// configuration that drives `/usr/bin/wg-quick` as root on `icdwg0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Tunnel bringup tool, resolved through `PATH` when relative
    pub tool_path: PathBuf,

    /// The single tunnel interface managed system-wide
    pub interface_name: String,

    /// User the bringup and teardown commands run as
    pub run_as: String,

    /// Directory the generated `<interface>.conf` is written to
    pub config_output_dir: Option<PathBuf>,

    /// Local control socket path (platform default when unset)
    pub socket_path: Option<PathBuf>,

    /// Register the `org.maemo.Wireguard` service on the system bus
    pub dbus: bool,

    /// Register a standing carrier connection with this network id at startup
    pub carrier_id: Option<String>,

    /// Seconds between SIGTERM and SIGKILL when terminating the bringup process
    pub stop_grace_secs: u64,

    /// Status broadcasts buffered per listener before old ones are dropped
    pub status_buffer: usize,

    /// Retry policy for opening the kernel notification socket
    pub monitor_retry: RetryPolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from("/usr/bin/wg-quick"),
            interface_name: "icdwg0".to_string(),
            run_as: "root".to_string(),
            config_output_dir: Some(PathBuf::from("/etc/wireguard")),
            socket_path: None,
            dbus: true,
            carrier_id: None,
            stop_grace_secs: 5,
            status_buffer: 16,
            monitor_retry: RetryPolicy::default(),
        }
    }
}

impl DaemonConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.tool_path.as_os_str().is_empty() {
            return Err("Tool path cannot be empty".to_string());
        }

        if self.interface_name.is_empty() {
            return Err("Interface name cannot be empty".to_string());
        }

        if self.interface_name.len() > MAX_INTERFACE_NAME_LEN {
            return Err(format!(
                "Interface name cannot be longer than {} characters",
                MAX_INTERFACE_NAME_LEN
            ));
        }

        if !self
            .interface_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err("Interface name contains invalid characters".to_string());
        }

        if self.run_as.is_empty() {
            return Err("run_as user cannot be empty".to_string());
        }

        if self.status_buffer == 0 {
            return Err("status_buffer cannot be zero".to_string());
        }

        if let Some(ref carrier) = self.carrier_id {
            if carrier.is_empty() {
                return Err("carrier_id cannot be empty when set".to_string());
            }
        }

        self.monitor_retry
            .validate()
            .map_err(|e| format!("Invalid monitor_retry policy: {}", e))?;

        Ok(())
    }

    /// Path of the generated configuration file, if one is written
    pub fn config_output_path(&self) -> Option<PathBuf> {
        self.config_output_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.conf", self.interface_name)))
    }
}
