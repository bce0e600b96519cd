//! TOML configuration file I/O
//!
//! Handles loading the daemon configuration from its TOML file and the
//! default locations of the files the daemon owns.

use crate::config::store::{IapEntry, TunnelStore};
use crate::config::DaemonConfig;
use crate::error::{ConfigError, WireguardError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Complete TOML configuration structure
///
/// Contains the daemon settings, the tunnel store and the carrier entries
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Daemon settings
    pub daemon: DaemonConfig,

    /// Tunnel configurations and the system-wide switch
    pub wireguard: TunnelStore,

    /// Carrier connections by network id
    pub iap: BTreeMap<String, IapEntry>,
}

impl TomlConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, WireguardError> {
        use tracing::{debug, warn};

        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            },
            _ => ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            },
        })?;

        let config: TomlConfig = toml::from_str(&contents).map_err(|e| ConfigError::ValidationError {
            message: format!("Failed to parse config file: {}", e),
        })?;

        config.daemon.validate().map_err(|message| {
            warn!("Daemon configuration validation failed: {}", message);
            ConfigError::ValidationError { message }
        })?;

        if let Some(ref active) = config.wireguard.active_config {
            if !config.wireguard.is_known(active) {
                warn!("Active configuration {} is not a known configuration", active);
            }
        }

        debug!(
            "Loaded configuration from {:?}: {} tunnel configurations, {} carriers",
            path,
            config.wireguard.configs.len(),
            config.iap.len()
        );

        Ok(config)
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default control socket file name
const SOCKET_FILE_NAME: &str = "icd-wireguard.sock";

/// Get the default configuration directory
///
/// Returns /etc/icd-wireguard, or ICD_WIREGUARD_CONFIG_DIR if set
pub fn get_config_dir() -> PathBuf {
    if let Ok(config_dir) = std::env::var("ICD_WIREGUARD_CONFIG_DIR") {
        return PathBuf::from(config_dir);
    }
    PathBuf::from("/etc/icd-wireguard")
}

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    get_config_dir().join(CONFIG_FILE_NAME)
}

/// Get the default control socket path
///
/// The daemon normally runs as root and uses /run; unprivileged runs use
/// XDG_RUNTIME_DIR when available, otherwise /tmp.
pub fn get_default_socket_path() -> PathBuf {
    if nix::unistd::getuid().is_root() {
        return Path::new("/run").join(SOCKET_FILE_NAME);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        Path::new(&runtime_dir).join(SOCKET_FILE_NAME)
    } else {
        Path::new("/tmp").join(format!("icd-wireguard-{}.sock", nix::unistd::getuid()))
    }
}

/// Load the daemon configuration, falling back to defaults when the file is absent
pub fn load_or_default(path: &Path) -> Result<TomlConfig, WireguardError> {
    match TomlConfig::from_file(path) {
        Err(WireguardError::Config(ConfigError::LoadFailed { .. })) => {
            tracing::warn!("No configuration file at {:?}, using defaults", path);
            Ok(TomlConfig::default())
        }
        other => other,
    }
}
