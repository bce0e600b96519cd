//! Configuration provider contract and its TOML-file implementation

use crate::config::store::{IapEntry, TunnelStore, WIREGUARD_PROVIDER_TYPE};
use crate::config::toml_config::TomlConfig;
use crate::error::{ConfigError, WireguardError};
use crate::types::GeneratedConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

/// What the store knows about a carrier connection id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderInfo {
    /// The carrier is configured to be provided by the tunnel itself
    pub is_wireguard: bool,

    /// Tunnel configuration named by the carrier, if any
    pub service_id: Option<String>,
}

/// Read access to tunnel configuration
///
/// Implementations must be cheap to call from the state machine task; they
/// are consulted on every start request and configuration change.
pub trait ConfigProvider: Send + Sync {
    /// Whether `name` is a known tunnel configuration
    fn is_known_config(&self, name: &str) -> bool;

    /// Look up whether a carrier connection is a tunnel provider
    fn resolve_provider(&self, connection_id: &str) -> ProviderInfo;

    /// Whether system-wide tunnel mode is requested
    fn is_system_wide_enabled(&self) -> bool;

    /// The configuration selected for system-wide mode
    fn active_config_name(&self) -> Option<String>;

    /// Render a named configuration
    fn generate_config(&self, name: &str) -> Result<GeneratedConfig, ConfigError>;
}

struct Snapshot {
    store: TunnelStore,
    iap: BTreeMap<String, IapEntry>,
}

/// ConfigProvider backed by the daemon's TOML file
///
/// The file is read once at construction and again on every [`reload`].
/// A reload that fails keeps the previously loaded values.
///
/// [`reload`]: TomlConfigProvider::reload
pub struct TomlConfigProvider {
    path: PathBuf,
    current: RwLock<Snapshot>,
}

impl TomlConfigProvider {
    /// Create a provider from an already loaded configuration
    pub fn new(path: PathBuf, config: TomlConfig) -> Self {
        Self {
            path,
            current: RwLock::new(Snapshot {
                store: config.wireguard,
                iap: config.iap,
            }),
        }
    }

    /// Load the provider from a TOML file
    pub fn load(path: &Path) -> Result<Self, WireguardError> {
        let config = TomlConfig::from_file(path)?;
        Ok(Self::new(path.to_path_buf(), config))
    }

    /// Re-read the file, keeping the old values on failure
    pub fn reload(&self) -> Result<(), WireguardError> {
        let config = TomlConfig::from_file(&self.path).map_err(|e| {
            warn!("Keeping previous configuration, reload failed: {}", e);
            e
        })?;

        let mut current = self.current.write().map_err(|_| ConfigError::IoError {
            message: "configuration lock poisoned".to_string(),
        })?;
        *current = Snapshot {
            store: config.wireguard,
            iap: config.iap,
        };
        info!(
            "Reloaded tunnel configuration from {:?} ({} known configurations)",
            self.path,
            current.store.configs.len()
        );
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        // Writers replace the whole snapshot, so a poisoned value is still complete
        match self.current.read() {
            Ok(guard) => f(&*guard),
            Err(poisoned) => f(&*poisoned.into_inner()),
        }
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn is_known_config(&self, name: &str) -> bool {
        self.read(|s| s.store.is_known(name))
    }

    fn resolve_provider(&self, connection_id: &str) -> ProviderInfo {
        self.read(|s| {
            let Some(entry) = s.iap.get(connection_id) else {
                return ProviderInfo::default();
            };
            let service_id = entry.service_id.clone();
            let known = service_id
                .as_deref()
                .map(|id| s.store.is_known(id))
                .unwrap_or(false);
            ProviderInfo {
                is_wireguard: known
                    && entry.service_type.as_deref() == Some(WIREGUARD_PROVIDER_TYPE),
                service_id,
            }
        })
    }

    fn is_system_wide_enabled(&self) -> bool {
        self.read(|s| s.store.system_wide_enabled)
    }

    fn active_config_name(&self) -> Option<String> {
        self.read(|s| s.store.active_config.clone())
    }

    fn generate_config(&self, name: &str) -> Result<GeneratedConfig, ConfigError> {
        self.read(|s| s.store.generate(name))
    }
}
