//! Tunnel configuration store
//!
//! Named tunnel configurations, carrier (IAP) provider entries and the
//! system-wide switch, plus rendering of a named configuration into the
//! wg-quick file format.

use crate::error::ConfigError;
use crate::types::{GeneratedConfig, KeyMaterial};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::warn;

/// Service type an IAP must carry to be treated as a tunnel provider
pub const WIREGUARD_PROVIDER_TYPE: &str = "WIREGUARD";

/// The `[wireguard]` table
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TunnelStore {
    /// Tunnel every carrier connection through the active configuration
    pub system_wide_enabled: bool,

    /// Configuration used for system-wide mode
    pub active_config: Option<String>,

    /// Known configurations by name
    pub configs: BTreeMap<String, TunnelConfig>,
}

/// One named tunnel configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub private_key: Option<KeyMaterial>,
    pub address: Option<String>,
    pub dns: Option<String>,

    /// Use this file verbatim instead of rendering the fields above
    pub config_file_override: Option<PathBuf>,

    pub peers: Vec<PeerConfig>,
}

/// A peer of a tunnel configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub public_key: Option<String>,
    pub endpoint: Option<String>,
    pub allowed_ips: Option<String>,
    pub preshared_key: Option<KeyMaterial>,
}

/// A carrier connection entry from the `[iap.<id>]` tables
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IapEntry {
    pub service_type: Option<String>,
    pub service_id: Option<String>,
}

impl TunnelStore {
    /// Whether a configuration with this name exists
    pub fn is_known(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    /// Render a named configuration
    ///
    /// Fails with `MissingField` when the private key, address or DNS entry
    /// is absent. Peers missing any of their fields are skipped.
    pub fn generate(&self, name: &str) -> Result<GeneratedConfig, ConfigError> {
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownConfig {
                name: name.to_string(),
            })?;

        if let Some(ref path) = config.config_file_override {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
                message: format!("Failed to read {}: {}", path.display(), e),
            })?;
            return Ok(GeneratedConfig::new(contents));
        }

        config.render(name).map(GeneratedConfig::new)
    }
}

impl TunnelConfig {
    fn render(&self, name: &str) -> Result<String, ConfigError> {
        let private_key = self
            .private_key
            .as_ref()
            .filter(|key| !key.is_blank())
            .ok_or_else(|| missing("PrivateKey"))?;
        let address = required(&self.address, "Address")?;
        let dns = required(&self.dns, "DNS")?;

        let mut out = String::new();
        // Writing into a String cannot fail
        let _ = write!(
            out,
            "[Interface]\nPrivateKey = {}\nAddress = {}\nDNS = {}\n",
            private_key.expose(),
            address,
            dns
        );

        for (position, peer) in self.peers.iter().enumerate() {
            let (Some(public_key), Some(endpoint), Some(allowed_ips)) = (
                non_empty(&peer.public_key),
                non_empty(&peer.endpoint),
                non_empty(&peer.allowed_ips),
            ) else {
                warn!(
                    "Skipping peer {} of configuration {}: incomplete peer entry",
                    position, name
                );
                continue;
            };

            let _ = write!(
                out,
                "\n[Peer]\nPublicKey = {}\nEndPoint = {}\nAllowedIPs = {}\n",
                public_key, endpoint, allowed_ips
            );
            if let Some(psk) = peer.preshared_key.as_ref().filter(|k| !k.is_blank()) {
                let _ = writeln!(out, "PresharedKey = {}", psk.expose());
            }
        }

        Ok(out)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, ConfigError> {
    non_empty(value).ok_or_else(|| missing(field))
}

fn missing(field: &str) -> ConfigError {
    ConfigError::MissingField {
        field: field.to_string(),
    }
}
