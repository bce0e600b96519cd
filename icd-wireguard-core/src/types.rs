//! Type definitions and wrappers for secure data handling
//!
//! This module provides type-safe wrappers for key material using the
//! secrecy crate to prevent accidental exposure in logs or debug output.

use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

/// Wrapper for WireGuard private and preshared keys read from configuration
///
/// Keys are never printed by `Debug`, so a whole tunnel configuration can be
/// logged without leaking them.
#[derive(Clone, Debug, Deserialize)]
#[serde(transparent)]
pub struct KeyMaterial(Secret<String>);

impl KeyMaterial {
    /// Create new key material from its Base64 text form
    pub fn new(key: String) -> Self {
        Self(Secret::new(key))
    }

    /// Expose the key value (use with caution!)
    ///
    /// Only the config generator should need this.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Whether the key is present but blank
    pub fn is_blank(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl From<String> for KeyMaterial {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// A rendered wg-quick configuration file
///
/// The blob embeds the private key, so it is handled as a secret from the
/// moment it is generated until it is written to disk.
#[derive(Clone, Debug)]
pub struct GeneratedConfig(Secret<String>);

impl GeneratedConfig {
    /// Wrap rendered configuration text
    pub fn new(contents: String) -> Self {
        Self(Secret::new(contents))
    }

    /// Expose the configuration text (use with caution!)
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}
