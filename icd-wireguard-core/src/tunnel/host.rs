//! Connectivity-manager host contract
//!
//! The host tracks carrier connections by [`ConnectionKey`] and hands the
//! daemon an opaque [`HostToken`] for each one. The state machine reports
//! IP-level lifecycle back through a [`HostAdapter`].

use crate::tunnel::process::ExitStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Identity under which the host tracks one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub network_type: String,
    pub network_attrs: u32,
    pub network_id: String,
}

impl ConnectionKey {
    pub fn new(network_type: impl Into<String>, network_attrs: u32, network_id: impl Into<String>) -> Self {
        Self {
            network_type: network_type.into(),
            network_attrs,
            network_id: network_id.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:#x}/{}",
            self.network_type, self.network_attrs, self.network_id
        )
    }
}

/// Opaque callback token supplied by the host with each connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostToken(pub u64);

/// Calls the state machine makes on the connectivity manager
pub trait HostAdapter: Send + Sync {
    /// Register interest in a process the daemon spawned
    fn watch_process(&self, pid: u32);

    /// A watched process has exited
    fn child_exited(&self, pid: u32, status: ExitStatus);

    /// IP connectivity is available for the connection
    fn ip_up(&self, key: &ConnectionKey, token: &HostToken);

    /// IP connectivity is gone for the connection
    fn ip_down(&self, key: &ConnectionKey, token: &HostToken);

    /// Ask the host to close a connection the daemon cannot serve
    fn request_close(&self, key: &ConnectionKey, reason: &str);
}

/// Host adapter for running standalone: every callback is logged
#[derive(Debug, Default, Clone)]
pub struct LoggingHost;

impl HostAdapter for LoggingHost {
    fn watch_process(&self, pid: u32) {
        info!("Host: watching process {}", pid);
    }

    fn child_exited(&self, pid: u32, status: ExitStatus) {
        info!("Host: process {} exited with {}", pid, status);
    }

    fn ip_up(&self, key: &ConnectionKey, token: &HostToken) {
        info!("Host: IP up for {} (token {})", key, token.0);
    }

    fn ip_down(&self, key: &ConnectionKey, token: &HostToken) {
        info!("Host: IP down for {} (token {})", key, token.0);
    }

    fn request_close(&self, key: &ConnectionKey, reason: &str) {
        info!("Host: close requested for {}: {}", key, reason);
    }
}
