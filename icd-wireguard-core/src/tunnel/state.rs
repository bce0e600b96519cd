//! Connection state snapshots
//!
//! [`ConnectionState`] is an immutable value; the state machine builds a new
//! one for every transition and publishes it. Everything else only reads
//! copies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of every connection-state field at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// Tunnel-everything mode requested by configuration
    pub system_wide_enabled: bool,

    /// Configuration of the running tunnel, or the selected one when idle
    pub active_config_name: Option<String>,

    /// At least one host connection is tracked
    pub iap_connected: bool,

    /// The tunnel acts as the carrier connection itself
    pub service_provider_mode: bool,

    /// The bringup process is believed alive (or its spawn is in flight)
    pub tunnel_process_running: bool,

    /// The tunnel is fully established
    pub tunnel_up: bool,

    /// Last kernel-reported state of the tunnel interface
    pub interface_up: bool,

    /// Index of the tunnel interface; `None` when unknown or absent
    pub interface_index: Option<u32>,

    /// A start or stop is in flight
    pub config_transition_ongoing: bool,

    /// A stop has been requested and the process is being torn down
    pub stopping: bool,

    /// The remote-control bus could not be registered
    pub control_channel_failed: bool,

    /// Kernel link notifications are unavailable
    pub monitor_failed: bool,
}

/// Lifecycle phase derived from a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Established,
    Stopping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Starting => write!(f, "starting"),
            Phase::Established => write!(f, "established"),
            Phase::Stopping => write!(f, "stopping"),
        }
    }
}

/// Externally visible state label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelStatus {
    Connected,
    Started,
    Stopped,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Connected => "Connected",
            TunnelStatus::Started => "Started",
            TunnelStatus::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible mode label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelMode {
    Normal,
    Provider,
}

impl TunnelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelMode::Normal => "Normal",
            TunnelMode::Provider => "Provider",
        }
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What GetStatus and StatusChanged carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: TunnelStatus,
    pub mode: TunnelMode,
    #[serde(default)]
    pub control_channel_failed: bool,
    #[serde(default)]
    pub monitor_failed: bool,
}

impl ConnectionState {
    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        if self.tunnel_up {
            Phase::Established
        } else if self.stopping {
            Phase::Stopping
        } else if self.tunnel_process_running {
            Phase::Starting
        } else {
            Phase::Idle
        }
    }

    pub fn status(&self) -> TunnelStatus {
        if self.tunnel_up {
            TunnelStatus::Connected
        } else if self.tunnel_process_running {
            TunnelStatus::Started
        } else {
            TunnelStatus::Stopped
        }
    }

    pub fn mode(&self) -> TunnelMode {
        if self.service_provider_mode {
            TunnelMode::Provider
        } else {
            TunnelMode::Normal
        }
    }

    /// The externally visible projection of this snapshot
    pub fn report(&self) -> StatusReport {
        StatusReport {
            state: self.status(),
            mode: self.mode(),
            control_channel_failed: self.control_channel_failed,
            monitor_failed: self.monitor_failed,
        }
    }

    /// Whether `tunnel_up` implies both `interface_up` and a running process
    pub fn is_consistent(&self) -> bool {
        !self.tunnel_up || (self.interface_up && self.tunnel_process_running)
    }

    /// Copy of this snapshot with the consistency rules enforced
    ///
    /// An established tunnel without an interface or a process is not
    /// established. The interface index is dropped once the interface is
    /// down.
    pub fn normalized(self) -> Self {
        let tunnel_up = self.tunnel_up && self.interface_up && self.tunnel_process_running;
        let interface_index = if self.interface_up {
            self.interface_index
        } else {
            None
        };
        Self {
            tunnel_up,
            interface_index,
            ..self
        }
    }
}
