//! Events consumed by the state machine and the results it replies with

use crate::error::SpawnError;
use crate::tunnel::host::{ConnectionKey, HostToken};
use crate::tunnel::process::{ExitStatus, ProcessHandle, ProcessToken};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

/// Result of a Start request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartResult {
    Ok,
    Failed,
    InvalidConfig,
    InvalidArgs,
    AlreadyRunning,
    /// A teardown is in progress
    Refused,
}

impl StartResult {
    /// Wire code used by the bus interface
    pub fn code(self) -> u32 {
        match self {
            StartResult::Ok => 0,
            StartResult::Failed => 1,
            StartResult::InvalidConfig => 2,
            StartResult::InvalidArgs => 3,
            StartResult::AlreadyRunning => 4,
            StartResult::Refused => 5,
        }
    }

    pub fn is_ok(self) -> bool {
        self == StartResult::Ok
    }
}

impl fmt::Display for StartResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StartResult::Ok => "tunnel started",
            StartResult::Failed => "tunnel failed to start",
            StartResult::InvalidConfig => "invalid configuration",
            StartResult::InvalidArgs => "invalid arguments",
            StartResult::AlreadyRunning => "tunnel already running",
            StartResult::Refused => "refused, tunnel is stopping",
        };
        f.write_str(text)
    }
}

/// Result of a Stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopResult {
    Ok,
    NotRunning,
    /// The tunnel is owned by a provider connection
    Refused,
}

impl StopResult {
    /// Wire code used by the bus interface
    pub fn code(self) -> u32 {
        match self {
            StopResult::Ok => 0,
            StopResult::NotRunning => 1,
            StopResult::Refused => 2,
        }
    }

    pub fn is_ok(self) -> bool {
        self == StopResult::Ok
    }
}

impl fmt::Display for StopResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopResult::Ok => "tunnel stopping",
            StopResult::NotRunning => "tunnel not running",
            StopResult::Refused => "refused, tunnel is owned by a provider connection",
        };
        f.write_str(text)
    }
}

/// Infrastructure that can fail permanently at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfraComponent {
    ControlChannel,
    InterfaceMonitor,
}

impl fmt::Display for InfraComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfraComponent::ControlChannel => write!(f, "control channel"),
            InfraComponent::InterfaceMonitor => write!(f, "interface monitor"),
        }
    }
}

/// Everything the state machine reacts to
///
/// Replies are one-shot channels; the state machine resolves each exactly
/// once.
#[derive(Debug)]
pub enum Event {
    /// The host brings up a connection
    IpUp { key: ConnectionKey, token: HostToken },

    /// The host takes a connection down
    IpDown { key: ConnectionKey },

    /// The host asks for a connection's tunnel to be closed
    HostClose { key: ConnectionKey },

    /// Configuration was changed and must be re-read
    ConfigChanged,

    /// The tunnel interface is up
    InterfaceUp { index: u32 },

    /// An interface went down or disappeared
    InterfaceDown { index: u32 },

    /// A watched bringup process exited
    ProcessExited {
        token: ProcessToken,
        status: ExitStatus,
    },

    /// A bringup spawn finished, successfully or not
    SpawnCompleted {
        attempt: u64,
        result: Result<ProcessHandle, SpawnError>,
    },

    ControlStart {
        config_name: String,
        reply: oneshot::Sender<StartResult>,
    },

    ControlStop {
        reply: oneshot::Sender<StopResult>,
    },

    /// Part of the daemon's infrastructure failed permanently
    InfrastructureFailed { component: InfraComponent },

    /// Stop the tunnel and end the event loop once it is gone
    Shutdown { done: oneshot::Sender<()> },
}
