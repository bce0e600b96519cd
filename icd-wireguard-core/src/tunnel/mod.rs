//! Tunnel lifecycle management
//!
//! The [`machine::StateMachine`] reconciles control requests, kernel link
//! notifications and process exits into one connection state. The other
//! modules are the event sources and collaborators around it.

pub mod control;
pub mod event;
pub mod host;
pub mod interface_monitor;
pub mod machine;
pub mod notifier;
pub mod process;
pub mod retry;
pub mod state;

pub use control::{ControlApi, ControlRequest, ControlResponse};
pub use event::{Event, InfraComponent, StartResult, StopResult};
pub use host::{ConnectionKey, HostAdapter, HostToken, LoggingHost};
pub use interface_monitor::InterfaceMonitor;
pub use machine::{StateMachine, TunnelSettings, CONTROL_NETWORK_TYPE};
pub use notifier::{StatusFeed, StatusNotifier};
pub use process::{ExitStatus, ProcessHandle, ProcessRunner, ProcessToken, SystemProcessRunner};
pub use retry::RetryPolicy;
pub use state::{ConnectionState, Phase, StatusReport, TunnelMode, TunnelStatus};
