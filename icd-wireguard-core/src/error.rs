//! Error types for the icd-wireguard daemon
//!
//! This module defines all error types used throughout the daemon. Component
//! errors are converted to result codes at the control boundary; see
//! [`crate::tunnel::event::StartResult`] and [`crate::tunnel::event::StopResult`].

use thiserror::Error;

/// Main error type for the icd-wireguard daemon
#[derive(Error, Debug)]
pub enum WireguardError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors raised while launching the tunnel tool
    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    /// Errors raised by the kernel interface monitor
    #[error("Interface monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Errors raised by the remote-control surfaces
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Configuration-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Unknown tunnel configuration: {name}")]
    UnknownConfig { name: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Errors from launching a process as another user
///
/// All variants are terminal for the attempt that produced them; nothing
/// retries a failed spawn automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("User not found: {user}")]
    UserNotFound { user: String },

    #[error("Failed to fork: {reason}")]
    ForkFailed { reason: String },

    #[error("Failed to execute {program}: {reason}")]
    ExecFailed { program: String, reason: String },

    #[error("Failed to write tunnel configuration to {path}: {reason}")]
    ConfigWriteFailed { path: String, reason: String },
}

/// Kernel link-notification errors
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to create netlink socket: {0}")]
    SocketFailed(#[source] std::io::Error),

    #[error("Failed to bind netlink socket: {0}")]
    BindFailed(#[source] std::io::Error),

    #[error("Failed to read from netlink socket: {0}")]
    ReadFailed(#[source] std::io::Error),

    #[error("Malformed netlink message: {0}")]
    Malformed(String),

    #[error("Kernel reported netlink error {code}")]
    KernelError { code: i32 },
}

/// Remote-control surface errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("State machine is no longer accepting events")]
    ChannelClosed,

    #[error("IPC error: {reason}")]
    Ipc { reason: String },

    #[error("D-Bus error: {reason}")]
    Bus { reason: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, WireguardError>;
