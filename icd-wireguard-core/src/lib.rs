//! Core library for the icd-wireguard tunnel daemon
//!
//! This crate provides the tunnel state machine and its collaborators:
//! process supervision, kernel link monitoring, configuration and the
//! remote-control front end.

pub mod error;
pub mod types;

pub mod config;
pub mod tunnel;

use tracing_subscriber::filter::LevelFilter;

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging when running as a service.
/// Otherwise logs to stderr with pretty formatting.
pub fn init_logging(level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            // We're running under systemd, use journal logging
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(level)
                .try_init()?;
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
        .with(level)
        .try_init()?;

    Ok(())
}
