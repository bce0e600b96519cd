//! Daemon wiring
//!
//! Builds the state machine and its collaborators from the configuration
//! file, registers the control transports and runs until SIGTERM/SIGINT.

pub mod dbus;
pub mod ipc;
pub mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use icd_wireguard_core::config::toml_config::{self, TomlConfig};
use icd_wireguard_core::config::TomlConfigProvider;
use icd_wireguard_core::tunnel::{
    ConnectionKey, ControlApi, Event, HostToken, InfraComponent, InterfaceMonitor, LoggingHost,
    StateMachine, StatusNotifier, SystemProcessRunner, TunnelSettings,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use self::ipc::IpcServer;
use self::process::DaemonProcess;

/// Network type of the standing carrier registered from `carrier_id`
const CARRIER_NETWORK_TYPE: &str = "STANDALONE";

/// Extra time on top of the stop grace period allowed for shutdown
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Options of the `daemon` subcommand
pub struct DaemonOptions {
    pub config_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub detach: bool,
    pub pid_file: Option<PathBuf>,
}

/// Run the daemon to completion
///
/// Detaching happens before the async runtime exists.
pub fn start(options: DaemonOptions) -> anyhow::Result<()> {
    let config_path = options
        .config_path
        .unwrap_or_else(toml_config::get_config_path);
    let config = toml_config::load_or_default(&config_path)?;
    let socket_path = options
        .socket_path
        .or_else(|| config.daemon.socket_path.clone())
        .unwrap_or_else(toml_config::get_default_socket_path);

    let mut guard = None;
    if options.detach {
        let mut daemon = DaemonProcess::new(
            options
                .pid_file
                .unwrap_or_else(process::get_default_pid_file),
        );
        if daemon.is_running()? {
            bail!("icd-wireguard daemon is already running");
        }
        daemon.daemonize()?;
        guard = Some(daemon);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;
    let result = runtime.block_on(run(config, config_path, socket_path));

    drop(guard);
    result
}

fn resolve_tool(tool_path: &Path) -> anyhow::Result<PathBuf> {
    if tool_path.is_absolute() {
        return Ok(tool_path.to_path_buf());
    }
    which::which(tool_path)
        .with_context(|| format!("Tunnel tool {} not found in PATH", tool_path.display()))
}

async fn run(config: TomlConfig, config_path: PathBuf, socket_path: PathBuf) -> anyhow::Result<()> {
    let daemon_config = config.daemon.clone();
    let tool_path = resolve_tool(&daemon_config.tool_path)?;
    info!(
        "Starting icd-wireguard for {} with {:?}",
        daemon_config.interface_name, tool_path
    );

    let provider = Arc::new(TomlConfigProvider::new(config_path, config));
    let grace = Duration::from_secs(daemon_config.stop_grace_secs);
    let machine = StateMachine::new(
        TunnelSettings::from_config(&daemon_config, tool_path),
        provider.clone(),
        Arc::new(SystemProcessRunner::new(grace)),
        Arc::new(LoggingHost),
        StatusNotifier::new(daemon_config.status_buffer),
    );
    let events = machine.events();
    let status = machine.status_feed();
    let api = ControlApi::new(events.clone(), machine.snapshots(), provider.clone());

    // Without the local control socket there is no way to drive the daemon
    let server = IpcServer::bind(&socket_path, api.clone(), status.clone())
        .context("Failed to create the control socket")?;

    let mut machine_task = tokio::spawn(machine.run());
    let server_task = tokio::spawn(server.run());

    let _bus = if daemon_config.dbus {
        match dbus::serve(api, status).await {
            Ok(connection) => Some(connection),
            Err(e) => {
                error!("Bus service unavailable: {}", e);
                let _ = events.send(Event::InfrastructureFailed {
                    component: InfraComponent::ControlChannel,
                });
                None
            }
        }
    } else {
        info!("Bus service disabled by configuration");
        None
    };

    let monitor_task = InterfaceMonitor::new(
        daemon_config.interface_name.clone(),
        daemon_config.monitor_retry.clone(),
        events.clone(),
    )
    .spawn();

    if let Some(network_id) = daemon_config.carrier_id.as_deref() {
        info!("Registering standing carrier {}", network_id);
        let _ = events.send(Event::IpUp {
            key: ConnectionKey::new(CARRIER_NETWORK_TYPE, 0, network_id),
            token: HostToken(1),
        });
    }

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match provider.reload() {
                    Ok(()) => {
                        let _ = events.send(Event::ConfigChanged);
                    }
                    Err(e) => warn!("Keeping previous configuration: {}", e),
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
            result = &mut machine_task => {
                server_task.abort();
                monitor_task.abort();
                let _ = std::fs::remove_file(&socket_path);
                if let Err(e) = result {
                    bail!("State machine task failed: {}", e);
                }
                bail!("State machine stopped unexpectedly");
            }
        }
    }

    let (done, done_rx) = oneshot::channel();
    if events.send(Event::Shutdown { done }).is_ok() {
        match tokio::time::timeout(grace + SHUTDOWN_SLACK, done_rx).await {
            Ok(_) => info!("Tunnel shut down"),
            Err(_) => warn!("Tunnel did not shut down within {:?}", grace + SHUTDOWN_SLACK),
        }
    }

    monitor_task.abort();
    server_task.abort();
    // Aborting drops the server, which normally removes the file already
    let _ = server_task.await;
    let _ = std::fs::remove_file(&socket_path);

    info!("icd-wireguard stopped");
    Ok(())
}
