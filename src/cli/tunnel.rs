//! Tunnel control commands
//!
//! Each command talks to a running daemon over its control socket.

use std::path::PathBuf;

use chrono::Local;
use colored::{ColoredString, Colorize};
use icd_wireguard_core::error::ControlError;
use icd_wireguard_core::tunnel::{
    ControlRequest, ControlResponse, StartResult, StatusReport, StopResult, TunnelStatus,
};
use tracing::debug;

use crate::daemon::ipc::IpcClient;

/// How a command that reached the daemon ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// The daemon answered but declined the request
    Refused,
}

fn unexpected(response: ControlResponse) -> ControlError {
    ControlError::Ipc {
        reason: format!("Unexpected response from daemon: {:?}", response),
    }
}

fn colored_state(state: TunnelStatus) -> ColoredString {
    match state {
        TunnelStatus::Connected => state.as_str().green().bold(),
        TunnelStatus::Started => state.as_str().yellow(),
        TunnelStatus::Stopped => state.as_str().normal(),
    }
}

fn print_report(report: &StatusReport) {
    println!("State: {}", colored_state(report.state));
    println!("Mode:  {}", report.mode);
    if report.control_channel_failed {
        println!("{}", "Bus service unavailable".red());
    }
    if report.monitor_failed {
        println!("{}", "Interface monitoring unavailable".red());
    }
}

/// Run the start command
pub fn run_start(socket_path: PathBuf, config_name: &str) -> Result<Outcome, ControlError> {
    let client = IpcClient::new(socket_path);
    let response = client.send_request(&ControlRequest::Start {
        config_name: config_name.to_string(),
    })?;

    match response {
        ControlResponse::Start { result, .. } => {
            debug!("Start({}) returned {}", config_name, result);
            if result.is_ok() {
                println!("{} Tunnel started with {}", "✓".green(), config_name);
                return Ok(Outcome::Done);
            }
            let hint = match result {
                StartResult::AlreadyRunning => "a tunnel is already running",
                StartResult::Refused => "the tunnel is being stopped",
                StartResult::InvalidConfig => "no such configuration",
                StartResult::InvalidArgs => "malformed configuration name",
                _ => "see the daemon log",
            };
            eprintln!("{} Start failed: {} ({})", "✗".red(), result, hint);
            Ok(Outcome::Refused)
        }
        other => Err(unexpected(other)),
    }
}

/// Run the stop command
pub fn run_stop(socket_path: PathBuf) -> Result<Outcome, ControlError> {
    let client = IpcClient::new(socket_path);

    match client.send_request(&ControlRequest::Stop)? {
        ControlResponse::Stop { result, .. } => match result {
            StopResult::Ok => {
                println!("{} Tunnel stopped", "✓".green());
                Ok(Outcome::Done)
            }
            StopResult::NotRunning => {
                println!("Tunnel is not running");
                Ok(Outcome::Done)
            }
            StopResult::Refused => {
                eprintln!(
                    "{} Stop refused: the tunnel belongs to a provider connection",
                    "✗".red()
                );
                Ok(Outcome::Refused)
            }
        },
        other => Err(unexpected(other)),
    }
}

/// Run the status command
pub fn run_status(socket_path: PathBuf) -> Result<Outcome, ControlError> {
    let client = IpcClient::new(socket_path);

    match client.send_request(&ControlRequest::GetStatus)? {
        ControlResponse::Status(report) => {
            print_report(&report);
            Ok(Outcome::Done)
        }
        other => Err(unexpected(other)),
    }
}

/// Run the watch command until the daemon goes away
pub fn run_watch(socket_path: PathBuf) -> Result<Outcome, ControlError> {
    let client = IpcClient::new(socket_path);
    println!("Watching tunnel status, press Ctrl+C to stop");

    client.subscribe(|report| {
        println!(
            "[{}] {} ({})",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            colored_state(report.state),
            report.mode
        );
    })?;

    println!("Daemon closed the status stream");
    Ok(Outcome::Done)
}
