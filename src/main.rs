//! icd-wireguard - WireGuard tunnel daemon for the ICD connectivity manager
//!
//! Runs the tunnel daemon and provides commands to control it over its
//! local socket.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use icd_wireguard_core::{config::toml_config, error::WireguardError, init_logging};
use tracing::level_filters::LevelFilter;

mod cli;
mod daemon;

use cli::tunnel::Outcome;

#[derive(Parser)]
#[command(name = "icd-wireguard", version)]
#[command(about = "WireGuard tunnel lifecycle daemon and control client")]
struct Cli {
    /// Control socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel daemon
    Daemon {
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Detach from the terminal
        #[arg(long)]
        detach: bool,
        /// PID file written when detached
        #[arg(long, requires = "detach")]
        pid_file: Option<PathBuf>,
    },
    /// Start the tunnel with a named configuration
    Start {
        /// Configuration name
        config: String,
    },
    /// Stop the tunnel
    Stop,
    /// Show tunnel status
    Status,
    /// Follow tunnel status changes
    Watch,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    if let Err(e) = init_logging(level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let client_socket = || {
        cli.socket
            .clone()
            .unwrap_or_else(toml_config::get_default_socket_path)
    };

    let result = match cli.command {
        Commands::Daemon {
            config,
            detach,
            pid_file,
        } => {
            let options = daemon::DaemonOptions {
                config_path: config,
                socket_path: cli.socket.clone(),
                detach,
                pid_file,
            };
            match daemon::start(options) {
                Ok(()) => std::process::exit(0),
                Err(e) => {
                    let exit_code = match e.downcast_ref::<WireguardError>() {
                        Some(WireguardError::Config(_)) | Some(WireguardError::Toml(_)) => 2,
                        _ => 1,
                    };
                    eprintln!("{:#}", e);
                    std::process::exit(exit_code);
                }
            }
        }
        Commands::Start { ref config } => cli::tunnel::run_start(client_socket(), config),
        Commands::Stop => cli::tunnel::run_stop(client_socket()),
        Commands::Status => cli::tunnel::run_status(client_socket()),
        Commands::Watch => cli::tunnel::run_watch(client_socket()),
    };

    match result {
        Ok(Outcome::Done) => std::process::exit(0),
        Ok(Outcome::Refused) => std::process::exit(3),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
