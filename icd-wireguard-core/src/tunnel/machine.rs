//! The tunnel state machine
//!
//! One task owns the tunnel process, the host connection handles and the
//! connection-state snapshot. Control requests, link notifications and
//! process exits all arrive as [`Event`]s on one queue and are handled
//! strictly one at a time. Each handled event produces one new snapshot,
//! which is published on a watch channel and, when its visible status
//! changed, broadcast through the [`StatusNotifier`].
//!
//! Every transition checks the current snapshot rather than assuming the
//! order in which independent sources reported, so racing link and process
//! events converge to the same terminal state.

use crate::config::{ConfigProvider, DaemonConfig};
use crate::error::SpawnError;
use crate::tunnel::event::{Event, InfraComponent, StartResult, StopResult};
use crate::tunnel::host::{ConnectionKey, HostAdapter, HostToken};
use crate::tunnel::notifier::{StatusFeed, StatusNotifier};
use crate::tunnel::process::{ExitStatus, ProcessHandle, ProcessRunner, ProcessToken};
use crate::tunnel::state::ConnectionState;
use crate::types::GeneratedConfig;
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Network type of the connection announced for a control-started tunnel
pub const CONTROL_NETWORK_TYPE: &str = "WIREGUARD_CONTROL";

/// How the tunnel tool is invoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSettings {
    pub tool_path: PathBuf,
    pub interface_name: String,
    pub run_as: String,
    /// Where the generated configuration is written before bringup
    pub config_output: Option<PathBuf>,
}

impl TunnelSettings {
    /// Settings from the daemon configuration, with the tool already resolved
    pub fn from_config(config: &DaemonConfig, tool_path: PathBuf) -> Self {
        Self {
            tool_path,
            interface_name: config.interface_name.clone(),
            run_as: config.run_as.clone(),
            config_output: config.config_output_path(),
        }
    }

    fn args(&self, verb: &str) -> Vec<String> {
        vec![verb.to_string(), self.interface_name.clone()]
    }
}

/// Who asked for the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Control,
    SystemWide,
    /// A carrier connection provided by the tunnel itself
    Provider(ConnectionKey),
}

/// The single tunnel slot
#[derive(Debug)]
struct Tunnel {
    attempt: u64,
    config_name: String,
    origin: Origin,
    /// Known once the spawn completed
    process: Option<ProcessHandle>,
    start_reply: Option<oneshot::Sender<StartResult>>,
    stop_requested: bool,
}

/// One host connection
#[derive(Debug)]
struct ConnectionHandle {
    token: HostToken,
    /// IP lifecycle follows the tunnel
    bound: bool,
    provider: bool,
    /// Stands for a control-started tunnel rather than a host carrier
    control: bool,
    ip_up_sent: bool,
    ip_down_sent: bool,
    /// The host asked for this connection to go down
    down_requested: bool,
}

impl ConnectionHandle {
    fn new(token: HostToken) -> Self {
        Self {
            token,
            bound: false,
            provider: false,
            control: false,
            ip_up_sent: false,
            ip_down_sent: false,
            down_requested: false,
        }
    }
}

/// Single authoritative owner of the connection state
pub struct StateMachine {
    settings: TunnelSettings,
    config: Arc<dyn ConfigProvider>,
    runner: Arc<dyn ProcessRunner>,
    host: Arc<dyn HostAdapter>,
    notifier: StatusNotifier,

    state: ConnectionState,
    snapshots: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,

    tunnel: Option<Tunnel>,
    connections: HashMap<ConnectionKey, ConnectionHandle>,
    /// Configuration selected by the provider, shown while idle
    selected_config: Option<String>,
    next_attempt: u64,
    config_change_pending: bool,
    shutdown: Option<oneshot::Sender<()>>,
    finished: bool,
}

impl StateMachine {
    pub fn new(
        settings: TunnelSettings,
        config: Arc<dyn ConfigProvider>,
        runner: Arc<dyn ProcessRunner>,
        host: Arc<dyn HostAdapter>,
        notifier: StatusNotifier,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let selected_config = config.active_config_name();
        let state = ConnectionState {
            system_wide_enabled: config.is_system_wide_enabled(),
            active_config_name: selected_config.clone(),
            ..Default::default()
        };
        let (snapshots, _) = watch::channel(state.clone());

        let mut notifier = notifier;
        notifier.publish(&state);

        Self {
            settings,
            config,
            runner,
            host,
            notifier,
            state,
            snapshots,
            events_tx,
            events_rx,
            tunnel: None,
            connections: HashMap::new(),
            selected_config,
            next_attempt: 0,
            config_change_pending: false,
            shutdown: None,
            finished: false,
        }
    }

    /// Sender for feeding events into this machine
    pub fn events(&self) -> mpsc::UnboundedSender<Event> {
        self.events_tx.clone()
    }

    /// Receiver of every published snapshot
    pub fn snapshots(&self) -> watch::Receiver<ConnectionState> {
        self.snapshots.subscribe()
    }

    pub fn status_feed(&self) -> StatusFeed {
        self.notifier.feed()
    }

    /// The current snapshot
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Whether a Shutdown has completed
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Process events until shut down
    pub async fn run(mut self) {
        info!(
            "Tunnel state machine running for {} ({})",
            self.settings.interface_name,
            self.settings.tool_path.display()
        );
        while !self.finished {
            if !self.step().await {
                break;
            }
        }
        info!("Tunnel state machine stopped");
    }

    /// Wait for and handle one event; false once no sender is left
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle(event);
                true
            }
            None => false,
        }
    }

    /// Handle one event and publish the resulting snapshot
    pub fn handle(&mut self, event: Event) {
        debug!("Event: {:?} (phase {})", event, self.state.phase());
        match event {
            Event::ControlStart { config_name, reply } => self.on_control_start(config_name, reply),
            Event::ControlStop { reply } => self.on_control_stop(reply),
            Event::SpawnCompleted { attempt, result } => self.on_spawn_completed(attempt, result),
            Event::ProcessExited { token, status } => self.on_process_exited(token, status),
            Event::InterfaceUp { index } => self.on_interface_up(index),
            Event::InterfaceDown { index } => self.on_interface_down(index),
            Event::IpUp { key, token } => self.on_ip_up(key, token),
            Event::IpDown { key } => self.on_ip_down(key),
            Event::HostClose { key } => self.on_host_close(key),
            Event::ConfigChanged => self.on_config_changed(),
            Event::InfrastructureFailed { component } => self.on_infrastructure_failed(component),
            Event::Shutdown { done } => self.on_shutdown(done),
        }
        self.settle();
        self.commit();
    }

    fn on_control_start(&mut self, config_name: String, reply: oneshot::Sender<StartResult>) {
        if let Some(ref tunnel) = self.tunnel {
            let result = if tunnel.stop_requested {
                StartResult::Refused
            } else {
                StartResult::AlreadyRunning
            };
            info!(
                "Start of {} rejected: tunnel with {} is {}",
                config_name,
                tunnel.config_name,
                self.state.phase()
            );
            let _ = reply.send(result);
            return;
        }

        let key = ConnectionKey::new(CONTROL_NETWORK_TYPE, 0, config_name.as_str());
        match self.begin_start(config_name, Origin::Control) {
            Ok(()) => {
                if let Some(tunnel) = self.tunnel.as_mut() {
                    tunnel.start_reply = Some(reply);
                    let mut handle = ConnectionHandle::new(HostToken(tunnel.attempt));
                    handle.bound = true;
                    handle.control = true;
                    self.connections.insert(key, handle);
                }
            }
            Err(result) => {
                let _ = reply.send(result);
            }
        }
    }

    fn on_control_stop(&mut self, reply: oneshot::Sender<StopResult>) {
        let result = match self.tunnel {
            None => StopResult::NotRunning,
            Some(Tunnel {
                origin: Origin::Provider(ref key),
                ..
            }) => {
                info!("Stop refused: tunnel is provided for {}", key);
                StopResult::Refused
            }
            Some(_) => {
                self.begin_stop("stop requested");
                StopResult::Ok
            }
        };
        let _ = reply.send(result);
    }

    fn on_spawn_completed(&mut self, attempt: u64, result: Result<ProcessHandle, SpawnError>) {
        let current = self.tunnel.as_ref().map(|t| t.attempt);
        if current != Some(attempt) {
            // No slot waits for this process any more
            if let Ok(handle) = result {
                warn!("Terminating orphaned tunnel process {}", handle.pid);
                self.watch_orphan(&handle);
                self.runner.terminate(&handle);
            }
            return;
        }

        match result {
            Ok(handle) => {
                self.watch_tunnel(&handle);
                let Some(tunnel) = self.tunnel.as_mut() else {
                    return;
                };
                info!(
                    "Tunnel process for {} running (pid {})",
                    tunnel.config_name, handle.pid
                );
                tunnel.process = Some(handle.clone());
                if let Some(reply) = tunnel.start_reply.take() {
                    let _ = reply.send(StartResult::Ok);
                }
                if tunnel.stop_requested {
                    info!("Start was cancelled, tearing the new tunnel down");
                    self.runner.terminate(&handle);
                    self.spawn_teardown();
                }
            }
            Err(e) => {
                let Some(mut tunnel) = self.tunnel.take() else {
                    return;
                };
                error!("Failed to start tunnel {}: {}", tunnel.config_name, e);
                if let Some(reply) = tunnel.start_reply.take() {
                    let _ = reply.send(StartResult::Failed);
                }
                self.tunnel_gone("tunnel failed to start");
            }
        }
    }

    fn on_process_exited(&mut self, token: ProcessToken, status: ExitStatus) {
        let tracked = self
            .tunnel
            .as_ref()
            .and_then(|t| t.process.as_ref())
            .is_some_and(|h| h.token == token);
        if !tracked {
            debug!("Ignoring exit of untracked process {}", token);
            return;
        }
        let Some(tunnel) = self.tunnel.take() else {
            return;
        };
        let pid = tunnel.process.as_ref().map(|h| h.pid).unwrap_or_default();
        self.host.child_exited(pid, status);

        if tunnel.stop_requested {
            info!("Tunnel {} stopped ({})", tunnel.config_name, status);
        } else if status.success() {
            // wg-quick exits 0 once the interface is configured
            info!("Tunnel process for {} finished ({})", tunnel.config_name, status);
        } else {
            warn!(
                "Tunnel process for {} exited unexpectedly with {}",
                tunnel.config_name, status
            );
            if self.state.interface_up {
                self.spawn_teardown();
            }
        }

        self.state = ConnectionState {
            tunnel_up: false,
            ..self.state.clone()
        };
        self.tunnel_gone("tunnel process exited");
    }

    fn on_interface_up(&mut self, index: u32) {
        if self.state.interface_up && self.state.interface_index == Some(index) && self.state.tunnel_up {
            debug!("Interface {} already up", index);
            return;
        }
        info!("Interface {} (index {}) is up", self.settings.interface_name, index);
        self.state = ConnectionState {
            interface_up: true,
            interface_index: Some(index),
            ..self.state.clone()
        };

        let establish = self
            .tunnel
            .as_ref()
            .is_some_and(|t| !t.stop_requested);
        if establish {
            self.establish();
        }
    }

    fn on_interface_down(&mut self, index: u32) {
        if !self.state.interface_up || self.state.interface_index != Some(index) {
            debug!("Ignoring down report for interface index {}", index);
            return;
        }
        info!("Interface {} (index {}) is down", self.settings.interface_name, index);
        self.state = ConnectionState {
            interface_up: false,
            interface_index: None,
            tunnel_up: false,
            ..self.state.clone()
        };
        self.send_ip_down_to_bound();

        if self.tunnel.as_ref().is_some_and(|t| !t.stop_requested) {
            self.begin_stop("interface went down");
        }
    }

    fn on_ip_up(&mut self, key: ConnectionKey, token: HostToken) {
        if self.connections.contains_key(&key) {
            warn!("Connection {} is already tracked, ignoring IP up", key);
            return;
        }

        let provider = self.config.resolve_provider(&key.network_id);
        let mut handle = ConnectionHandle::new(token);

        if provider.is_wireguard {
            let Some(name) = provider.service_id else {
                warn!("Connection {} is a tunnel carrier without a configuration", key);
                self.host.request_close(&key, "provider has no tunnel configuration");
                return;
            };
            info!("Connection {} is provided by tunnel {}", key, name);
            handle.bound = true;
            handle.provider = true;
            let origin = Origin::Provider(key.clone());
            self.attach(key, handle, name, origin);
        } else if self.state.system_wide_enabled {
            match self.config.active_config_name() {
                Some(name) => {
                    info!("Tunnelling connection {} through {}", key, name);
                    handle.bound = true;
                    self.attach(key, handle, name, Origin::SystemWide);
                }
                None => {
                    warn!("System-wide mode is enabled without an active configuration");
                    self.pass_through(key, handle);
                }
            }
        } else {
            self.pass_through(key, handle);
        }
    }

    fn pass_through(&mut self, key: ConnectionKey, mut handle: ConnectionHandle) {
        self.host.ip_up(&key, &handle.token);
        handle.ip_up_sent = true;
        self.connections.insert(key, handle);
    }

    /// Bind a connection to the tunnel, starting it when none exists
    fn attach(&mut self, key: ConnectionKey, mut handle: ConnectionHandle, name: String, origin: Origin) {
        match self.tunnel.as_mut() {
            Some(tunnel) if tunnel.stop_requested => {
                self.host.request_close(&key, "tunnel is shutting down");
                return;
            }
            Some(tunnel) => {
                if tunnel.config_name != name {
                    warn!(
                        "Connection {} wants {} but tunnel runs {}",
                        key, name, tunnel.config_name
                    );
                }
                if matches!(origin, Origin::Provider(_)) {
                    tunnel.origin = origin;
                }
                if self.state.tunnel_up {
                    self.host.ip_up(&key, &handle.token);
                    handle.ip_up_sent = true;
                }
            }
            None => {
                if let Err(result) = self.begin_start(name, origin) {
                    warn!("Cannot start tunnel for {}: {}", key, result);
                    self.host.request_close(&key, "tunnel configuration is not usable");
                    return;
                }
            }
        }
        self.connections.insert(key, handle);
    }

    fn on_ip_down(&mut self, key: ConnectionKey) {
        let tunnel_live = self.tunnel.is_some();
        let Some(handle) = self.connections.get_mut(&key) else {
            debug!("IP down for untracked connection {}", key);
            return;
        };

        if handle.bound && tunnel_live {
            handle.down_requested = true;
            let still_wanted = self
                .connections
                .values()
                .any(|h| h.bound && !h.down_requested);
            if still_wanted {
                // Other connections keep using the tunnel
                if let Some(handle) = self.connections.get_mut(&key) {
                    handle.bound = false;
                    if !handle.ip_down_sent {
                        handle.ip_down_sent = true;
                        self.host.ip_down(&key, &handle.token);
                    }
                }
            } else {
                self.begin_stop("connection went down");
            }
            return;
        }

        if !handle.ip_down_sent {
            handle.ip_down_sent = true;
            self.host.ip_down(&key, &handle.token);
        }
        handle.bound = false;
    }

    fn on_host_close(&mut self, key: ConnectionKey) {
        let tunnel_live = self.tunnel.is_some();
        match self.connections.get_mut(&key) {
            Some(handle) if handle.bound && tunnel_live => {
                info!("Host closes connection {}", key);
                handle.down_requested = true;
                self.begin_stop("host closed the connection");
            }
            Some(_) => debug!("Close for pass-through connection {} ignored", key),
            None => debug!("Close for untracked connection {}", key),
        }
    }

    fn on_config_changed(&mut self) {
        if self.transition_ongoing() {
            debug!("Configuration change deferred until the tunnel settles");
            self.config_change_pending = true;
            return;
        }
        self.apply_config_change();
    }

    fn apply_config_change(&mut self) {
        self.config_change_pending = false;
        let enabled = self.config.is_system_wide_enabled();
        let was_enabled = self.state.system_wide_enabled;
        self.selected_config = self.config.active_config_name();
        self.state = ConnectionState {
            system_wide_enabled: enabled,
            ..self.state.clone()
        };
        info!(
            "Configuration re-read: system-wide {}, active configuration {:?}",
            if enabled { "enabled" } else { "disabled" },
            self.selected_config
        );

        if enabled && !was_enabled && self.tunnel.is_none() {
            let carriers: Vec<ConnectionKey> = self
                .connections
                .iter()
                .filter(|(_, h)| !h.bound && !h.control && !h.ip_down_sent)
                .map(|(k, _)| k.clone())
                .collect();
            let Some(name) = self.selected_config.clone() else {
                warn!("System-wide mode enabled without an active configuration");
                return;
            };
            if carriers.is_empty() {
                return;
            }
            if self.begin_start(name, Origin::SystemWide).is_ok() {
                for key in carriers {
                    if let Some(handle) = self.connections.get_mut(&key) {
                        handle.bound = true;
                    }
                }
            }
        } else if !enabled && was_enabled {
            let system_wide = self
                .tunnel
                .as_ref()
                .is_some_and(|t| t.origin == Origin::SystemWide);
            if system_wide {
                for handle in self
                    .connections
                    .values_mut()
                    .filter(|h| !h.provider && !h.control)
                {
                    handle.bound = false;
                }
                self.begin_stop("system-wide mode disabled");
            }
        }
    }

    fn on_infrastructure_failed(&mut self, component: InfraComponent) {
        error!("{} failed permanently, continuing degraded", component);
        self.state = match component {
            InfraComponent::ControlChannel => ConnectionState {
                control_channel_failed: true,
                ..self.state.clone()
            },
            InfraComponent::InterfaceMonitor => ConnectionState {
                monitor_failed: true,
                ..self.state.clone()
            },
        };
    }

    fn on_shutdown(&mut self, done: oneshot::Sender<()>) {
        info!("Shutting down tunnel state machine");
        self.shutdown = Some(done);
        if self.tunnel.is_some() {
            self.begin_stop("daemon shutting down");
        }
    }

    /// Validate the configuration and launch the bringup off the event loop
    fn begin_start(&mut self, config_name: String, origin: Origin) -> Result<(), StartResult> {
        if !self.config.is_known_config(&config_name) {
            warn!("Unknown tunnel configuration {}", config_name);
            return Err(StartResult::InvalidConfig);
        }
        let blob = self.config.generate_config(&config_name).map_err(|e| {
            warn!("Configuration {} is not usable: {}", config_name, e);
            StartResult::InvalidConfig
        })?;

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        info!("Starting tunnel {} (attempt {})", config_name, attempt);

        let settings = self.settings.clone();
        let runner = Arc::clone(&self.runner);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = launch(&settings, runner.as_ref(), &blob);
            if let Err(unsent) = events.send(Event::SpawnCompleted { attempt, result }) {
                reap_unclaimed(runner.as_ref(), unsent.0);
            }
        });

        self.tunnel = Some(Tunnel {
            attempt,
            config_name,
            origin,
            process: None,
            start_reply: None,
            stop_requested: false,
        });
        Ok(())
    }

    /// Terminate the bringup process and run the teardown command
    ///
    /// Without a known process the stop is only recorded; the spawn
    /// completion handles it.
    fn begin_stop(&mut self, reason: &str) {
        let Some(tunnel) = self.tunnel.as_mut() else {
            return;
        };
        if tunnel.stop_requested {
            return;
        }
        info!("Stopping tunnel {}: {}", tunnel.config_name, reason);
        tunnel.stop_requested = true;
        let process = tunnel.process.clone();

        self.state = ConnectionState {
            tunnel_up: false,
            ..self.state.clone()
        };
        if let Some(handle) = process {
            self.runner.terminate(&handle);
            self.spawn_teardown();
        }
    }

    fn establish(&mut self) {
        if self.state.tunnel_up {
            return;
        }
        if let Some(ref tunnel) = self.tunnel {
            info!("Tunnel {} established", tunnel.config_name);
        }
        self.state = ConnectionState {
            tunnel_up: true,
            ..self.state.clone()
        };
        for (key, handle) in self.connections.iter_mut() {
            if handle.bound && !handle.ip_up_sent && !handle.down_requested {
                handle.ip_up_sent = true;
                self.host.ip_up(key, &handle.token);
            }
        }
    }

    fn send_ip_down_to_bound(&mut self) {
        for (key, handle) in self.connections.iter_mut() {
            if handle.bound && handle.ip_up_sent && !handle.ip_down_sent {
                handle.ip_down_sent = true;
                self.host.ip_down(key, &handle.token);
            }
        }
    }

    /// Finish every bound connection once the tunnel slot is empty
    fn tunnel_gone(&mut self, reason: &str) {
        for (key, handle) in self.connections.iter_mut() {
            if !handle.bound || handle.ip_down_sent {
                continue;
            }
            handle.ip_down_sent = true;
            if handle.control {
                if handle.ip_up_sent {
                    self.host.ip_down(key, &handle.token);
                }
            } else if handle.ip_up_sent || handle.down_requested {
                self.host.ip_down(key, &handle.token);
            } else {
                self.host.request_close(key, reason);
            }
        }
    }

    fn watch_tunnel(&self, handle: &ProcessHandle) {
        let events = self.events_tx.clone();
        let token = handle.token;
        self.runner.watch(
            handle,
            Box::new(move |status| {
                let _ = events.send(Event::ProcessExited { token, status });
            }),
        );
        self.host.watch_process(handle.pid);
    }

    fn watch_orphan(&self, handle: &ProcessHandle) {
        let pid = handle.pid;
        self.runner.watch(
            handle,
            Box::new(move |status| debug!("Orphaned process {} exited with {}", pid, status)),
        );
    }

    fn spawn_teardown(&self) {
        let args = self.settings.args("down");
        match self
            .runner
            .spawn(&self.settings.run_as, &self.settings.tool_path, &args)
        {
            Ok(handle) => {
                let pid = handle.pid;
                self.runner.watch(
                    &handle,
                    Box::new(move |status| {
                        if status.success() {
                            debug!("Teardown process {} finished", pid);
                        } else {
                            warn!("Teardown process {} finished with {}", pid, status);
                        }
                    }),
                );
            }
            Err(e) => error!("Failed to run tunnel teardown: {}", e),
        }
    }

    fn transition_ongoing(&self) -> bool {
        self.tunnel
            .as_ref()
            .is_some_and(|t| t.stop_requested || !self.state.tunnel_up)
    }

    /// Bookkeeping that follows every transition
    fn settle(&mut self) {
        if self.config_change_pending && !self.transition_ongoing() {
            self.apply_config_change();
        }

        // Finished connections go once the tunnel no longer needs them
        let tunnel_live = self.tunnel.is_some();
        self.connections
            .retain(|_, h| !(h.ip_down_sent && (!h.bound || !tunnel_live)));

        if !tunnel_live {
            if let Some(done) = self.shutdown.take() {
                let _ = done.send(());
                self.finished = true;
            }
        }
    }

    /// Build and publish the snapshot for this transition
    fn commit(&mut self) {
        let tunnel = self.tunnel.as_ref();
        let next = ConnectionState {
            tunnel_process_running: tunnel.is_some(),
            stopping: tunnel.is_some_and(|t| t.stop_requested),
            config_transition_ongoing: self.transition_ongoing(),
            active_config_name: tunnel
                .map(|t| Some(t.config_name.clone()))
                .unwrap_or_else(|| self.selected_config.clone()),
            iap_connected: self.connections.values().any(|h| !h.control),
            service_provider_mode: self.connections.values().any(|h| h.provider),
            ..self.state.clone()
        }
        .normalized();

        if next.phase() != self.state.phase() {
            debug!("Phase {} -> {}", self.state.phase(), next.phase());
        }
        self.state = next;
        self.snapshots.send_replace(self.state.clone());
        self.notifier.publish(&self.state);
    }
}

/// Terminate a bringup process whose completion nobody is left to handle
fn reap_unclaimed(runner: &dyn ProcessRunner, event: Event) {
    if let Event::SpawnCompleted {
        result: Ok(handle), ..
    } = event
    {
        warn!("State machine is gone, terminating tunnel process {}", handle.pid);
        let pid = handle.pid;
        runner.watch(
            &handle,
            Box::new(move |status| debug!("Unclaimed process {} exited with {}", pid, status)),
        );
        runner.terminate(&handle);
    }
}

/// Write the generated configuration and spawn `<tool> up <interface>`
fn launch(
    settings: &TunnelSettings,
    runner: &dyn ProcessRunner,
    blob: &GeneratedConfig,
) -> Result<ProcessHandle, SpawnError> {
    if let Some(ref path) = settings.config_output {
        write_config(path, blob)?;
    }
    runner.spawn(&settings.run_as, &settings.tool_path, &settings.args("up"))
}

fn write_config(path: &Path, blob: &GeneratedConfig) -> Result<(), SpawnError> {
    let failed = |e: std::io::Error| SpawnError::ConfigWriteFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(failed)?;
    // An existing file keeps its old mode through open()
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(failed)?;
    file.write_all(blob.expose().as_bytes()).map_err(failed)?;
    debug!("Wrote tunnel configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_config_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icdwg0.conf");
        std::fs::write(&path, "old contents that are longer than the new ones").unwrap();

        write_config(&path, &GeneratedConfig::new("[Interface]\n".to_string())).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[Interface]\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_write_config_reports_path() {
        let err = write_config(
            Path::new("/nonexistent-dir/icdwg0.conf"),
            &GeneratedConfig::new(String::new()),
        )
        .unwrap_err();
        assert!(matches!(err, SpawnError::ConfigWriteFailed { ref path, .. } if path.contains("nonexistent-dir")));
    }

    #[test]
    fn test_settings_from_config() {
        let config = DaemonConfig::default();
        let settings = TunnelSettings::from_config(&config, PathBuf::from("/usr/bin/wg-quick"));
        assert_eq!(settings.interface_name, "icdwg0");
        assert_eq!(settings.args("up"), vec!["up".to_string(), "icdwg0".to_string()]);
        assert_eq!(
            settings.config_output,
            Some(PathBuf::from("/etc/wireguard/icdwg0.conf"))
        );
    }
}
