//! In-memory collaborators for driving the state machine deterministically

#![allow(dead_code)]

use icd_wireguard_core::config::{ConfigProvider, ProviderInfo};
use icd_wireguard_core::error::{ConfigError, SpawnError};
use icd_wireguard_core::tunnel::{
    ConnectionKey, Event, ExitStatus, HostAdapter, HostToken, ProcessHandle, ProcessRunner,
    ProcessToken, StartResult, StateMachine, StatusNotifier, StatusReport, StopResult,
    TunnelSettings,
};
use icd_wireguard_core::tunnel::process::ExitCallback;
use icd_wireguard_core::types::GeneratedConfig;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};

pub const TOOL: &str = "/usr/bin/wg-quick";
pub const IFACE: &str = "icdwg0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCall {
    pub user: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub token: ProcessToken,
}

/// Records spawns and lets tests decide when processes exit
#[derive(Default)]
pub struct MockRunner {
    pub spawns: Mutex<Vec<SpawnCall>>,
    pub terminated: Mutex<Vec<ProcessToken>>,
    watchers: Mutex<HashMap<ProcessToken, ExitCallback>>,
    /// Fail the next bringup spawn with this error
    pub fail_next_up: Mutex<Option<SpawnError>>,
    next: Mutex<u64>,
}

impl MockRunner {
    pub fn spawns(&self) -> Vec<SpawnCall> {
        self.spawns.lock().unwrap().clone()
    }

    pub fn spawns_with(&self, verb: &str) -> Vec<SpawnCall> {
        self.spawns()
            .into_iter()
            .filter(|s| s.args.first().map(String::as_str) == Some(verb))
            .collect()
    }

    pub fn last_up(&self) -> SpawnCall {
        self.spawns_with("up").pop().expect("no bringup spawned")
    }

    pub fn terminated(&self) -> Vec<ProcessToken> {
        self.terminated.lock().unwrap().clone()
    }

    /// Simulate the exit of a watched process
    pub fn exit(&self, token: ProcessToken, status: ExitStatus) -> bool {
        let callback = self.watchers.lock().unwrap().remove(&token);
        match callback {
            Some(callback) => {
                callback(status);
                true
            }
            None => false,
        }
    }

    pub fn is_watched(&self, token: ProcessToken) -> bool {
        self.watchers.lock().unwrap().contains_key(&token)
    }
}

impl ProcessRunner for MockRunner {
    fn spawn(&self, user: &str, program: &Path, args: &[String]) -> Result<ProcessHandle, SpawnError> {
        if args.first().map(String::as_str) == Some("up") {
            if let Some(err) = self.fail_next_up.lock().unwrap().take() {
                return Err(err);
            }
        }
        let mut next = self.next.lock().unwrap();
        *next += 1;
        let token = ProcessToken::from_raw(*next);
        self.spawns.lock().unwrap().push(SpawnCall {
            user: user.to_string(),
            program: program.to_path_buf(),
            args: args.to_vec(),
            token,
        });
        Ok(ProcessHandle {
            token,
            pid: 1000 + *next as u32,
        })
    }

    fn watch(&self, handle: &ProcessHandle, on_exit: ExitCallback) {
        self.watchers.lock().unwrap().insert(handle.token, on_exit);
    }

    fn terminate(&self, handle: &ProcessHandle) {
        self.terminated.lock().unwrap().push(handle.token);
    }
}

/// Configuration store held in memory
#[derive(Default)]
pub struct MockConfig {
    pub known: Mutex<HashSet<String>>,
    /// Known but not renderable
    pub broken: Mutex<HashSet<String>>,
    /// Carrier id to the configuration it names, if any
    pub providers: Mutex<HashMap<String, Option<String>>>,
    pub system_wide: Mutex<bool>,
    pub active: Mutex<Option<String>>,
}

impl MockConfig {
    pub fn with_configs(names: &[&str]) -> Self {
        let config = Self::default();
        for name in names {
            config.known.lock().unwrap().insert(name.to_string());
        }
        config
    }

    pub fn set_system_wide(&self, enabled: bool, active: Option<&str>) {
        *self.system_wide.lock().unwrap() = enabled;
        *self.active.lock().unwrap() = active.map(str::to_string);
    }

    /// Make `network_id` a provider carrier for `service_id`
    pub fn add_provider(&self, network_id: &str, service_id: &str) {
        self.providers
            .lock()
            .unwrap()
            .insert(network_id.to_string(), Some(service_id.to_string()));
    }

    /// Make `network_id` a provider carrier that names no configuration
    pub fn add_unconfigured_provider(&self, network_id: &str) {
        self.providers
            .lock()
            .unwrap()
            .insert(network_id.to_string(), None);
    }
}

impl ConfigProvider for MockConfig {
    fn is_known_config(&self, name: &str) -> bool {
        self.known.lock().unwrap().contains(name)
    }

    fn resolve_provider(&self, connection_id: &str) -> ProviderInfo {
        match self.providers.lock().unwrap().get(connection_id) {
            Some(Some(service_id)) => ProviderInfo {
                is_wireguard: self.is_known_config(service_id),
                service_id: Some(service_id.clone()),
            },
            Some(None) => ProviderInfo {
                is_wireguard: true,
                service_id: None,
            },
            None => ProviderInfo::default(),
        }
    }

    fn is_system_wide_enabled(&self) -> bool {
        *self.system_wide.lock().unwrap()
    }

    fn active_config_name(&self) -> Option<String> {
        self.active.lock().unwrap().clone()
    }

    fn generate_config(&self, name: &str) -> Result<GeneratedConfig, ConfigError> {
        if !self.is_known_config(name) {
            return Err(ConfigError::UnknownConfig {
                name: name.to_string(),
            });
        }
        if self.broken.lock().unwrap().contains(name) {
            return Err(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            });
        }
        Ok(GeneratedConfig::new(format!("[Interface]\n# {}\n", name)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    WatchProcess(u32),
    ChildExited(u32),
    IpUp(ConnectionKey),
    IpDown(ConnectionKey),
    RequestClose(ConnectionKey),
}

#[derive(Default)]
pub struct MockHost {
    pub calls: Mutex<Vec<HostCall>>,
}

impl MockHost {
    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: &HostCall) -> usize {
        self.calls().iter().filter(|c| *c == wanted).count()
    }

    pub fn count_child_exits(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, HostCall::ChildExited(_)))
            .count()
    }
}

impl HostAdapter for MockHost {
    fn watch_process(&self, pid: u32) {
        self.calls.lock().unwrap().push(HostCall::WatchProcess(pid));
    }

    fn child_exited(&self, pid: u32, _status: ExitStatus) {
        self.calls.lock().unwrap().push(HostCall::ChildExited(pid));
    }

    fn ip_up(&self, key: &ConnectionKey, _token: &HostToken) {
        self.calls.lock().unwrap().push(HostCall::IpUp(key.clone()));
    }

    fn ip_down(&self, key: &ConnectionKey, _token: &HostToken) {
        self.calls.lock().unwrap().push(HostCall::IpDown(key.clone()));
    }

    fn request_close(&self, key: &ConnectionKey, _reason: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(HostCall::RequestClose(key.clone()));
    }
}

pub fn carrier(id: &str) -> ConnectionKey {
    ConnectionKey::new("WLAN_INFRA", 0, id)
}

pub fn settings() -> TunnelSettings {
    TunnelSettings {
        tool_path: PathBuf::from(TOOL),
        interface_name: IFACE.to_string(),
        run_as: "root".to_string(),
        config_output: None,
    }
}

/// A state machine wired to the mocks
pub struct Harness {
    pub machine: StateMachine,
    pub runner: Arc<MockRunner>,
    pub config: Arc<MockConfig>,
    pub host: Arc<MockHost>,
    pub status: broadcast::Receiver<StatusReport>,
    next_token: u64,
}

impl Harness {
    pub fn new(config: MockConfig) -> Self {
        let runner = Arc::new(MockRunner::default());
        let config = Arc::new(config);
        let host = Arc::new(MockHost::default());
        let machine = StateMachine::new(
            settings(),
            config.clone(),
            runner.clone(),
            host.clone(),
            StatusNotifier::new(64),
        );
        let status = machine.status_feed().subscribe();
        Self {
            machine,
            runner,
            config,
            host,
            status,
            next_token: 0,
        }
    }

    pub fn with_home() -> Self {
        Self::new(MockConfig::with_configs(&["home"]))
    }

    /// Send a start and return its pending reply
    pub fn request_start(&mut self, name: &str) -> oneshot::Receiver<StartResult> {
        let (reply, rx) = oneshot::channel();
        self.machine.handle(Event::ControlStart {
            config_name: name.to_string(),
            reply,
        });
        rx
    }

    /// Handle the next queued event (spawn completions, process exits)
    pub async fn step(&mut self) {
        assert!(self.machine.step().await);
    }

    /// Start and let the spawn complete
    pub async fn start(&mut self, name: &str) -> StartResult {
        let mut rx = self.request_start(name);
        if let Ok(result) = rx.try_recv() {
            return result;
        }
        self.step().await;
        rx.await.unwrap()
    }

    pub fn stop(&mut self) -> StopResult {
        let (reply, mut rx) = oneshot::channel();
        self.machine.handle(Event::ControlStop { reply });
        rx.try_recv().unwrap()
    }

    pub fn ip_up(&mut self, key: &ConnectionKey) {
        self.next_token += 1;
        self.machine.handle(Event::IpUp {
            key: key.clone(),
            token: HostToken(self.next_token),
        });
    }

    pub fn send(&mut self, event: Event) {
        self.machine.handle(event);
    }

    /// Let the bringup process exit and handle the resulting event
    pub async fn exit_tunnel(&mut self, status: ExitStatus) {
        let token = self.runner.last_up().token;
        assert!(self.runner.exit(token, status), "tunnel process not watched");
        self.step().await;
    }

    /// Every status broadcast received so far
    pub fn statuses(&mut self) -> Vec<StatusReport> {
        let mut out = Vec::new();
        while let Ok(report) = self.status.try_recv() {
            out.push(report);
        }
        out
    }
}
