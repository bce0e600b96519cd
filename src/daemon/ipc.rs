//! Unix socket IPC for the control front end
//!
//! One JSON document per line in both directions. A client sends a request
//! line and reads one response line; after `Subscribe` the connection stays
//! open and receives a `StatusChanged` line for every broadcast.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use icd_wireguard_core::error::ControlError;
use icd_wireguard_core::tunnel::{
    ControlApi, ControlRequest, ControlResponse, StatusFeed, StatusReport,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::net::{UnixListener, UnixStream as AsyncUnixStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

const KNOWN_METHODS: [&str; 4] = ["Start", "Stop", "GetStatus", "Subscribe"];

/// Decode one request line
///
/// Methods this daemon does not implement decode to
/// [`ControlRequest::Unsupported`]; anything that is not a request object
/// is an error.
pub fn decode_request(line: &str) -> Result<ControlRequest, String> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| format!("Invalid request: {}", e))?;
    let method = match value.get("method").and_then(Value::as_str) {
        Some(method) => method.to_string(),
        None => return Err("Request has no method".to_string()),
    };

    if !KNOWN_METHODS.contains(&method.as_str()) {
        return Ok(ControlRequest::Unsupported { method });
    }
    serde_json::from_value(value).map_err(|e| format!("Invalid {} request: {}", method, e))
}

fn encode_line(response: &ControlResponse) -> Vec<u8> {
    let mut line = serde_json::to_vec(response).unwrap_or_else(|e| {
        error!("Failed to serialize control response: {}", e);
        br#"{"type":"Error","message":"serialization failed"}"#.to_vec()
    });
    line.push(b'\n');
    line
}

/// IPC server the daemon listens on
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    api: ControlApi,
    status: StatusFeed,
}

impl IpcServer {
    /// Bind the control socket, replacing a stale one
    pub fn bind(socket_path: &Path, api: ControlApi, status: StatusFeed) -> Result<Self, ControlError> {
        let ipc_error = |reason: String| ControlError::Ipc { reason };

        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .map_err(|e| ipc_error(format!("Failed to remove stale socket: {}", e)))?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ipc_error(format!("Failed to create socket directory: {}", e)))?;
        }

        let listener = UnixListener::bind(socket_path)
            .map_err(|e| ipc_error(format!("Failed to bind IPC socket: {}", e)))?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| ipc_error(format!("Failed to set socket permissions: {}", e)))?;

        info!("IPC server listening on {:?}", socket_path);
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            api,
            status,
        })
    }

    /// Accept clients until the task is dropped
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let api = self.api.clone();
                    let status = self.status.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, api, status).await {
                            debug!("IPC client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("IPC accept error: {}", e);
                }
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_client(
    stream: AsyncUnixStream,
    api: ControlApi,
    status: StatusFeed,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = AsyncBufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match decode_request(&line) {
            Ok(request) => request,
            Err(message) => {
                warn!("Rejecting IPC request: {}", message);
                writer
                    .write_all(&encode_line(&ControlResponse::Error { message }))
                    .await?;
                continue;
            }
        };

        if request == ControlRequest::Subscribe {
            // Subscribe before acknowledging so no change is missed
            let mut receiver = status.subscribe();
            writer.write_all(&encode_line(&ControlResponse::Subscribed)).await?;
            loop {
                match receiver.recv().await {
                    Ok(report) => {
                        writer
                            .write_all(&encode_line(&ControlResponse::StatusChanged(report)))
                            .await?;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("IPC subscriber lagged, {} status changes dropped", missed);
                    }
                    Err(RecvError::Closed) => return Ok(()),
                }
            }
        }

        let response = api.dispatch(request).await;
        writer.write_all(&encode_line(&response)).await?;
    }

    Ok(())
}

/// Blocking IPC client used by the command-line front end
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    fn connect(&self, request: &ControlRequest) -> Result<BufReader<UnixStream>, ControlError> {
        let ipc_error = |reason: String| ControlError::Ipc { reason };

        let mut stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            ipc_error(format!(
                "Failed to connect to daemon socket {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let mut message = serde_json::to_vec(request)
            .map_err(|e| ipc_error(format!("Failed to serialize request: {}", e)))?;
        message.push(b'\n');
        stream
            .write_all(&message)
            .and_then(|_| stream.flush())
            .map_err(|e| ipc_error(format!("Failed to send request: {}", e)))?;

        Ok(BufReader::new(stream))
    }

    fn read_response(reader: &mut BufReader<UnixStream>) -> Result<Option<ControlResponse>, ControlError> {
        let mut line = String::new();
        let read = reader.read_line(&mut line).map_err(|e| ControlError::Ipc {
            reason: format!("Failed to read response: {}", e),
        })?;
        if read == 0 {
            return Ok(None);
        }
        serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| ControlError::Ipc {
                reason: format!("Failed to deserialize response: {}", e),
            })
    }

    /// Send one request and wait for its response
    pub fn send_request(&self, request: &ControlRequest) -> Result<ControlResponse, ControlError> {
        let mut reader = self.connect(request)?;
        Self::read_response(&mut reader)?.ok_or_else(|| ControlError::Ipc {
            reason: "Daemon closed the connection without responding".to_string(),
        })
    }

    /// Follow status changes until the daemon goes away
    pub fn subscribe<F>(&self, mut on_change: F) -> Result<(), ControlError>
    where
        F: FnMut(StatusReport),
    {
        let mut reader = self.connect(&ControlRequest::Subscribe)?;
        match Self::read_response(&mut reader)? {
            Some(ControlResponse::Subscribed) => {}
            other => {
                return Err(ControlError::Ipc {
                    reason: format!("Unexpected response to subscribe: {:?}", other),
                })
            }
        }

        while let Some(response) = Self::read_response(&mut reader)? {
            if let ControlResponse::StatusChanged(report) = response {
                on_change(report);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icd_wireguard_core::config::toml_config::TomlConfig;
    use icd_wireguard_core::config::{DaemonConfig, TomlConfigProvider};
    use icd_wireguard_core::tunnel::{
        Event, LoggingHost, StartResult, StateMachine, StatusNotifier, SystemProcessRunner,
        TunnelSettings, TunnelStatus,
    };
    use std::sync::Arc;
    use std::time::Duration;

    struct Daemon {
        socket_path: PathBuf,
        events: tokio::sync::mpsc::UnboundedSender<Event>,
        _dir: tempfile::TempDir,
    }

    fn spawn_daemon() -> Daemon {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("control.sock");

        let provider = Arc::new(TomlConfigProvider::new(
            dir.path().join("config.toml"),
            TomlConfig::default(),
        ));
        let machine = StateMachine::new(
            TunnelSettings::from_config(&DaemonConfig::default(), "/bin/false".into()),
            provider.clone(),
            Arc::new(SystemProcessRunner::new(Duration::from_secs(1))),
            Arc::new(LoggingHost),
            StatusNotifier::new(8),
        );
        let api = ControlApi::new(machine.events(), machine.snapshots(), provider);
        let server = IpcServer::bind(&socket_path, api, machine.status_feed()).unwrap();
        let events = machine.events();

        tokio::spawn(machine.run());
        tokio::spawn(server.run());

        Daemon {
            socket_path,
            events,
            _dir: dir,
        }
    }

    async fn exchange(socket_path: &Path, line: &str) -> Value {
        let stream = AsyncUnixStream::connect(socket_path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();

        let mut lines = AsyncBufReader::new(reader).lines();
        let response = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&response).unwrap()
    }

    #[test]
    fn test_decode_known_and_unknown_methods() {
        assert_eq!(
            decode_request(r#"{"method":"Start","config_name":"home"}"#).unwrap(),
            ControlRequest::Start {
                config_name: "home".to_string()
            }
        );
        assert_eq!(
            decode_request(r#"{"method":"GetStatus"}"#).unwrap(),
            ControlRequest::GetStatus
        );
        assert_eq!(
            decode_request(r#"{"method":"Reboot","now":true}"#).unwrap(),
            ControlRequest::Unsupported {
                method: "Reboot".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(decode_request("not json").is_err());
        assert!(decode_request(r#"{"config_name":"home"}"#).is_err());
        // Known method with missing arguments
        assert!(decode_request(r#"{"method":"Start"}"#).is_err());
    }

    #[tokio::test]
    async fn test_get_status_over_socket() {
        // Given: A daemon with no tunnel running
        let daemon = spawn_daemon();

        // When: A client asks for the status
        let response = exchange(&daemon.socket_path, r#"{"method":"GetStatus"}"#).await;

        // Then: It is Stopped in normal mode with no degraded flags
        assert_eq!(response["type"], "Status");
        assert_eq!(response["state"], "Stopped");
        assert_eq!(response["mode"], "Normal");
        assert_eq!(response["monitor_failed"], false);
    }

    #[tokio::test]
    async fn test_unknown_method_gets_explicit_unsupported() {
        let daemon = spawn_daemon();

        let response = exchange(&daemon.socket_path, r#"{"method":"Reboot"}"#).await;

        assert_eq!(
            response,
            serde_json::json!({"type": "Unsupported", "method": "Reboot"})
        );
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error() {
        let daemon = spawn_daemon();

        let response = exchange(&daemon.socket_path, "{{{").await;

        assert_eq!(response["type"], "Error");
    }

    #[tokio::test]
    async fn test_start_of_unknown_config_is_invalid_config() {
        let daemon = spawn_daemon();

        let response = exchange(
            &daemon.socket_path,
            r#"{"method":"Start","config_name":"nowhere"}"#,
        )
        .await;

        assert_eq!(response["type"], "Start");
        assert_eq!(response["result"], "InvalidConfig");
        assert_eq!(response["code"], StartResult::InvalidConfig.code());
    }

    #[tokio::test]
    async fn test_subscriber_receives_status_changes() {
        // Given: A subscribed client
        let daemon = spawn_daemon();
        let stream = AsyncUnixStream::connect(&daemon.socket_path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"{\"method\":\"Subscribe\"}\n").await.unwrap();
        let mut lines = AsyncBufReader::new(reader).lines();
        let ack: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(ack["type"], "Subscribed");

        // When: The monitor gives up, which degrades the reported status
        daemon
            .events
            .send(Event::InfrastructureFailed {
                component: icd_wireguard_core::tunnel::InfraComponent::InterfaceMonitor,
            })
            .unwrap();

        // Then: The change is streamed
        let changed: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(changed["type"], "StatusChanged");
        assert_eq!(changed["state"], TunnelStatus::Stopped.as_str());
        assert_eq!(changed["monitor_failed"], true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_requests_against_server() {
        // Given: A running daemon and the blocking client
        let daemon = spawn_daemon();
        let client = IpcClient::new(daemon.socket_path.clone());

        // When: Asking for the status and starting an unknown configuration
        let (status, start) = tokio::task::spawn_blocking(move || {
            let status = client.send_request(&ControlRequest::GetStatus);
            let start = client.send_request(&ControlRequest::Start {
                config_name: "nowhere".to_string(),
            });
            (status, start)
        })
        .await
        .unwrap();

        // Then: Both come back decoded
        match status.unwrap() {
            ControlResponse::Status(report) => assert_eq!(report.state, TunnelStatus::Stopped),
            other => panic!("unexpected status response: {:?}", other),
        }
        assert!(matches!(
            start.unwrap(),
            ControlResponse::Start {
                result: StartResult::InvalidConfig,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_subscription_receives_changes() {
        // Given: A client following status changes from its own thread
        let daemon = spawn_daemon();
        let client = IpcClient::new(daemon.socket_path.clone());
        let (reports_tx, reports_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = client.subscribe(|report| {
                let _ = reports_tx.send(report);
            });
        });

        // When: The control channel is reported failed once the client is in
        tokio::time::sleep(Duration::from_millis(300)).await;
        daemon
            .events
            .send(Event::InfrastructureFailed {
                component: icd_wireguard_core::tunnel::InfraComponent::ControlChannel,
            })
            .unwrap();
        let report = tokio::task::spawn_blocking(move || {
            reports_rx.recv_timeout(Duration::from_secs(5)).ok()
        })
        .await
        .unwrap();

        // Then: The client callback saw the degraded status
        let report = report.expect("no status change reached the client");
        assert!(report.control_channel_failed);
        assert_eq!(report.state, TunnelStatus::Stopped);
    }

    #[test]
    fn test_bind_replaces_stale_socket_and_removes_it_on_drop() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let socket_path = dir.path().join("stale.sock");
            std::fs::write(&socket_path, b"").unwrap();

            let provider = Arc::new(TomlConfigProvider::new(
                dir.path().join("config.toml"),
                TomlConfig::default(),
            ));
            let machine = StateMachine::new(
                TunnelSettings::from_config(&DaemonConfig::default(), "/bin/false".into()),
                provider.clone(),
                Arc::new(SystemProcessRunner::new(Duration::from_secs(1))),
                Arc::new(LoggingHost),
                StatusNotifier::new(8),
            );
            let api = ControlApi::new(machine.events(), machine.snapshots(), provider);

            let server = IpcServer::bind(&socket_path, api, machine.status_feed()).unwrap();
            let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);

            drop(server);
            assert!(!socket_path.exists());
        });
    }
}
