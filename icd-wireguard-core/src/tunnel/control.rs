//! Remote-control front end of the state machine
//!
//! Transports (bus service, local socket) hold a [`ControlApi`] and turn
//! their requests into [`ControlRequest`]s; the API validates them, enqueues
//! the matching event and waits for the state machine's reply.

use crate::config::ConfigProvider;
use crate::tunnel::event::{Event, StartResult, StopResult};
use crate::tunnel::state::{ConnectionState, StatusReport};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// A remote-control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum ControlRequest {
    Start { config_name: String },
    Stop,
    GetStatus,
    /// Stream status changes; handled by the transport
    Subscribe,
    /// Any method this daemon does not implement
    #[serde(skip)]
    Unsupported { method: String },
}

/// A remote-control response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    Start { result: StartResult, code: u32 },
    Stop { result: StopResult, code: u32 },
    Status(StatusReport),
    Subscribed,
    StatusChanged(StatusReport),
    Unsupported { method: String },
    Error { message: String },
}

// Configuration names double as file and bus argument names
const CONFIG_NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.@-]{0,63}$";

static NAME_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

/// Whether `name` is acceptable as a configuration name
pub fn is_valid_config_name(name: &str) -> bool {
    NAME_PATTERN
        .get_or_init(|| Regex::new(CONFIG_NAME_PATTERN).ok())
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
}

/// Validates control requests and forwards them to the state machine
#[derive(Clone)]
pub struct ControlApi {
    events: mpsc::UnboundedSender<Event>,
    snapshots: watch::Receiver<ConnectionState>,
    config: Arc<dyn ConfigProvider>,
}

impl ControlApi {
    pub fn new(
        events: mpsc::UnboundedSender<Event>,
        snapshots: watch::Receiver<ConnectionState>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            events,
            snapshots,
            config,
        }
    }

    /// Start the tunnel with a named configuration
    ///
    /// Malformed names are rejected with `InvalidArgs` and unknown ones with
    /// `InvalidConfig`, both without involving the state machine.
    pub async fn start(&self, config_name: &str) -> StartResult {
        if !is_valid_config_name(config_name) {
            warn!("Rejecting start with malformed configuration name {:?}", config_name);
            return StartResult::InvalidArgs;
        }
        if !self.config.is_known_config(config_name) {
            warn!("Rejecting start of unknown configuration {}", config_name);
            return StartResult::InvalidConfig;
        }

        let (reply, rx) = oneshot::channel();
        let event = Event::ControlStart {
            config_name: config_name.to_string(),
            reply,
        };
        if self.events.send(event).is_err() {
            warn!("State machine is not running, start failed");
            return StartResult::Failed;
        }
        rx.await.unwrap_or(StartResult::Failed)
    }

    /// Stop the tunnel
    pub async fn stop(&self) -> StopResult {
        let (reply, rx) = oneshot::channel();
        if self.events.send(Event::ControlStop { reply }).is_err() {
            warn!("State machine is not running, nothing to stop");
            return StopResult::NotRunning;
        }
        rx.await.unwrap_or(StopResult::NotRunning)
    }

    /// Current status; never mutates state
    pub fn get_status(&self) -> StatusReport {
        self.snapshots.borrow().report()
    }

    /// Full current snapshot
    pub fn snapshot(&self) -> ConnectionState {
        self.snapshots.borrow().clone()
    }

    /// Answer one request
    pub async fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        debug!("Control request: {:?}", request);
        match request {
            ControlRequest::Start { config_name } => {
                let result = self.start(&config_name).await;
                ControlResponse::Start {
                    result,
                    code: result.code(),
                }
            }
            ControlRequest::Stop => {
                let result = self.stop().await;
                ControlResponse::Stop {
                    result,
                    code: result.code(),
                }
            }
            ControlRequest::GetStatus => ControlResponse::Status(self.get_status()),
            ControlRequest::Subscribe => ControlResponse::Subscribed,
            ControlRequest::Unsupported { method } => {
                warn!("Unsupported control method {:?}", method);
                ControlResponse::Unsupported { method }
            }
        }
    }
}
