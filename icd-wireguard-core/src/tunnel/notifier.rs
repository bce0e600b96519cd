//! Status change broadcasting
//!
//! The notifier never blocks the state machine: listeners get a bounded
//! broadcast channel and a listener that falls behind loses the oldest
//! reports.

use crate::tunnel::state::{ConnectionState, StatusReport};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Broadcasts a [`StatusReport`] whenever the visible status changes
pub struct StatusNotifier {
    tx: broadcast::Sender<StatusReport>,
    last: Option<StatusReport>,
}

/// Cloneable handle for subscribing to status changes
#[derive(Clone)]
pub struct StatusFeed(broadcast::Sender<StatusReport>);

impl StatusFeed {
    pub fn subscribe(&self) -> broadcast::Receiver<StatusReport> {
        self.0.subscribe()
    }
}

impl StatusNotifier {
    /// Create a notifier buffering up to `capacity` reports per listener
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, last: None }
    }

    pub fn feed(&self) -> StatusFeed {
        StatusFeed(self.tx.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusReport> {
        self.tx.subscribe()
    }

    /// Publish a snapshot
    ///
    /// Returns whether a broadcast went out, which happens only when the
    /// report differs from the previously published one. The first
    /// snapshot establishes the baseline.
    pub fn publish(&mut self, snapshot: &ConnectionState) -> bool {
        let report = snapshot.report();
        match self.last {
            None => {
                self.last = Some(report);
                return false;
            }
            Some(last) if last == report => return false,
            Some(_) => {}
        }
        self.last = Some(report);

        info!(
            "Tunnel status changed: {} ({})",
            report.state, report.mode
        );
        if self.tx.send(report).is_err() {
            debug!("No status listeners");
        }
        true
    }
}
