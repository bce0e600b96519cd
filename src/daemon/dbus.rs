//! System bus service
//!
//! Exposes `Start`, `Stop` and `GetStatus` on `org.maemo.Wireguard` and
//! re-emits every status broadcast as the `StatusChanged` signal.

use icd_wireguard_core::error::ControlError;
use icd_wireguard_core::tunnel::{ControlApi, StatusFeed, StatusReport};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use zbus::{connection, interface, Connection, SignalContext};

pub const BUS_NAME: &str = "org.maemo.Wireguard";
pub const OBJECT_PATH: &str = "/org/maemo/Wireguard";

struct WireguardService {
    api: ControlApi,
}

#[interface(name = "org.maemo.Wireguard")]
impl WireguardService {
    async fn start(&self, config_name: String) -> u32 {
        debug!("Bus Start({})", config_name);
        self.api.start(&config_name).await.code()
    }

    async fn stop(&self) -> u32 {
        debug!("Bus Stop()");
        self.api.stop().await.code()
    }

    async fn get_status(&self) -> (String, String) {
        let report = self.api.get_status();
        (report.state.as_str().to_string(), report.mode.as_str().to_string())
    }

    #[zbus(signal)]
    async fn status_changed(ctxt: &SignalContext<'_>, state: &str, mode: &str) -> zbus::Result<()>;
}

fn bus_error(e: zbus::Error) -> ControlError {
    ControlError::Bus {
        reason: e.to_string(),
    }
}

/// Register the service and start forwarding status changes
///
/// The returned connection must be kept alive for the service to stay
/// registered.
pub async fn serve(api: ControlApi, status: StatusFeed) -> Result<Connection, ControlError> {
    // Subscribe first so nothing published during registration is lost
    let receiver = status.subscribe();

    let connection = connection::Builder::system()
        .map_err(bus_error)?
        .name(BUS_NAME)
        .map_err(bus_error)?
        .serve_at(OBJECT_PATH, WireguardService { api })
        .map_err(bus_error)?
        .build()
        .await
        .map_err(bus_error)?;

    info!("Registered {} on the system bus", BUS_NAME);
    tokio::spawn(forward_status(connection.clone(), receiver));
    Ok(connection)
}

async fn forward_status(connection: Connection, mut receiver: broadcast::Receiver<StatusReport>) {
    let iface = match connection
        .object_server()
        .interface::<_, WireguardService>(OBJECT_PATH)
        .await
    {
        Ok(iface) => iface,
        Err(e) => {
            warn!("Bus interface lookup failed, no StatusChanged signals: {}", e);
            return;
        }
    };

    loop {
        match receiver.recv().await {
            Ok(report) => {
                let result = WireguardService::status_changed(
                    iface.signal_context(),
                    report.state.as_str(),
                    report.mode.as_str(),
                )
                .await;
                if let Err(e) = result {
                    warn!("Failed to emit StatusChanged: {}", e);
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("Bus forwarder lagged, {} status changes dropped", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
