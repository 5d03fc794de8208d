//! Device Directory Adapter.
//!
//! [`DeviceDirectory`] is the facade handlers use: it reads the session's
//! shared snapshot for listing/resolution and submits telemetry/vibrate
//! requests to the session task. Every call is fallible and bounded — a
//! query that cannot complete within the timeout fails with
//! [`Error::Query`] instead of blocking the RPC call. No lock is held
//! across a device query; the snapshot read and the channel wait are
//! separate steps.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::command::VibrateCommand;
use crate::error::Error;
use crate::proto::DeviceRecord;
use crate::session::{Phase, SessionRequest, SessionState, TelemetryKind};

/// Handle to the device-control session, cheap to clone.
#[derive(Clone)]
pub struct DeviceDirectory {
    state: Arc<RwLock<SessionState>>,
    requests: mpsc::Sender<SessionRequest>,
    query_timeout: Duration,
}

impl DeviceDirectory {
    pub(crate) fn new(
        state: Arc<RwLock<SessionState>>,
        requests: mpsc::Sender<SessionRequest>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            state,
            requests,
            query_timeout,
        }
    }

    /// Current device snapshot, in the order the session learned of them.
    pub async fn list(&self) -> Vec<DeviceRecord> {
        self.state.read().await.devices.values().cloned().collect()
    }

    /// Look up a device by index. Indices are only valid while the device
    /// stays connected; after a disconnect this fails with NotFound.
    pub async fn resolve(&self, device_id: u32) -> Result<DeviceRecord, Error> {
        self.state
            .read()
            .await
            .devices
            .get(&device_id)
            .cloned()
            .ok_or(Error::NotFound(device_id))
    }

    /// Live RSSI query against the device.
    pub async fn signal_level(&self, device_id: u32) -> Result<f64, Error> {
        self.telemetry(device_id, TelemetryKind::Rssi).await
    }

    /// Live battery query against the device.
    pub async fn battery_level(&self, device_id: u32) -> Result<f64, Error> {
        self.telemetry(device_id, TelemetryKind::Battery).await
    }

    /// Hand a validated vibrate command to the session's debounce path.
    ///
    /// Callers must have validated the command and resolved the device
    /// first; this method re-checks both so a partially-validated command
    /// can never reach the device.
    pub async fn vibrate(&self, command: VibrateCommand) -> Result<(), Error> {
        self.ensure_ready().await?;
        let device = self.resolve(command.device_id).await?;
        if !device.supports("VibrateCmd") {
            return Err(Error::Query(format!(
                "device {} does not support VibrateCmd",
                command.device_id
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.submit(SessionRequest::Vibrate {
            device_index: command.device_id,
            motor: command.motor,
            speed: command.strength,
            reply: tx,
        })
        .await?;
        self.await_reply(rx).await?
    }

    async fn telemetry(&self, device_id: u32, kind: TelemetryKind) -> Result<f64, Error> {
        // Phase check comes first: when the session is not ready, fail
        // without submitting anything.
        self.ensure_ready().await?;
        let device = self.resolve(device_id).await?;

        let required = match kind {
            TelemetryKind::Rssi => "RSSILevelCmd",
            TelemetryKind::Battery => "BatteryLevelCmd",
        };
        if !device.supports(required) {
            return Err(Error::Query(format!(
                "device {device_id} does not support {required}"
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.submit(SessionRequest::Telemetry {
            device_index: device_id,
            kind,
            reply: tx,
        })
        .await?;
        self.await_reply(rx).await?
    }

    async fn ensure_ready(&self) -> Result<(), Error> {
        if self.state.read().await.phase == Phase::Ready {
            Ok(())
        } else {
            Err(Error::SessionNotReady)
        }
    }

    async fn submit(&self, request: SessionRequest) -> Result<(), Error> {
        self.requests
            .send(request)
            .await
            .map_err(|_| Error::SessionNotReady)
    }

    /// Wait for the session's reply, bounded by the query timeout. A
    /// dropped reply channel means the connection died mid-query.
    async fn await_reply<T>(
        &self,
        rx: oneshot::Receiver<Result<T, Error>>,
    ) -> Result<Result<T, Error>, Error> {
        match tokio::time::timeout(self.query_timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(Error::Query("session dropped mid-query".to_string())),
            Err(_) => Err(Error::Query(format!(
                "query timed out after {:?}",
                self.query_timeout
            ))),
        }
    }
}
