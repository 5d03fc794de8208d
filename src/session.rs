//! Background device-control session.
//!
//! [`Session::run`] owns the WebSocket connection to the Buttplug server and
//! drives an explicit state machine:
//!
//! ```text
//! Disconnected ──dial──▶ Connecting ──ServerInfo──▶ Ready
//!       ▲                                             │
//!       └───────────── connection drop ───────────────┘
//! ```
//!
//! Once Ready it starts scanning, asks for the device list, and keeps the
//! shared device directory current from `DeviceAdded`/`DeviceRemoved`
//! events, logging each one. Request handlers never touch the socket —
//! they submit [`SessionRequest`]s over a channel and the session task
//! correlates replies by message id.
//!
//! Vibrate commands to the same device/motor inside the debounce window are
//! coalesced: the latest value replaces a pending slot that a timer tick
//! flushes, so rapid repeated calls cannot flood the device.
//!
//! On disconnect the directory is cleared (stale handles must fail with
//! NotFound), pending replies are dropped, and the task reconnects with
//! exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::directory::DeviceDirectory;
use crate::error::Error;
use crate::proto::{self, DeviceRecord, Incoming, Outgoing, Speed};

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_DELAY_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Connection lifecycle phase, readable by handlers at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Ready,
}

/// Shared session state: the current phase and the device directory
/// snapshot. Handlers hold read access; only the session task writes.
pub struct SessionState {
    pub phase: Phase,
    pub devices: IndexMap<u32, DeviceRecord>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: Phase::Disconnected,
            devices: IndexMap::new(),
        }
    }
}

/// Which telemetry value a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryKind {
    Rssi,
    Battery,
}

/// A request submitted by a handler to the session task.
pub enum SessionRequest {
    Telemetry {
        device_index: u32,
        kind: TelemetryKind,
        reply: oneshot::Sender<Result<f64, Error>>,
    },
    Vibrate {
        device_index: u32,
        motor: u32,
        speed: f64,
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

/// Session tuning knobs, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Port of the Buttplug/Intiface WebSocket server on localhost.
    pub ws_port: u16,
    /// Debounce window for vibrate coalescing. Zero disables coalescing.
    pub debounce: Duration,
    /// Upper bound for a single device query before it fails with QueryError.
    pub query_timeout: Duration,
}

/// The background session task. Created together with its
/// [`DeviceDirectory`] facade; consumed by [`Session::run`].
pub struct Session {
    config: SessionConfig,
    state: Arc<RwLock<SessionState>>,
    requests: mpsc::Receiver<SessionRequest>,
}

impl Session {
    /// Build a session and the directory handle request handlers use.
    pub fn new(config: SessionConfig) -> (Self, DeviceDirectory) {
        let state = Arc::new(RwLock::new(SessionState::new()));
        let (tx, rx) = mpsc::channel(64);
        let directory = DeviceDirectory::new(Arc::clone(&state), tx, config.query_timeout);
        let session = Self {
            config,
            state,
            requests: rx,
        };
        (session, directory)
    }

    /// Connect-and-serve loop. Returns when `shutdown` fires or every
    /// directory handle has been dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let url = format!("ws://127.0.0.1:{}", self.config.ws_port);
        let mut delay = RECONNECT_DELAY_INITIAL;

        loop {
            self.set_phase(Phase::Connecting).await;
            debug!(%url, "dialing buttplug server");

            let dialed = tokio::select! {
                r = tokio::time::timeout(DIAL_TIMEOUT, tokio_tungstenite::connect_async(&url)) => r,
                _ = shutdown.changed() => return,
            };

            match dialed {
                Ok(Ok((ws_stream, _))) => {
                    info!(%url, "buttplug connection established");
                    delay = RECONNECT_DELAY_INITIAL;
                    match self.serve_connection(ws_stream, &mut shutdown).await {
                        ServeExit::Shutdown => return,
                        ServeExit::ConnectionLost => {
                            warn!("buttplug connection lost, reconnecting");
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "buttplug connect failed, retrying in {delay:?}");
                }
                Err(_) => {
                    debug!("buttplug connect timed out, retrying in {delay:?}");
                }
            }

            self.reset_disconnected().await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            delay = (delay * 2).min(RECONNECT_DELAY_MAX);
        }
    }

    /// Serve one established connection until it drops or shutdown fires.
    async fn serve_connection(
        &mut self,
        ws_stream: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ServeExit {
        let (mut sink, mut reader) = ws_stream.split();
        let mut ids = MessageIds::new();
        let mut pending: HashMap<u32, PendingReply> = HashMap::new();
        let mut coalescer = VibrateCoalescer::new(self.config.debounce);
        let mut flush_interval = optional_interval(self.config.debounce);
        let mut ping_interval: Option<Interval> = None;

        // Handshake first; the server answers with ServerInfo.
        let handshake = proto::encode(&[Outgoing::RequestServerInfo(proto::RequestServerInfo {
            id: ids.next(),
            client_name: "mcp-haptic".to_string(),
            message_version: proto::MESSAGE_VERSION,
        })]);
        if sink.send(Message::Text(handshake)).await.is_err() {
            return ServeExit::ConnectionLost;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => return ServeExit::Shutdown,

                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for incoming in proto::parse_incoming(&text) {
                                self.handle_incoming(
                                    incoming,
                                    &mut sink,
                                    &mut ids,
                                    &mut pending,
                                    &mut ping_interval,
                                ).await;
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            return ServeExit::ConnectionLost;
                        }
                        _ => {} // Binary/Ping/Pong — ignore
                    }
                }

                req = self.requests.recv() => {
                    match req {
                        Some(request) => {
                            if !self.handle_request(
                                request,
                                &mut sink,
                                &mut ids,
                                &mut pending,
                                &mut coalescer,
                            ).await {
                                return ServeExit::ConnectionLost;
                            }
                        }
                        // All directory handles dropped — nothing left to serve.
                        None => return ServeExit::Shutdown,
                    }
                }

                _ = tick(&mut flush_interval) => {
                    sweep_closed(&mut pending);
                    for (device_index, speeds) in coalescer.drain_due(Instant::now()) {
                        let frame = proto::encode(&[Outgoing::VibrateCmd(proto::VibrateCmd {
                            id: ids.next(),
                            device_index,
                            speeds,
                        })]);
                        if sink.send(Message::Text(frame)).await.is_err() {
                            return ServeExit::ConnectionLost;
                        }
                    }
                }

                _ = tick(&mut ping_interval) => {
                    let frame = proto::encode(&[Outgoing::Ping(proto::IdOnly { id: ids.next() })]);
                    if sink.send(Message::Text(frame)).await.is_err() {
                        return ServeExit::ConnectionLost;
                    }
                }
            }
        }
    }

    /// React to one server message: drive the state machine, keep the
    /// directory current, and complete correlated replies.
    async fn handle_incoming(
        &self,
        incoming: Incoming,
        sink: &mut WsSink,
        ids: &mut MessageIds,
        pending: &mut HashMap<u32, PendingReply>,
        ping_interval: &mut Option<Interval>,
    ) {
        match incoming {
            Incoming::ServerInfo(server_info) => {
                info!(
                    server = %server_info.server_name,
                    message_version = server_info.message_version,
                    "buttplug server ready"
                );
                self.set_phase(Phase::Ready).await;
                if server_info.max_ping_time > 0 {
                    let period = Duration::from_millis((server_info.max_ping_time / 2).max(1));
                    *ping_interval = Some(tokio::time::interval(period));
                }
                // Start scanning and ask for the current list; the event
                // stream keeps the directory up to date from here.
                let frame = proto::encode(&[
                    Outgoing::StartScanning(proto::IdOnly { id: ids.next() }),
                    Outgoing::RequestDeviceList(proto::IdOnly { id: ids.next() }),
                ]);
                if sink.send(Message::Text(frame)).await.is_err() {
                    warn!("failed to send scan request");
                }
            }
            Incoming::DeviceList(list) => {
                let mut state = self.state.write().await;
                state.devices.clear();
                for device in list.devices {
                    info!(name = %device.device_name, index = device.device_index, "listed device");
                    state.devices.insert(device.device_index, device);
                }
            }
            Incoming::DeviceAdded(device) => {
                info!(name = %device.device_name, index = device.device_index, "added device");
                let mut state = self.state.write().await;
                state.devices.insert(device.device_index, device);
            }
            Incoming::DeviceRemoved(removed) => {
                info!(index = removed.device_index, "removed device");
                let mut state = self.state.write().await;
                state.devices.shift_remove(&removed.device_index);
            }
            Incoming::Ok(ok) => {
                if let Some(PendingReply::Vibrate(reply)) = pending.remove(&ok.id) {
                    let _ = reply.send(Ok(()));
                }
            }
            Incoming::Error(err) => {
                match pending.remove(&err.id) {
                    Some(PendingReply::Telemetry(reply)) => {
                        let _ = reply.send(Err(Error::Query(err.error_message)));
                    }
                    Some(PendingReply::Vibrate(reply)) => {
                        let _ = reply.send(Err(Error::Query(err.error_message)));
                    }
                    // Unsolicited server error — belongs to the session's
                    // lifecycle, so log it instead of failing any RPC call.
                    None => error!(
                        code = err.error_code,
                        message = %err.error_message,
                        "buttplug server error"
                    ),
                }
            }
            Incoming::BatteryLevelReading(reading) => {
                if let Some(PendingReply::Telemetry(reply)) = pending.remove(&reading.id) {
                    let _ = reply.send(Ok(reading.battery_level));
                }
            }
            Incoming::RssiLevelReading(reading) => {
                if let Some(PendingReply::Telemetry(reply)) = pending.remove(&reading.id) {
                    let _ = reply.send(Ok(reading.rssi_level));
                }
            }
            Incoming::ScanningFinished(_) => {
                debug!("scanning finished");
            }
        }
    }

    /// Dispatch one handler request. Returns false when the socket died.
    async fn handle_request(
        &self,
        request: SessionRequest,
        sink: &mut WsSink,
        ids: &mut MessageIds,
        pending: &mut HashMap<u32, PendingReply>,
        coalescer: &mut VibrateCoalescer,
    ) -> bool {
        sweep_closed(pending);
        let ready = self.state.read().await.phase == Phase::Ready;

        match request {
            SessionRequest::Telemetry {
                device_index,
                kind,
                reply,
            } => {
                if !ready {
                    let _ = reply.send(Err(Error::SessionNotReady));
                    return true;
                }
                let id = ids.next();
                let cmd = proto::DeviceCmd { id, device_index };
                let frame = proto::encode(&[match kind {
                    TelemetryKind::Rssi => Outgoing::RssiLevelCmd(cmd),
                    TelemetryKind::Battery => Outgoing::BatteryLevelCmd(cmd),
                }]);
                pending.insert(id, PendingReply::Telemetry(reply));
                if sink.send(Message::Text(frame)).await.is_err() {
                    pending.remove(&id);
                    return false;
                }
                true
            }
            SessionRequest::Vibrate {
                device_index,
                motor,
                speed,
                reply,
            } => {
                if !ready {
                    let _ = reply.send(Err(Error::SessionNotReady));
                    return true;
                }
                match coalescer.offer(device_index, motor, speed, Instant::now()) {
                    Disposition::SendNow => {
                        let id = ids.next();
                        let frame = proto::encode(&[Outgoing::VibrateCmd(proto::VibrateCmd {
                            id,
                            device_index,
                            speeds: vec![Speed {
                                index: motor,
                                speed,
                            }],
                        })]);
                        pending.insert(id, PendingReply::Vibrate(reply));
                        if sink.send(Message::Text(frame)).await.is_err() {
                            pending.remove(&id);
                            return false;
                        }
                    }
                    Disposition::Coalesced => {
                        // The flush tick owns the send; accepting the command
                        // is the result the caller gets.
                        let _ = reply.send(Ok(()));
                    }
                }
                true
            }
        }
    }

    async fn set_phase(&self, phase: Phase) {
        self.state.write().await.phase = phase;
    }

    /// Drop back to Disconnected and clear the directory so stale handles
    /// resolve to NotFound.
    async fn reset_disconnected(&self) {
        let mut state = self.state.write().await;
        state.phase = Phase::Disconnected;
        state.devices.clear();
    }
}

enum ServeExit {
    Shutdown,
    ConnectionLost,
}

/// A reply channel waiting on a correlated server message.
enum PendingReply {
    Telemetry(oneshot::Sender<Result<f64, Error>>),
    Vibrate(oneshot::Sender<Result<(), Error>>),
}

impl PendingReply {
    fn is_closed(&self) -> bool {
        match self {
            PendingReply::Telemetry(tx) => tx.is_closed(),
            PendingReply::Vibrate(tx) => tx.is_closed(),
        }
    }
}

/// Drop correlation entries whose caller has stopped waiting, so a server
/// that stays connected but never answers cannot accumulate them.
fn sweep_closed(pending: &mut HashMap<u32, PendingReply>) {
    pending.retain(|_, reply| !reply.is_closed());
}

/// Wrapping message-id allocator; id 0 is reserved for server events.
struct MessageIds(u32);

impl MessageIds {
    fn new() -> Self {
        Self(0)
    }

    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_add(1);
        if self.0 == 0 {
            self.0 = 1;
        }
        self.0
    }
}

/// What to do with an offered vibrate command.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    SendNow,
    Coalesced,
}

/// Per device/motor debounce of vibrate commands.
///
/// A command arriving within `window` of the last send for the same
/// device/motor replaces the pending value; [`VibrateCoalescer::drain_due`]
/// hands back pending commands whose window has elapsed, grouped per device.
struct VibrateCoalescer {
    window: Duration,
    last_sent: HashMap<(u32, u32), Instant>,
    pending: HashMap<(u32, u32), f64>,
}

impl VibrateCoalescer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn offer(&mut self, device: u32, motor: u32, speed: f64, now: Instant) -> Disposition {
        if self.window.is_zero() {
            return Disposition::SendNow;
        }
        let key = (device, motor);
        match self.last_sent.get(&key) {
            Some(sent) if now.duration_since(*sent) < self.window => {
                self.pending.insert(key, speed);
                Disposition::Coalesced
            }
            _ => {
                self.last_sent.insert(key, now);
                Disposition::SendNow
            }
        }
    }

    /// Pending commands whose debounce window has elapsed, grouped per
    /// device and ready to send as one `VibrateCmd` each.
    fn drain_due(&mut self, now: Instant) -> Vec<(u32, Vec<Speed>)> {
        let due: Vec<(u32, u32)> = self
            .pending
            .keys()
            .filter(|key| match self.last_sent.get(key) {
                Some(sent) => now.duration_since(*sent) >= self.window,
                None => true,
            })
            .copied()
            .collect();

        let mut grouped: IndexMap<u32, Vec<Speed>> = IndexMap::new();
        for key @ (device, motor) in due {
            if let Some(speed) = self.pending.remove(&key) {
                self.last_sent.insert(key, now);
                grouped
                    .entry(device)
                    .or_default()
                    .push(Speed { index: motor, speed });
            }
        }
        grouped.into_iter().collect()
    }
}

/// Interval that ticks every `period`, or `None` when `period` is zero.
fn optional_interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        None
    } else {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Some(interval)
    }
}

/// Await the next tick of an optional interval; never resolves for `None`.
async fn tick(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(50);

    #[test]
    fn first_command_sends_immediately() {
        let mut c = VibrateCoalescer::new(WINDOW);
        assert_eq!(c.offer(1, 0, 0.5, Instant::now()), Disposition::SendNow);
    }

    #[test]
    fn rapid_repeat_is_coalesced_and_keeps_latest() {
        let mut c = VibrateCoalescer::new(WINDOW);
        let t0 = Instant::now();
        assert_eq!(c.offer(1, 0, 0.2, t0), Disposition::SendNow);
        assert_eq!(c.offer(1, 0, 0.4, t0 + Duration::from_millis(10)), Disposition::Coalesced);
        assert_eq!(c.offer(1, 0, 0.9, t0 + Duration::from_millis(20)), Disposition::Coalesced);

        // Nothing due inside the window.
        assert!(c.drain_due(t0 + Duration::from_millis(30)).is_empty());

        let due = c.drain_due(t0 + WINDOW);
        assert_eq!(due.len(), 1);
        let (device, speeds) = &due[0];
        assert_eq!(*device, 1);
        assert_eq!(speeds.len(), 1);
        assert_eq!(speeds[0].index, 0);
        assert_eq!(speeds[0].speed, 0.9);
    }

    #[test]
    fn different_devices_do_not_debounce_each_other() {
        let mut c = VibrateCoalescer::new(WINDOW);
        let t0 = Instant::now();
        assert_eq!(c.offer(1, 0, 0.5, t0), Disposition::SendNow);
        assert_eq!(c.offer(2, 0, 0.5, t0), Disposition::SendNow);
        assert_eq!(c.offer(1, 1, 0.5, t0), Disposition::SendNow);
    }

    #[test]
    fn zero_window_disables_coalescing() {
        let mut c = VibrateCoalescer::new(Duration::ZERO);
        let t0 = Instant::now();
        assert_eq!(c.offer(1, 0, 0.2, t0), Disposition::SendNow);
        assert_eq!(c.offer(1, 0, 0.4, t0), Disposition::SendNow);
    }

    #[test]
    fn flush_restarts_the_window() {
        let mut c = VibrateCoalescer::new(WINDOW);
        let t0 = Instant::now();
        c.offer(1, 0, 0.2, t0);
        c.offer(1, 0, 0.4, t0 + Duration::from_millis(10));
        let due = c.drain_due(t0 + WINDOW);
        assert_eq!(due.len(), 1);

        // Right after a flush the window applies again.
        assert_eq!(
            c.offer(1, 0, 0.6, t0 + WINDOW + Duration::from_millis(1)),
            Disposition::Coalesced
        );
    }

    #[test]
    fn sweep_drops_only_abandoned_replies() {
        let mut pending = HashMap::new();

        let (live_tx, _live_rx) = oneshot::channel();
        pending.insert(1, PendingReply::Telemetry(live_tx));

        let (dead_tx, dead_rx) = oneshot::channel::<Result<f64, Error>>();
        drop(dead_rx);
        pending.insert(2, PendingReply::Telemetry(dead_tx));

        sweep_closed(&mut pending);
        assert!(pending.contains_key(&1));
        assert!(!pending.contains_key(&2));
    }

    #[test]
    fn message_ids_skip_zero() {
        let mut ids = MessageIds::new();
        assert_eq!(ids.next(), 1);
        ids.0 = u32::MAX;
        assert_eq!(ids.next(), 1);
    }
}
