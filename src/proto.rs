//! Serde codec for the Buttplug JSON wire messages the session uses.
//!
//! The Buttplug protocol frames every WebSocket text message as a JSON array
//! of externally-tagged, PascalCase-keyed messages, e.g.
//! `[{"RequestServerInfo":{"Id":1,"ClientName":"mcp-haptic","MessageVersion":2}}]`.
//! Only the message-version-2 subset this server sends and receives is
//! modelled; unknown incoming message types are skipped, not errors.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Protocol message version spoken in the `RequestServerInfo` handshake.
pub const MESSAGE_VERSION: u32 = 2;

/// Messages sent to the Buttplug server.
#[derive(Debug, Clone, Serialize)]
pub enum Outgoing {
    RequestServerInfo(RequestServerInfo),
    StartScanning(IdOnly),
    RequestDeviceList(IdOnly),
    VibrateCmd(VibrateCmd),
    BatteryLevelCmd(DeviceCmd),
    #[serde(rename = "RSSILevelCmd")]
    RssiLevelCmd(DeviceCmd),
    Ping(IdOnly),
}

/// Messages received from the Buttplug server.
#[derive(Debug, Clone, Deserialize)]
pub enum Incoming {
    Ok(IdOnly),
    Error(ServerError),
    ServerInfo(ServerInfo),
    DeviceList(DeviceList),
    DeviceAdded(DeviceRecord),
    DeviceRemoved(DeviceRemoved),
    ScanningFinished(IdOnly),
    BatteryLevelReading(BatteryLevelReading),
    #[serde(rename = "RSSILevelReading")]
    RssiLevelReading(RssiLevelReading),
}

impl Incoming {
    /// Message id used for request/reply correlation. Server-initiated
    /// events carry id 0.
    pub fn id(&self) -> u32 {
        match self {
            Incoming::Ok(m) | Incoming::ScanningFinished(m) => m.id,
            Incoming::Error(m) => m.id,
            Incoming::ServerInfo(m) => m.id,
            Incoming::DeviceList(m) => m.id,
            Incoming::DeviceAdded(m) => m.id,
            Incoming::DeviceRemoved(m) => m.id,
            Incoming::BatteryLevelReading(m) => m.id,
            Incoming::RssiLevelReading(m) => m.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdOnly {
    pub id: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestServerInfo {
    pub id: u32,
    pub client_name: String,
    pub message_version: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerInfo {
    pub id: u32,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub message_version: u32,
    /// Max milliseconds between client pings; 0 disables the requirement.
    #[serde(default)]
    pub max_ping_time: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerError {
    pub id: u32,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub error_code: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceList {
    pub id: u32,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

/// A connected device as reported by the server. Read-only to this layer;
/// refreshed on add/remove events. Serialized as-is (PascalCase wire names)
/// in resource responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRecord {
    #[serde(default)]
    pub id: u32,
    pub device_index: u32,
    pub device_name: String,
    /// Capability descriptors, keyed by command message name
    /// (e.g. `VibrateCmd` → feature count).
    #[serde(default)]
    pub device_messages: IndexMap<String, MessageAttributes>,
}

impl DeviceRecord {
    /// Whether the device advertises support for `message` (e.g. `VibrateCmd`).
    pub fn supports(&self, message: &str) -> bool {
        self.device_messages.contains_key(message)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_count: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRemoved {
    pub id: u32,
    pub device_index: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceCmd {
    pub id: u32,
    pub device_index: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VibrateCmd {
    pub id: u32,
    pub device_index: u32,
    pub speeds: Vec<Speed>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Speed {
    pub index: u32,
    pub speed: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatteryLevelReading {
    pub id: u32,
    pub device_index: u32,
    pub battery_level: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RssiLevelReading {
    pub id: u32,
    pub device_index: u32,
    #[serde(rename = "RSSILevel")]
    pub rssi_level: f64,
}

/// Frame outgoing messages as one wire text payload (a JSON array).
pub fn encode(messages: &[Outgoing]) -> String {
    serde_json::to_string(messages).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a wire text payload into the messages we understand.
///
/// Unknown message types are skipped with a debug log — newer servers send
/// messages this subset does not model.
pub fn parse_incoming(text: &str) -> Vec<Incoming> {
    let elements: Vec<serde_json::Value> = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable buttplug frame");
            return Vec::new();
        }
    };

    elements
        .into_iter()
        .filter_map(|element| match serde_json::from_value::<Incoming>(element.clone()) {
            Ok(msg) => Some(msg),
            Err(_) => {
                tracing::debug!(%element, "skipping unrecognized buttplug message");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_encodes_to_wire_shape() {
        let text = encode(&[Outgoing::RequestServerInfo(RequestServerInfo {
            id: 1,
            client_name: "mcp-haptic".into(),
            message_version: MESSAGE_VERSION,
        })]);
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v[0]["RequestServerInfo"]["Id"], 1);
        assert_eq!(v[0]["RequestServerInfo"]["ClientName"], "mcp-haptic");
        assert_eq!(v[0]["RequestServerInfo"]["MessageVersion"], 2);
    }

    #[test]
    fn vibrate_cmd_encodes_speeds() {
        let text = encode(&[Outgoing::VibrateCmd(VibrateCmd {
            id: 9,
            device_index: 3,
            speeds: vec![Speed { index: 0, speed: 0.5 }],
        })]);
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v[0]["VibrateCmd"]["DeviceIndex"], 3);
        assert_eq!(v[0]["VibrateCmd"]["Speeds"][0]["Index"], 0);
        assert_eq!(v[0]["VibrateCmd"]["Speeds"][0]["Speed"], 0.5);
    }

    #[test]
    fn rssi_cmd_uses_uppercase_tag() {
        let text = encode(&[Outgoing::RssiLevelCmd(DeviceCmd {
            id: 2,
            device_index: 1,
        })]);
        assert!(text.contains("\"RSSILevelCmd\""));
    }

    #[test]
    fn parses_device_added() {
        let msgs = parse_incoming(
            r#"[{"DeviceAdded":{"Id":0,"DeviceIndex":4,"DeviceName":"Test Vibe",
                "DeviceMessages":{"VibrateCmd":{"FeatureCount":2},"StopDeviceCmd":{}}}}]"#,
        );
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            Incoming::DeviceAdded(d) => {
                assert_eq!(d.device_index, 4);
                assert_eq!(d.device_name, "Test Vibe");
                assert_eq!(d.device_messages["VibrateCmd"].feature_count, Some(2));
                assert!(d.supports("StopDeviceCmd"));
                assert!(!d.supports("BatteryLevelCmd"));
            }
            other => panic!("expected DeviceAdded, got {other:?}"),
        }
    }

    #[test]
    fn parses_rssi_reading_and_correlation_id() {
        let msgs = parse_incoming(
            r#"[{"RSSILevelReading":{"Id":17,"DeviceIndex":4,"RSSILevel":-40.0}}]"#,
        );
        match &msgs[0] {
            Incoming::RssiLevelReading(r) => {
                assert_eq!(r.rssi_level, -40.0);
                assert_eq!(msgs[0].id(), 17);
            }
            other => panic!("expected RSSILevelReading, got {other:?}"),
        }
    }

    #[test]
    fn unknown_messages_are_skipped() {
        let msgs = parse_incoming(
            r#"[{"SensorReading":{"Id":1}},{"Ok":{"Id":5}}]"#,
        );
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id(), 5);
    }

    #[test]
    fn garbage_frame_yields_no_messages() {
        assert!(parse_incoming("not json").is_empty());
        assert!(parse_incoming("{}").is_empty());
    }

    #[test]
    fn device_record_serializes_wire_names() {
        let record = DeviceRecord {
            id: 0,
            device_index: 7,
            device_name: "Vibe".into(),
            device_messages: IndexMap::new(),
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["DeviceIndex"], 7);
        assert_eq!(v["DeviceName"], "Vibe");
    }
}
