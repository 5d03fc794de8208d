//! Resource/tool surface and request dispatch.
//!
//! Registers the resource metadata served by `resources/list` and
//! `resources/templates/list`, the `device_vibrate` tool schema, and the
//! handlers behind them. Each handler is a thin composition: pattern match
//! → id parse → directory lookup → JSON shaping. Every failure is a typed
//! [`Error`] rendered by the transport; nothing here panics into it.
//!
//! | Path/Tool             | Method | Response shape                     |
//! |-----------------------|--------|------------------------------------|
//! | `/devices`            | read   | JSON array of device records       |
//! | `/device/:id`         | read   | JSON device record                 |
//! | `/device/:id/rssi`    | read   | `{"rssi_level": float}`            |
//! | `/device/:id/battery` | read   | `{"battery_level": float}`         |
//! | `device_vibrate`      | call   | `{"success": true}`                |

use serde_json::{json, Value};

use crate::command::VibrateCommand;
use crate::directory::DeviceDirectory;
use crate::error::Error;
use crate::pattern::extract_pattern;

pub const MIME_JSON: &str = "application/json";

const DEVICE_TEMPLATE: &str = "/device/:id";
const RSSI_TEMPLATE: &str = "/device/:id/rssi";
const BATTERY_TEMPLATE: &str = "/device/:id/battery";

/// Static resource definitions for `resources/list`.
pub fn resource_definitions() -> Vec<Value> {
    vec![json!({
        "uri": "/devices",
        "name": "Device List",
        "description": "List of connected haptic devices in JSON",
        "mimeType": MIME_JSON
    })]
}

/// Resource template definitions for `resources/templates/list`.
pub fn resource_template_definitions() -> Vec<Value> {
    vec![
        json!({
            "uriTemplate": "/device/{id}",
            "name": "Device Info by ID",
            "description": "Device information by device ID where `id` is a number from `/devices`",
            "mimeType": MIME_JSON
        }),
        json!({
            "uriTemplate": "/device/{id}/rssi",
            "name": "Signal Level for Device by ID",
            "description": "RSSI signal level by device ID where `id` is a number from `/devices`",
            "mimeType": MIME_JSON
        }),
        json!({
            "uriTemplate": "/device/{id}/battery",
            "name": "Battery Level for Device by ID",
            "description": "Battery level by device ID where `id` is a number from `/devices`",
            "mimeType": MIME_JSON
        }),
    ]
}

/// Tool definitions for `tools/list`.
pub fn tool_definitions() -> Vec<Value> {
    vec![json!({
        "name": "device_vibrate",
        "description": "Vibrates device by `id`, selecting `strength` and optional `motor`",
        "inputSchema": {
            "type": "object",
            "properties": {
                "id": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Device ID to actuate, sourced from `/devices`."
                },
                "strength": {
                    "type": "number",
                    "minimum": 0.0,
                    "maximum": 1.0,
                    "description": "Strength from 0.0 to 1.0, with 0.0 being off and 1.0 being full."
                },
                "motor": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Motor number to vibrate, defaults to 0."
                }
            },
            "required": ["id", "strength"],
            "additionalProperties": false
        }
    })]
}

/// Read a resource by URI, dispatching static paths and templates.
pub async fn read_resource(uri: &str, directory: &DeviceDirectory) -> Result<Value, Error> {
    if uri == "/devices" {
        let devices = directory.list().await;
        return serde_json::to_value(devices)
            .map_err(|e| Error::Query(format!("failed to serialize devices: {e}")));
    }

    if let Some(params) = extract_pattern(DEVICE_TEMPLATE, uri) {
        let device = directory.resolve(device_id(&params)?).await?;
        return serde_json::to_value(device)
            .map_err(|e| Error::Query(format!("failed to serialize device: {e}")));
    }

    if let Some(params) = extract_pattern(RSSI_TEMPLATE, uri) {
        let level = directory.signal_level(device_id(&params)?).await?;
        return Ok(json!({ "rssi_level": level }));
    }

    if let Some(params) = extract_pattern(BATTERY_TEMPLATE, uri) {
        let level = directory.battery_level(device_id(&params)?).await?;
        return Ok(json!({ "battery_level": level }));
    }

    Err(Error::Path(format!("no resource matches '{uri}'")))
}

/// Parse the `:id` capture into a device index.
fn device_id(params: &indexmap::IndexMap<String, String>) -> Result<u32, Error> {
    let raw = params
        .get("id")
        .ok_or_else(|| Error::Path("device id not found in path".to_string()))?;
    raw.parse::<u32>()
        .map_err(|_| Error::Path(format!("device id '{raw}' is not a non-negative integer")))
}

/// Result of a tool call, ready for the JSON-RPC layer.
pub struct ToolResult {
    /// MCP content blocks (a single `{"type":"text","text":"..."}` entry).
    pub content: Vec<Value>,
    /// Maps to `isError` in the MCP response.
    pub is_error: bool,
}

impl ToolResult {
    fn success(value: Value) -> Self {
        let text = serde_json::to_string_pretty(&value).unwrap_or_default();
        Self {
            content: vec![json!({ "type": "text", "text": text })],
            is_error: false,
        }
    }

    fn error(message: String) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": message })],
            is_error: true,
        }
    }
}

/// Dispatch a `tools/call` request.
pub async fn handle_tool_call(name: &str, args: &Value, directory: &DeviceDirectory) -> ToolResult {
    match name {
        "device_vibrate" => handle_device_vibrate(args, directory).await,
        _ => ToolResult::error(format!("Unknown tool: {name}")),
    }
}

async fn handle_device_vibrate(args: &Value, directory: &DeviceDirectory) -> ToolResult {
    // Validation happens before any device I/O; the command only reaches
    // the session once the handle also resolves.
    let command = match VibrateCommand::validate(args) {
        Ok(c) => c,
        Err(e) => return ToolResult::error(e.to_string()),
    };

    match directory.vibrate(command).await {
        Ok(()) => ToolResult::success(json!({ "success": true })),
        Err(e) => ToolResult::error(e.to_string()),
    }
}
