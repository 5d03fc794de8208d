//! MCP (Model Context Protocol) JSON-RPC handler.
//!
//! Implements the [MCP specification](https://spec.modelcontextprotocol.io/)
//! request dispatch shared by both transports, plus the stdio transport —
//! JSON-RPC 2.0 requests from stdin (one per line), responses to stdout.
//!
//! ## Supported methods
//!
//! | Method                     | Description                        |
//! |----------------------------|------------------------------------|
//! | `initialize`               | Handshake, returns capabilities    |
//! | `resources/list`           | Static resource definitions        |
//! | `resources/templates/list` | Resource template definitions      |
//! | `resources/read`           | Read a resource by URI             |
//! | `tools/list`               | List available tool definitions    |
//! | `tools/call`               | Execute a tool and return result   |
//! | `ping`                     | Liveness check                     |
//!
//! Notifications (`notifications/initialized`, `notifications/cancelled`)
//! are acknowledged silently.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error};

use crate::directory::DeviceDirectory;
use crate::router;

const SERVER_NAME: &str = "mcp-haptic";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Everything a transport needs to serve MCP requests.
#[derive(Clone)]
pub struct McpContext {
    pub directory: DeviceDirectory,
}

impl McpContext {
    pub fn new(directory: DeviceDirectory) -> Self {
        Self { directory }
    }

    /// Dispatch one JSON-RPC request. Returns `None` for notifications
    /// (which get no response).
    pub async fn dispatch(&self, request: &Value) -> Option<Value> {
        let id = request.get("id").cloned();
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");

        // Notifications (no id) — acknowledge silently
        if id.is_none() {
            match method {
                "notifications/initialized" | "notifications/cancelled" => {}
                _ => debug!(method, "unknown notification"),
            }
            return None;
        }

        let response = match method {
            "initialize" => handle_initialize(),
            "resources/list" => json!({
                "jsonrpc": "2.0",
                "result": { "resources": router::resource_definitions() }
            }),
            "resources/templates/list" => json!({
                "jsonrpc": "2.0",
                "result": { "resourceTemplates": router::resource_template_definitions() }
            }),
            "resources/read" => self.handle_resources_read(request).await,
            "tools/list" => json!({
                "jsonrpc": "2.0",
                "result": { "tools": router::tool_definitions() }
            }),
            "tools/call" => self.handle_tools_call(request).await,
            "ping" => json!({ "jsonrpc": "2.0", "result": {} }),
            _ => json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": -32601,
                    "message": format!("Method not found: {method}")
                }
            }),
        };

        Some(inject_id(response, id))
    }

    /// Handle `resources/read` — dispatch the URI through the router and
    /// wrap the payload in MCP resource contents.
    async fn handle_resources_read(&self, request: &Value) -> Value {
        let uri = request
            .get("params")
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .unwrap_or("");

        match router::read_resource(uri, &self.directory).await {
            Ok(payload) => {
                let text = serde_json::to_string(&payload).unwrap_or_default();
                json!({
                    "jsonrpc": "2.0",
                    "result": {
                        "contents": [{
                            "uri": uri,
                            "mimeType": router::MIME_JSON,
                            "text": text
                        }]
                    }
                })
            }
            Err(e) => json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": -32002,
                    "message": e.to_string()
                }
            }),
        }
    }

    /// Handle `tools/call` — dispatch to the tool handler.
    async fn handle_tools_call(&self, request: &Value) -> Value {
        let params = request.get("params").cloned().unwrap_or(json!({}));
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        let result = router::handle_tool_call(name, &args, &self.directory).await;

        let mut response_result = json!({ "content": result.content });
        if result.is_error {
            response_result["isError"] = json!(true);
        }

        json!({ "jsonrpc": "2.0", "result": response_result })
    }
}

/// Run the MCP server on stdio, processing requests until EOF.
pub async fn run_stdio(ctx: McpContext) {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "stdin read error");
                break;
            }
        }

        if let Some(response) = handle_line(&ctx, &line).await {
            write_response(&mut stdout, &response).await;
        }
    }
}

/// Process one stdio line. Unparseable input answers with -32700 and a
/// null id; blank lines and notifications produce nothing.
async fn handle_line(ctx: &McpContext, line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let request: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {
                    "code": -32700,
                    "message": format!("Parse error: {e}")
                }
            }));
        }
    };

    ctx.dispatch(&request).await
}

fn handle_initialize() -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "resources": {},
                "tools": {}
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": SERVER_VERSION
            }
        }
    })
}

/// Inject the request `id` into a response object.
fn inject_id(mut response: Value, id: Option<Value>) -> Value {
    if let Some(id) = id {
        response["id"] = id;
    }
    response
}

/// Write a JSON-RPC response to stdout (one line, flushed immediately).
async fn write_response(stdout: &mut tokio::io::Stdout, response: &Value) {
    let mut output = serde_json::to_string(response).unwrap_or_default();
    output.push('\n');
    if let Err(e) = stdout.write_all(output.as_bytes()).await {
        error!(error = %e, "stdout write error");
    }
    if let Err(e) = stdout.flush().await {
        error!(error = %e, "stdout flush error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::testing::{device, directory_with};
    use crate::session::{Phase, SessionRequest};

    fn test_context() -> McpContext {
        let directory = directory_with(
            Phase::Ready,
            vec![device(7, "Vibe", &["VibrateCmd", "RSSILevelCmd"])],
            |req| match req {
                SessionRequest::Telemetry { reply, .. } => {
                    let _ = reply.send(Ok(-40.0));
                }
                SessionRequest::Vibrate { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
            },
        );
        McpContext::new(directory)
    }

    #[tokio::test]
    async fn initialize_reports_capabilities() {
        let ctx = test_context();
        let response = ctx
            .dispatch(&json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }))
            .await
            .unwrap();
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(response["result"]["serverInfo"]["name"], "mcp-haptic");
        assert!(response["result"]["capabilities"].get("resources").is_some());
        assert!(response["result"]["capabilities"].get("tools").is_some());
    }

    #[tokio::test]
    async fn resources_read_wraps_payload_in_contents() {
        let ctx = test_context();
        let response = ctx
            .dispatch(&json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "resources/read",
                "params": { "uri": "/device/7/rssi" }
            }))
            .await
            .unwrap();
        let contents = &response["result"]["contents"][0];
        assert_eq!(contents["uri"], "/device/7/rssi");
        assert_eq!(contents["mimeType"], "application/json");
        let payload: Value = serde_json::from_str(contents["text"].as_str().unwrap()).unwrap();
        assert_eq!(payload, json!({ "rssi_level": -40.0 }));
    }

    #[tokio::test]
    async fn resources_read_error_carries_message() {
        let ctx = test_context();
        let response = ctx
            .dispatch(&json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "resources/read",
                "params": { "uri": "/device/42" }
            }))
            .await
            .unwrap();
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("not found"));
    }

    #[tokio::test]
    async fn tools_call_success() {
        let ctx = test_context();
        let response = ctx
            .dispatch(&json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": { "name": "device_vibrate", "arguments": { "id": 7, "strength": 0.5 } }
            }))
            .await
            .unwrap();
        assert!(response["result"].get("isError").is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_minus_32601() {
        let ctx = test_context();
        let response = ctx
            .dispatch(&json!({ "jsonrpc": "2.0", "id": 5, "method": "bogus" }))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let ctx = test_context();
        let response = ctx
            .dispatch(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn unparseable_line_answers_minus_32700() {
        let ctx = test_context();
        let response = handle_line(&ctx, "{not json}\n").await.unwrap();
        assert_eq!(response["error"]["code"], -32700);
        assert_eq!(response["id"], Value::Null);
    }

    #[tokio::test]
    async fn blank_lines_produce_no_response() {
        let ctx = test_context();
        assert!(handle_line(&ctx, "   \n").await.is_none());
    }

    #[tokio::test]
    async fn parseable_line_is_dispatched() {
        let ctx = test_context();
        let response = handle_line(&ctx, r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(response["id"], 9);
    }

    #[tokio::test]
    async fn resource_listings_expose_the_full_surface() {
        let ctx = test_context();
        let resources = ctx
            .dispatch(&json!({ "jsonrpc": "2.0", "id": 6, "method": "resources/list" }))
            .await
            .unwrap();
        assert_eq!(resources["result"]["resources"][0]["uri"], "/devices");

        let templates = ctx
            .dispatch(&json!({ "jsonrpc": "2.0", "id": 7, "method": "resources/templates/list" }))
            .await
            .unwrap();
        let list = templates["result"]["resourceTemplates"].as_array().unwrap();
        assert_eq!(list.len(), 3);

        let tools = ctx
            .dispatch(&json!({ "jsonrpc": "2.0", "id": 8, "method": "tools/list" }))
            .await
            .unwrap();
        assert_eq!(tools["result"]["tools"][0]["name"], "device_vibrate");
    }
}
