//! SSE network transport.
//!
//! The streaming alternative to stdio: `GET /sse` opens an event stream
//! whose first event announces the client's message endpoint
//! (`/message?sessionId=<uuid>`); subsequent `message` events carry
//! JSON-RPC responses. Clients submit requests with
//! `POST /message?sessionId=<uuid>`; dispatch is shared with the stdio
//! transport via [`McpContext`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
struct SseState {
    ctx: crate::mcp::McpContext,
    /// Response channels for connected SSE clients, keyed by session id.
    clients: Arc<Mutex<HashMap<String, mpsc::Sender<Value>>>>,
}

/// Serve the SSE transport on `host_port` until `shutdown` fires.
pub async fn run_sse(
    host_port: &str,
    ctx: crate::mcp::McpContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let state = SseState {
        ctx,
        clients: Arc::new(Mutex::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .with_state(state);

    let listener = TcpListener::bind(host_port)
        .await
        .map_err(|e| format!("failed to bind {host_port}: {e}"))?;

    info!(%host_port, "MCP SSE server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| format!("SSE server error: {e}"))
}

/// Removes a client's map entry when its event stream is dropped, so a
/// disconnect cleans up even if the client never POSTs again.
struct ClientRegistration {
    session_id: String,
    clients: Arc<Mutex<HashMap<String, mpsc::Sender<Value>>>>,
}

impl Drop for ClientRegistration {
    fn drop(&mut self) {
        let clients = Arc::clone(&self.clients);
        let session_id = std::mem::take(&mut self.session_id);
        tokio::spawn(async move {
            if clients.lock().await.remove(&session_id).is_some() {
                debug!(session = %session_id, "SSE client deregistered");
            }
        });
    }
}

/// `GET /sse` — register a client and stream its responses.
async fn sse_handler(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<Value>(32);
    state
        .clients
        .lock()
        .await
        .insert(session_id.clone(), tx);
    info!(session = %session_id, "SSE client connected");

    let registration = ClientRegistration {
        session_id: session_id.clone(),
        clients: Arc::clone(&state.clients),
    };

    let endpoint = format!("/message?sessionId={session_id}");
    let announce = futures_util::stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    // The registration rides along in the unfold state; axum drops the
    // stream when the connection closes.
    let responses = futures_util::stream::unfold(
        (rx, registration),
        |(mut rx, registration)| async move {
            let msg = rx.recv().await?;
            let data = serde_json::to_string(&msg).unwrap_or_default();
            Some((
                Ok::<_, Infallible>(Event::default().event("message").data(data)),
                (rx, registration),
            ))
        },
    );

    Sse::new(announce.chain(responses)).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct MessageParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// `POST /message?sessionId=<id>` — dispatch one request; the response goes
/// out over the client's event stream.
async fn message_handler(
    State(state): State<SseState>,
    Query(params): Query<MessageParams>,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    let sender = state.clients.lock().await.get(&params.session_id).cloned();
    let Some(sender) = sender else {
        return (StatusCode::NOT_FOUND, "unknown sessionId").into_response();
    };

    if let Some(response) = state.ctx.dispatch(&request).await {
        if sender.send(response).await.is_err() {
            // Stream side is gone; drop the registration.
            debug!(session = %params.session_id, "SSE client disconnected, dropping");
            state.clients.lock().await.remove(&params.session_id);
            return (StatusCode::GONE, "client disconnected").into_response();
        }
    }

    StatusCode::ACCEPTED.into_response()
}
