//! # mcp-haptic
//!
//! MCP (Model Context Protocol) server that exposes haptic devices reachable
//! through a Buttplug/Intiface device-control server. Runs as a stdio
//! JSON-RPC server — designed to be launched by an AI agent host — or as an
//! SSE server bound to a host:port.
//!
//! ## Architecture
//!
//! ```text
//! main.rs      — entry point, CLI parsing, logging, transport launch
//! config.rs    — clap flags and validated configuration
//! error.rs     — typed error taxonomy for the routing layer
//! pattern.rs   — `:name` path-template extraction
//! command.rs   — device_vibrate argument validation
//! proto.rs     — serde codec for the Buttplug wire messages
//! session.rs   — background WebSocket session with reconnect + debounce
//! directory.rs — device directory facade over the session
//! router.rs    — resource/tool surface and handlers
//! mcp.rs       — JSON-RPC dispatch + stdio transport
//! sse.rs       — SSE network transport
//! ```
//!
//! ## Surface
//!
//! - **Resources**: `/devices`, `/device/{id}`, `/device/{id}/rssi`,
//!   `/device/{id}/battery`
//! - **Tools**: `device_vibrate`

mod command;
mod config;
mod directory;
mod error;
mod mcp;
mod pattern;
mod proto;
mod router;
mod session;
mod sse;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::{Cli, ResolvedConfig, Transport};
use mcp::McpContext;
use session::Session;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let resolved = match config::load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("mcp-haptic: configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&resolved) {
        eprintln!("mcp-haptic: {e}");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        ws_port = resolved.session.ws_port,
        debounce = ?resolved.session.debounce,
        "mcp-haptic starting"
    );

    let (session, directory) = Session::new(resolved.session.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session_task = tokio::spawn(session.run(shutdown_rx.clone()));

    let ctx = McpContext::new(directory);

    match resolved.transport {
        Transport::Stdio => {
            info!("MCP STDIO server started");
            tokio::select! {
                () = mcp::run_stdio(ctx) => info!("stdin closed"),
                () = wait_for_signal() => {}
            }
        }
        Transport::Sse { host_port } => {
            tokio::select! {
                result = sse::run_sse(&host_port, ctx, shutdown_rx.clone()) => {
                    if let Err(e) = result {
                        error!(error = %e, "MCP SSE server error");
                        std::process::exit(1);
                    }
                }
                () = wait_for_signal() => {}
            }
        }
    }

    // Stop the session task and let in-flight queries fail cleanly.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), session_task).await;
}

/// Resolve until SIGINT (or SIGTERM on unix) arrives.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to register SIGTERM handler");
                    let _ = ctrl_c.await;
                    info!("received SIGINT");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received SIGINT");
    }
}

/// Shared log file handle; `&File` is `Write`, so each writer clones the Arc.
struct LogFile(Arc<File>);

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

/// Install the global tracing subscriber per CLI flags: text or JSON
/// format, stderr or an append-mode log file, info level unless verbose.
/// Stdout is never used — it belongs to the stdio transport.
fn init_tracing(config: &ResolvedConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if config.verbose { "debug" } else { "info" })
    });

    let use_ansi = config.log_file.is_none();
    let make_writer: Box<dyn Fn() -> Box<dyn Write + Send> + Send + Sync> =
        match &config.log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .map_err(|e| format!("failed to open log file {}: {e}", path.display()))?;
                let file = Arc::new(file);
                Box::new(move || Box::new(LogFile(Arc::clone(&file))) as Box<dyn Write + Send>)
            }
            None => Box::new(|| Box::new(io::stderr()) as Box<dyn Write + Send>),
        };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(use_ansi);

    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}
