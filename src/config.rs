//! CLI flags and validated configuration.
//!
//! Flags follow the usual MCP-server conventions: logging goes to stderr by
//! default (stdout belongs to the JSON-RPC transport), with `--log-file`
//! (or the `MCP_LOG_FILE` env var) and `--log-json` to redirect/reshape it.
//! Transport is stdio unless `--sse` is given. Invalid flags fail fast with
//! a one-line message and a non-zero exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::session::SessionConfig;

pub const DEFAULT_SSE_HOST_PORT: &str = "127.0.0.1:8889";
/// Default Intiface Central websocket port.
pub const DEFAULT_WS_PORT: u16 = 12345;
/// Default debounce window: 50ms = 20Hz.
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// CLI arguments parsed by `clap`.
#[derive(Parser)]
#[command(
    name = "mcp-haptic",
    version,
    about = "MCP server for haptic devices via a Buttplug/Intiface device server"
)]
pub struct Cli {
    /// Log file destination (or MCP_LOG_FILE env var). Default is stderr.
    #[arg(short = 'l', long)]
    pub log_file: Option<PathBuf>,

    /// Log in JSON (default is plaintext).
    #[arg(short = 'j', long)]
    pub log_json: bool,

    /// Verbose (debug-level) logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Use the SSE transport (default is stdio).
    #[arg(long)]
    pub sse: bool,

    /// host:port to listen on for SSE connections.
    #[arg(long, default_value = DEFAULT_SSE_HOST_PORT)]
    pub sse_host: String,

    /// Port of the Buttplug websocket server on localhost.
    #[arg(long, default_value_t = DEFAULT_WS_PORT)]
    pub ws_port: u16,

    /// Debounce window for vibrate commands in milliseconds (0 disables).
    #[arg(short = 'd', long, default_value_t = DEFAULT_DEBOUNCE_MS)]
    pub debounce_ms: u64,
}

/// Which MCP transport to run.
#[derive(Debug)]
pub enum Transport {
    Stdio,
    Sse { host_port: String },
}

/// Validated configuration ready for startup.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub log_file: Option<PathBuf>,
    pub log_json: bool,
    pub verbose: bool,
    pub transport: Transport,
    pub session: SessionConfig,
}

/// Validate CLI args into a [`ResolvedConfig`].
pub fn load_config(cli: &Cli) -> Result<ResolvedConfig, String> {
    if cli.ws_port == 0 {
        return Err("--ws-port must be non-zero".into());
    }

    let transport = if cli.sse {
        // Fail at startup, not at bind time.
        cli.sse_host
            .parse::<SocketAddr>()
            .map_err(|e| format!("invalid --sse-host '{}': {}", cli.sse_host, e))?;
        Transport::Sse {
            host_port: cli.sse_host.clone(),
        }
    } else {
        Transport::Stdio
    };

    // CLI flag wins over the environment.
    let log_file = cli
        .log_file
        .clone()
        .or_else(|| std::env::var("MCP_LOG_FILE").ok().map(PathBuf::from));

    Ok(ResolvedConfig {
        log_file,
        log_json: cli.log_json,
        verbose: cli.verbose,
        transport,
        session: SessionConfig {
            ws_port: cli.ws_port,
            debounce: Duration::from_millis(cli.debounce_ms),
            query_timeout: QUERY_TIMEOUT,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mcp-haptic").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_resolve() {
        let config = load_config(&parse(&[])).unwrap();
        assert!(matches!(config.transport, Transport::Stdio));
        assert_eq!(config.session.ws_port, DEFAULT_WS_PORT);
        assert_eq!(config.session.debounce, Duration::from_millis(50));
        assert!(!config.log_json);
    }

    #[test]
    fn zero_ws_port_is_rejected() {
        let err = load_config(&parse(&["--ws-port", "0"])).unwrap_err();
        assert!(err.contains("--ws-port"));
    }

    #[test]
    fn sse_transport_requires_valid_host_port() {
        let config = load_config(&parse(&["--sse"])).unwrap();
        match config.transport {
            Transport::Sse { host_port } => assert_eq!(host_port, DEFAULT_SSE_HOST_PORT),
            Transport::Stdio => panic!("expected SSE transport"),
        }

        let err = load_config(&parse(&["--sse", "--sse-host", "not-an-addr"])).unwrap_err();
        assert!(err.contains("--sse-host"));
    }

    #[test]
    fn bad_sse_host_ignored_without_sse_flag() {
        // Only validated when the SSE transport is selected.
        assert!(load_config(&parse(&["--sse-host", "not-an-addr"])).is_ok());
    }

    #[test]
    fn debounce_can_be_disabled() {
        let config = load_config(&parse(&["-d", "0"])).unwrap();
        assert!(config.session.debounce.is_zero());
    }
}
