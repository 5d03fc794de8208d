//! Error taxonomy for the routing core.
//!
//! Every handler returns a typed [`Error`]; the transport layer renders it
//! into a JSON-RPC error or an `isError` tool result. Background session
//! errors are logged by the session task and never surface here — an RPC
//! call in flight when the connection drops discovers it through its own
//! query and gets [`Error::SessionNotReady`] or [`Error::Query`].

use thiserror::Error;

/// Errors produced by the request-routing layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range tool arguments. Never reaches device I/O.
    /// Carries one message per failing field.
    #[error("invalid arguments: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The referenced device index has no live handle.
    #[error("device {0} not found")]
    NotFound(u32),

    /// A device-control operation failed or timed out.
    #[error("device query failed: {0}")]
    Query(String),

    /// The device-control session has not completed startup or has dropped.
    /// Distinct from bad input: the caller may retry later.
    #[error("device-control session not ready")]
    SessionNotReady,

    /// A templated resource path did not match, or carried a non-numeric id.
    /// A caller error, not a server fault.
    #[error("bad resource path: {0}")]
    Path(String),
}
