//! Agent error types.

use thiserror::Error;

/// Errors fatal to a tunnel session or the agent itself. Session-level
/// failures are retried under backoff; configuration failures are not.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("tunnel stream failed: {0}")]
    Stream(#[from] tonic::Status),

    #[error("tunnel stream closed by hub")]
    StreamEnded,

    #[error("outgoing packet channel closed")]
    OutgoingClosed,

    #[error("local proxy failed: {0}")]
    Proxy(#[from] ProxyError),
}

/// Per-packet dispatch failures. These collapse a single conn_id, never
/// the whole stream; the ingress loop reports them back to the hub as
/// ERROR packets.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("connection {0} is closed")]
    ConnClosed(i64),

    #[error("timed out enqueueing packet for connection {0}")]
    EnqueueTimeout(i64),

    #[error("unknown control code {code} for connection {conn_id}")]
    UnknownCode { conn_id: i64, code: i32 },
}

/// Errors from the local Unix-socket proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind unix socket {path}: {source}")]
    Bind {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Certs(#[from] CertError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors loading the trusted root certificate pool.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to read ca bundle {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid certificate in {path}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("no certificates found in {0}")]
    Empty(String),
}
