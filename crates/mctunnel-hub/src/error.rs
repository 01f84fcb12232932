//! Hub error types.

use thiserror::Error;

/// Errors surfaced by a tunnel or one of its packet connections.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The tunnel or packet connection has been shut down. Operations on a
    /// closed tunnel are never retried internally.
    #[error("tunnel is closed")]
    Closed,

    /// The outgoing queue toward the agent is full. Sends are non-blocking;
    /// the caller decides whether to collapse the offending stream.
    #[error("outgoing queue is full")]
    Backpressure,

    /// The agent announced a graceful shutdown on the control conn_id.
    #[error("agent initiated drain")]
    Drained,

    /// The gRPC stream ended without a DRAIN.
    #[error("tunnel stream ended")]
    StreamEnded,

    /// The gRPC stream failed.
    #[error("tunnel stream failed: {0}")]
    Transport(#[from] tonic::Status),
}

/// Errors from the client-facing HTTP gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read request: {0}")]
    Http(#[from] mctunnel_proto::http::HttpError),

    #[error("request setup timed out")]
    SetupTimeout,

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Errors fatal to the hub server as a whole.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("grpc server failed: {0}")]
    Grpc(#[from] tonic::transport::Error),

    #[error("http gateway failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
