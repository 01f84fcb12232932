//! Wire protocol for the multi-cluster tunnel.
//!
//! A hub and its agents exchange [`Packet`]s over a single bidirectional
//! gRPC stream per agent. Each packet is tagged with a `conn_id` that
//! identifies one logical byte pipe multiplexed inside the stream;
//! `conn_id` 0 is reserved for tunnel-level control packets such as DRAIN.
//!
//! This crate also carries the HTTP/1.x request-head helpers shared by the
//! hub front-end and the agent-side proxy, since both ends frame exactly
//! one request per logical connection before the byte stream turns opaque.

pub mod http;

/// Generated protobuf and gRPC code for the tunnel protocol.
pub mod v1 {
    tonic::include_proto!("mctunnel.v1");
}

pub use v1::tunnel_service_client::TunnelServiceClient;
pub use v1::tunnel_service_server::{TunnelService, TunnelServiceServer};
pub use v1::{ControlCode, Packet};

/// Reserved conn_id for tunnel-level control packets.
pub const CONTROL_CONN_ID: i64 = 0;

/// Metadata key an agent must set when opening the tunnel stream.
pub const CLUSTER_NAME_METADATA_KEY: &str = "cluster-name";

impl Packet {
    /// A DATA packet carrying payload bytes for a logical connection.
    pub fn data(conn_id: i64, data: Vec<u8>) -> Self {
        Self {
            conn_id,
            code: ControlCode::Data as i32,
            data,
            error_message: String::new(),
        }
    }

    /// An ERROR packet terminating a logical connection.
    pub fn error(conn_id: i64, message: impl Into<String>) -> Self {
        Self {
            conn_id,
            code: ControlCode::Error as i32,
            data: Vec::new(),
            error_message: message.into(),
        }
    }

    /// The DRAIN control packet, sent by an agent on graceful shutdown.
    pub fn drain() -> Self {
        Self {
            conn_id: CONTROL_CONN_ID,
            code: ControlCode::Drain as i32,
            data: Vec::new(),
            error_message: String::new(),
        }
    }
}
