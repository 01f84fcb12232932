//! Hub side of the multi-cluster tunnel.
//!
//! The hub accepts one long-lived bidirectional gRPC stream per agent and
//! multiplexes client traffic over it. Clients speak plain HTTP to the
//! gateway; the gateway resolves the target cluster from the request URL,
//! opens a logical packet connection on that cluster's tunnel and from then
//! on pumps raw bytes in both directions.

pub mod cluster_name;
pub mod error;
pub mod gateway;
pub mod server;
pub mod tunnel;
pub mod tunnel_manager;

pub use cluster_name::{ClusterNameParser, PathClusterNameParser};
pub use error::{GatewayError, ServerError, TunnelError};
pub use gateway::HttpGateway;
pub use server::{HubConfig, KeepaliveConfig, Server};
pub use tunnel::{PacketConn, PacketConnSender, Tunnel};
pub use tunnel_manager::TunnelManager;
