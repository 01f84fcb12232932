//! Per-cluster tunnel agent.
//!
//! The agent runs inside a network-isolated cluster and dials out to the
//! hub, so the cluster never needs inbound reachability. All tunneled
//! traffic shares one bidirectional gRPC stream: inbound packets are fanned
//! out to per-connection pipes into a local Unix-socket proxy, which
//! reverse-proxies each request to the in-cluster target service.

pub mod agent;
pub mod backoff;
pub mod certs;
pub mod config;
pub mod conn_manager;
pub mod error;
pub mod proxy;
pub mod request_processor;
pub mod router;

pub use agent::Agent;
pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use certs::{CertificateProvider, FileCertificateProvider, WebpkiCertificateProvider};
pub use config::{AgentConfig, KeepaliveConfig, DEFAULT_SOCKET_PATH};
pub use conn_manager::{ConnManagerConfig, PacketConnManager};
pub use error::{AgentError, CertError, DispatchError, ProxyError};
pub use proxy::LocalProxy;
pub use request_processor::{PassthroughProcessor, ProcessError, RequestProcessor};
pub use router::{KubeRouter, RouteError, Router, Scheme, Target};
