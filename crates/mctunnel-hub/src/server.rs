//! Hub server: the agent-facing gRPC endpoint and the client-facing HTTP
//! gateway, run side by side over one tunnel registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mctunnel_proto::{Packet, TunnelServiceServer, CLUSTER_NAME_METADATA_KEY};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::ServerTlsConfig;
use tonic::{Request, Response, Status, Streaming};
use tracing::{error, info, warn};

use crate::cluster_name::{ClusterNameParser, PathClusterNameParser};
use crate::error::{ServerError, TunnelError};
use crate::gateway::HttpGateway;
use crate::tunnel::OUTGOING_QUEUE_SIZE;
use crate::tunnel_manager::TunnelManager;

/// gRPC server keepalive. HTTP/2 pings keep NAT mappings warm and detect
/// dead agents that never sent a FIN.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Hub server configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Agent-facing gRPC endpoint.
    pub grpc_listen_addr: String,
    /// Client-facing HTTP endpoint.
    pub http_listen_addr: String,
    /// Optional TLS for the gRPC endpoint.
    pub grpc_tls: Option<ServerTlsConfig>,
    /// Optional TLS for the HTTP endpoint. Independent of gRPC TLS.
    pub http_tls: Option<rustls::ServerConfig>,
    pub keepalive: KeepaliveConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            grpc_listen_addr: "0.0.0.0:8443".to_string(),
            http_listen_addr: "0.0.0.0:8080".to_string(),
            grpc_tls: None,
            http_tls: None,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

/// The gRPC service an agent dials. Each accepted stream becomes a tunnel
/// registered under the cluster name carried in request metadata.
struct HubService {
    manager: Arc<TunnelManager>,
}

#[tonic::async_trait]
impl mctunnel_proto::TunnelService for HubService {
    type TunnelStream = ReceiverStream<Result<Packet, Status>>;

    async fn tunnel(
        &self,
        request: Request<Streaming<Packet>>,
    ) -> Result<Response<Self::TunnelStream>, Status> {
        let cluster_name = request
            .metadata()
            .get(CLUSTER_NAME_METADATA_KEY)
            .ok_or_else(|| Status::invalid_argument("cluster-name metadata is required"))?
            .to_str()
            .map_err(|_| Status::invalid_argument("cluster-name metadata must be valid ASCII"))?
            .to_string();

        info!(cluster = %cluster_name, "New tunnel stream from agent");

        let inbound = request.into_inner();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_SIZE);
        let tunnel = self.manager.register(&cluster_name, outgoing_tx);

        let manager = self.manager.clone();
        tokio::spawn(async move {
            let reason = tunnel.serve(inbound).await;
            match &reason {
                TunnelError::Drained | TunnelError::StreamEnded | TunnelError::Closed => {
                    info!(cluster = %cluster_name, reason = %reason, "Tunnel ended");
                }
                other => {
                    warn!(cluster = %cluster_name, reason = %other, "Tunnel ended with error");
                }
            }
            tunnel.close();
            manager.remove(&cluster_name, tunnel.id());
        });

        Ok(Response::new(ReceiverStream::new(outgoing_rx)))
    }
}

/// The hub process: binds both listeners, serves until cancelled, then
/// tears everything down.
pub struct Server {
    config: HubConfig,
    manager: Arc<TunnelManager>,
    parser: Arc<dyn ClusterNameParser>,
    grpc_listener: TcpListener,
    http_listener: TcpListener,
    grpc_addr: SocketAddr,
    http_addr: SocketAddr,
}

impl Server {
    /// Bind the listeners. Fails fast on unusable addresses so the caller
    /// can exit non-zero before serving anything.
    pub async fn bind(config: HubConfig) -> Result<Self, ServerError> {
        Self::bind_with_parser(config, Arc::new(PathClusterNameParser)).await
    }

    pub async fn bind_with_parser(
        config: HubConfig,
        parser: Arc<dyn ClusterNameParser>,
    ) -> Result<Self, ServerError> {
        let grpc_listener =
            TcpListener::bind(&config.grpc_listen_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    address: config.grpc_listen_addr.clone(),
                    source,
                })?;
        let http_listener =
            TcpListener::bind(&config.http_listen_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    address: config.http_listen_addr.clone(),
                    source,
                })?;

        let grpc_addr = grpc_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        Ok(Self {
            config,
            manager: Arc::new(TunnelManager::new()),
            parser,
            grpc_listener,
            http_listener,
            grpc_addr,
            http_addr,
        })
    }

    /// Actual bound gRPC address, useful when binding port 0.
    pub fn grpc_addr(&self) -> SocketAddr {
        self.grpc_addr
    }

    /// Actual bound HTTP address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn tunnel_manager(&self) -> Arc<TunnelManager> {
        self.manager.clone()
    }

    /// Serve both endpoints until `cancel` fires or either server fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        info!(
            grpc_address = %self.grpc_addr,
            http_address = %self.http_addr,
            "Starting hub server"
        );

        let mut builder = tonic::transport::Server::builder()
            .http2_keepalive_interval(Some(self.config.keepalive.interval))
            .http2_keepalive_timeout(Some(self.config.keepalive.timeout));

        if let Some(tls) = self.config.grpc_tls.clone() {
            info!("TLS enabled for gRPC endpoint");
            builder = builder.tls_config(tls)?;
        }

        let grpc_cancel = cancel.clone();
        let grpc = builder
            .add_service(TunnelServiceServer::new(HubService {
                manager: self.manager.clone(),
            }))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(self.grpc_listener),
                async move { grpc_cancel.cancelled().await },
            );

        let http_tls = self
            .config
            .http_tls
            .clone()
            .map(|tls| TlsAcceptor::from(Arc::new(tls)));
        if http_tls.is_some() {
            info!("TLS enabled for HTTP endpoint");
        }

        let gateway = Arc::new(HttpGateway::new(
            self.manager.clone(),
            self.parser.clone(),
            http_tls,
        ));
        let gateway_task = gateway.run(self.http_listener, cancel.clone());

        let result = tokio::select! {
            grpc_result = grpc => grpc_result.map_err(ServerError::Grpc),
            gateway_result = gateway_task => gateway_result.map_err(ServerError::Gateway),
        };

        if let Err(err) = &result {
            error!(error = %err, "Hub server failed");
        }

        self.manager.close_all();
        info!("Hub server shutdown complete");
        result
    }
}
