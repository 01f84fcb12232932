//! Session supervisor.
//!
//! Maintains at most one live tunnel stream to the hub. Sessions are
//! ephemeral: any failure tears the stream down and the supervisor
//! redials under jittered exponential backoff. The local proxy and the
//! connection manager outlive sessions, so packets buffered while
//! disconnected flow out once a new stream is up.

use std::sync::Arc;
use std::time::Duration;

use mctunnel_proto::{Packet, TunnelServiceClient, CLUSTER_NAME_METADATA_KEY};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::transport::Endpoint;
use tonic::{Request, Streaming};
use tracing::{error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::certs::CertificateProvider;
use crate::config::AgentConfig;
use crate::conn_manager::{ConnManagerConfig, PacketConnManager};
use crate::error::AgentError;
use crate::proxy::LocalProxy;
use crate::request_processor::RequestProcessor;
use crate::router::Router;

/// Buffer for packets staged onto the gRPC request stream.
const STREAM_BUFFER_SIZE: usize = 150;

/// Best-effort window for handing the drain packet to the stream.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Agent {
    config: AgentConfig,
    manager: Arc<PacketConnManager>,
    proxy: LocalProxy,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        router: Arc<dyn Router>,
        processor: Arc<dyn RequestProcessor>,
        certs: Arc<dyn CertificateProvider>,
    ) -> Result<Self, AgentError> {
        if config.cluster_name.is_empty() {
            return Err(AgentError::Config("cluster name is required".to_string()));
        }
        if config.hub_address.is_empty() {
            return Err(AgentError::Config("hub address is required".to_string()));
        }

        let manager = PacketConnManager::new(ConnManagerConfig {
            socket_path: config.uds_socket_path.clone(),
            ..ConnManagerConfig::default()
        });
        let proxy = LocalProxy::new(config.uds_socket_path.clone(), router, processor, certs);

        Ok(Self {
            config,
            manager,
            proxy,
        })
    }

    /// Run the proxy and the reconnect loop until `cancel` fires. A proxy
    /// failure is fatal; session failures are retried.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!(
            cluster = %self.config.cluster_name,
            hub = %self.config.hub_address,
            socket_path = %self.config.uds_socket_path,
            "Agent starting"
        );

        let result = tokio::select! {
            proxy_result = self.proxy.run(cancel.child_token()) => match proxy_result {
                Ok(()) => Ok(()),
                Err(err) => {
                    error!(error = %err, "Local proxy failed");
                    Err(AgentError::Proxy(err))
                }
            },
            session_result = self.session_loop(&cancel) => session_result,
        };

        self.manager.close();
        info!("Agent stopped");
        result
    }

    async fn session_loop(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let mut backoff = ExponentialBackoff::new(self.config.backoff.clone());

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.establish(cancel).await {
                Ok((inbound, out_tx)) => {
                    backoff.reset();
                    match self.serve(inbound, out_tx, cancel).await {
                        Ok(()) => {
                            // Only the drain path ends a session cleanly.
                            return Ok(());
                        }
                        Err(err) => {
                            if cancel.is_cancelled() {
                                return Ok(());
                            }
                            warn!(error = %err, "Tunnel session failed, retrying");
                        }
                    }
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    warn!(error = %err, "Failed to connect to hub, retrying");
                }
            }

            let wait = backoff.next();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(wait) => {}
            }
        }
    }

    /// Dial the hub and open the tunnel stream with cluster identity in
    /// the metadata.
    async fn establish(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Streaming<Packet>, mpsc::Sender<Packet>), AgentError> {
        info!(address = %self.config.hub_address, "Connecting to hub");

        let mut endpoint = Endpoint::from_shared(self.config.hub_uri())?
            .http2_keep_alive_interval(self.config.keepalive.interval)
            .keep_alive_timeout(self.config.keepalive.timeout)
            .keep_alive_while_idle(true);

        if let Some(tls) = &self.config.tls {
            endpoint = endpoint.tls_config(tls.clone())?;
        }

        let channel = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Config("shutting down".to_string())),
            connected = endpoint.connect() => connected?,
        };

        let mut client = TunnelServiceClient::new(channel);

        let (out_tx, out_rx) = mpsc::channel(STREAM_BUFFER_SIZE);
        let mut request = Request::new(ReceiverStream::new(out_rx));
        let cluster = MetadataValue::try_from(self.config.cluster_name.as_str())
            .map_err(|_| {
                AgentError::Config("cluster name is not valid metadata".to_string())
            })?;
        request.metadata_mut().insert(CLUSTER_NAME_METADATA_KEY, cluster);

        let inbound = client.tunnel(request).await?.into_inner();

        info!(cluster = %self.config.cluster_name, "Tunnel stream established");
        Ok((inbound, out_tx))
    }

    /// Serve one tunnel session. Returns `Ok` only after a graceful
    /// drain; every other outcome is an error the caller retries.
    async fn serve(
        &self,
        mut inbound: Streaming<Packet>,
        out_tx: mpsc::Sender<Packet>,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let ingress = async {
            loop {
                match inbound.message().await {
                    Ok(Some(packet)) => {
                        let conn_id = packet.conn_id;
                        if let Err(err) = self.manager.dispatch(packet).await {
                            warn!(conn_id, error = %err, "Failed to dispatch packet");
                            // Tell the hub this conn_id is dead; losing the
                            // report is survivable, crashing the stream is not.
                            let report = Packet::error(conn_id, err.to_string());
                            if out_tx.try_send(report).is_err() {
                                warn!(conn_id, "Failed to report dispatch error to hub");
                            }
                        }
                    }
                    Ok(None) => return Err(AgentError::StreamEnded),
                    Err(status) => return Err(AgentError::Stream(status)),
                }
            }
        };

        let egress = async {
            let mut outgoing = self.manager.lock_outgoing().await;
            loop {
                match outgoing.recv().await {
                    Some(packet) => {
                        if out_tx.send(packet).await.is_err() {
                            return Err(AgentError::StreamEnded);
                        }
                    }
                    None => return Err(AgentError::OutgoingClosed),
                }
            }
        };

        let drain = async {
            cancel.cancelled().await;
            info!("Shutting down, sending drain to hub");

            match timeout(DRAIN_TIMEOUT, out_tx.send(Packet::drain())).await {
                Ok(Ok(())) => {
                    // The packet is only staged on the request stream;
                    // give the transport a moment to put it on the wire
                    // before the stream is dropped.
                    sleep(Duration::from_millis(50)).await;
                    info!("Drain sent to hub");
                }
                Ok(Err(_)) => warn!("Failed to send drain, stream already closed"),
                Err(_) => warn!("Timed out sending drain to hub"),
            }

            Ok::<(), AgentError>(())
        };

        tokio::select! {
            result = ingress => result,
            result = egress => result,
            result = drain => result,
        }
    }
}
