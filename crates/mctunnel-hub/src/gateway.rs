//! Client-facing HTTP gateway.
//!
//! The gateway reads exactly one HTTP request head per connection, resolves
//! the target cluster and opens a packet connection on its tunnel. The
//! request is forwarded as two packets (an empty open sentinel followed by
//! the serialized head plus any buffered body bytes); after that the client
//! socket is treated as a raw byte pipe in both directions. No response
//! parsing, no re-framing, and no HTTP/2 negotiation, so upgrade protocols
//! like SPDY and WebSocket tunnel through untouched.

use std::sync::Arc;
use std::time::Duration;

use mctunnel_proto::http::read_head;
use mctunnel_proto::{ControlCode, Packet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster_name::ClusterNameParser;
use crate::error::GatewayError;
use crate::tunnel::PacketConn;
use crate::tunnel_manager::TunnelManager;

/// Deadline for reading the request head and setting up the tunnel leg.
const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Read chunk size for the client-to-agent pump.
const READ_CHUNK_SIZE: usize = 32 * 1024;

pub struct HttpGateway {
    manager: Arc<TunnelManager>,
    parser: Arc<dyn ClusterNameParser>,
    tls: Option<TlsAcceptor>,
}

impl HttpGateway {
    pub fn new(
        manager: Arc<TunnelManager>,
        parser: Arc<dyn ClusterNameParser>,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            manager,
            parser,
            tls,
        }
    }

    /// Accept loop. Runs until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        info!(address = %listener.local_addr()?, "HTTP gateway listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("HTTP gateway shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "Failed to accept client connection");
                        continue;
                    }
                },
            };

            let gateway = self.clone();
            tokio::spawn(async move {
                match gateway.tls.clone() {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => gateway.handle_client(tls_stream, peer).await,
                        Err(err) => {
                            debug!(peer = %peer, error = %err, "TLS handshake failed");
                        }
                    },
                    None => gateway.handle_client(stream, peer).await,
                }
            });
        }
    }

    async fn handle_client<S>(&self, mut stream: S, peer: std::net::SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (head, leftover) = match timeout(SETUP_TIMEOUT, read_head(&mut stream)).await {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(err)) => {
                debug!(peer = %peer, error = %err, "Failed to read client request");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "Timed out reading client request");
                return;
            }
        };

        debug!(peer = %peer, method = %head.method, uri = %head.uri, "Received request");

        if head.path() == "/health" {
            let _ = write_response(&mut stream, 200, "OK", "OK").await;
            return;
        }

        let cluster_name = match self.parser.parse(&head) {
            Ok(name) => name,
            Err(err) => {
                debug!(peer = %peer, error = %err, "Failed to parse cluster name");
                let _ = write_response(&mut stream, 400, "Bad Request", &err.to_string()).await;
                return;
            }
        };

        let Some(tunnel) = self.manager.get(&cluster_name) else {
            debug!(cluster = %cluster_name, "No tunnel for cluster");
            let _ = write_response(
                &mut stream,
                503,
                "Service Unavailable",
                &format!("Cluster {cluster_name} not available"),
            )
            .await;
            return;
        };

        let conn = match tunnel.new_packet_conn() {
            Ok(conn) => conn,
            Err(err) => {
                warn!(cluster = %cluster_name, error = %err, "Failed to open packet connection");
                let _ = write_response(
                    &mut stream,
                    503,
                    "Service Unavailable",
                    &format!("Cluster {cluster_name} not available: {err}"),
                )
                .await;
                return;
            }
        };

        // An empty packet first: the agent allocates its side of the
        // connection before any request bytes arrive.
        if let Err(err) = conn.send(Packet::data(conn.id(), Vec::new())) {
            warn!(cluster = %cluster_name, error = %err, "Failed to send open sentinel");
            let _ = write_response(&mut stream, 502, "Bad Gateway", "Failed to establish tunnel")
                .await;
            return;
        }

        // The one and only piece of framing the hub does: the original
        // request line, headers and any body bytes already buffered. A
        // request without a Host header gets one synthesized from its own
        // authority, the value the client addressed this hub by.
        let fallback_host = head.uri_host().unwrap_or_default().to_string();
        let mut request_bytes = head.serialize(&fallback_host);
        request_bytes.extend_from_slice(&leftover);

        if let Err(err) = conn.send(Packet::data(conn.id(), request_bytes)) {
            warn!(cluster = %cluster_name, error = %err, "Failed to forward request");
            let _ = write_response(&mut stream, 502, "Bad Gateway", "Failed to establish tunnel")
                .await;
            return;
        }

        debug!(
            cluster = %cluster_name,
            conn_id = conn.id(),
            "Established tunnel for client"
        );

        forward_traffic(stream, conn).await;
    }
}

/// Pump raw bytes between the client socket and the packet connection
/// until either side fails or closes.
async fn forward_traffic<S>(stream: S, mut conn: PacketConn)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn_id = conn.id();
    let sender = conn.sender();
    let (mut client_read, mut client_write) = tokio::io::split(stream);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        tokio::select! {
            read = client_read.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(conn_id, "Client connection closed");
                    break;
                }
                Ok(n) => {
                    // The chunk is copied into the packet so the read
                    // buffer can be reused immediately.
                    if let Err(err) = sender.send(Packet::data(conn_id, buf[..n].to_vec())) {
                        debug!(conn_id, error = %err, "Failed to send data to agent");
                        break;
                    }
                }
                Err(err) => {
                    debug!(conn_id, error = %err, "Error reading from client");
                    break;
                }
            },
            packet = conn.recv() => match packet {
                None => {
                    debug!(conn_id, "Packet connection closed");
                    break;
                }
                Some(packet) => match ControlCode::try_from(packet.code) {
                    Ok(ControlCode::Error) => {
                        error!(
                            conn_id,
                            error = %packet.error_message,
                            "Received error from agent"
                        );
                        let _ = write_response(
                            &mut client_write,
                            502,
                            "Bad Gateway",
                            &packet.error_message,
                        )
                        .await;
                        break;
                    }
                    _ => {
                        if !packet.data.is_empty() {
                            if let Err(err) = client_write.write_all(&packet.data).await {
                                debug!(conn_id, error = %err, "Failed to write to client");
                                break;
                            }
                        }
                    }
                },
            },
        }
    }

    conn.close();
    debug!(conn_id, "Tunnel for client closed");
}

/// Write a minimal HTTP/1.1 response with a plain-text body.
async fn write_response<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}
