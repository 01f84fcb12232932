//! Local reverse proxy.
//!
//! Listens on a Unix socket for the byte streams the connection manager
//! feeds it. Each stream carries one serialized HTTP request: the proxy
//! re-parses the head, asks the [`Router`] for the target, runs the
//! [`RequestProcessor`], rewrites the path and forwards the request over a
//! fresh connection to the target. From there on bytes are copied verbatim
//! in both directions, so response framing and connection upgrades pass
//! through untouched. TLS toward targets never negotiates ALPN, which
//! keeps HTTP/2 out of the way of SPDY-style upgrades.

use std::sync::Arc;
use std::time::Duration;

use mctunnel_proto::http::{read_head, RequestHead};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::certs::{ensure_crypto_provider, CertificateProvider};
use crate::error::ProxyError;
use crate::request_processor::RequestProcessor;
use crate::router::{Router, Scheme, Target};

/// Timeout for dialing a target service.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the TLS handshake with a target service.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LocalProxy {
    socket_path: String,
    router: Arc<dyn Router>,
    processor: Arc<dyn RequestProcessor>,
    certs: Arc<dyn CertificateProvider>,
}

impl LocalProxy {
    pub fn new(
        socket_path: impl Into<String>,
        router: Arc<dyn Router>,
        processor: Arc<dyn RequestProcessor>,
        certs: Arc<dyn CertificateProvider>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            router,
            processor,
            certs,
        }
    }

    /// Serve until `cancel` fires. The socket file is removed on the way
    /// out so a restarted agent can bind again.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ProxyError> {
        ensure_crypto_provider();

        let roots = self.certs.root_store()?;
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        // A stale socket file from a previous run blocks the bind.
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path).map_err(|source| ProxyError::Bind {
            path: self.socket_path.clone(),
            source,
        })?;

        info!(socket_path = %self.socket_path, "Local proxy listening");

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Local proxy shutting down");
                    let _ = std::fs::remove_file(&self.socket_path);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        warn!(error = %err, "Failed to accept proxy connection");
                        continue;
                    }
                },
            };

            let router = self.router.clone();
            let processor = self.processor.clone();
            let connector = connector.clone();
            tokio::spawn(async move {
                handle_conn(stream, router, processor, connector).await;
            });
        }
    }
}

async fn handle_conn(
    mut stream: UnixStream,
    router: Arc<dyn Router>,
    processor: Arc<dyn RequestProcessor>,
    connector: TlsConnector,
) {
    let (mut head, leftover) = match read_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "Failed to parse proxied request");
            return;
        }
    };

    debug!(method = %head.method, uri = %head.uri, "Proxying request");

    let target = match router.route(&head) {
        Ok(target) => target,
        Err(err) => {
            let _ = write_response(
                &mut stream,
                500,
                "Internal Server Error",
                &format!("failed to resolve target service: {err}"),
            )
            .await;
            return;
        }
    };

    if let Err(err) = processor.process(&target.host, &mut head).await {
        debug!(status = err.status, error = %err, "Request rejected by processor");
        let _ = write_response(&mut stream, err.status, reason_for(err.status), &err.message)
            .await;
        return;
    }

    head.set_path(&target.path);

    if let Err(err) = proxy_to_target(&mut stream, &head, &leftover, &target, &connector).await {
        warn!(host = %target.host, error = %err, "Proxying to target failed");
        let _ = write_response(
            &mut stream,
            502,
            "Bad Gateway",
            &format!("proxy to target service failed: {err}"),
        )
        .await;
    }
}

/// Dial the target, forward the rewritten request and copy bytes both ways
/// until either side closes.
async fn proxy_to_target(
    client: &mut UnixStream,
    head: &RequestHead,
    leftover: &[u8],
    target: &Target,
    connector: &TlsConnector,
) -> Result<(), ProxyError> {
    let authority = target.authority();

    let tcp = timeout(DIAL_TIMEOUT, TcpStream::connect(&authority))
        .await
        .map_err(|_| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("timed out dialing {authority}"),
            ))
        })??;

    match target.scheme {
        Scheme::Https => {
            let server_name = rustls::pki_types::ServerName::try_from(
                target.host_name().to_string(),
            )
            .map_err(|err| {
                ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid server name {}: {err}", target.host_name()),
                ))
            })?;

            let tls = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
                .await
                .map_err(|_| {
                    ProxyError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("tls handshake with {authority} timed out"),
                    ))
                })??;

            pump(client, tls, head, leftover).await
        }
        Scheme::Http => pump(client, tcp, head, leftover).await,
    }
}

async fn pump<T>(
    client: &mut UnixStream,
    mut upstream: T,
    head: &RequestHead,
    leftover: &[u8],
) -> Result<(), ProxyError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    upstream.write_all(&head.serialize("")).await?;
    if !leftover.is_empty() {
        upstream.write_all(leftover).await?;
    }
    upstream.flush().await?;

    // Opaque from here: response bytes, streamed bodies and protocol
    // upgrades all ride the same copy.
    let _ = tokio::io::copy_bidirectional(client, &mut upstream).await;
    Ok(())
}

fn reason_for(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

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
