//! Hub server CLI.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mctunnel_hub::{HubConfig, Server};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, ServerTlsConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Multi-cluster tunnel hub: terminates agent tunnels and serves client HTTP.
#[derive(Parser, Debug)]
#[command(name = "mctunnel-hub")]
#[command(about = "Multi-cluster tunnel hub: terminates agent tunnels and serves client HTTP")]
#[command(version)]
struct Args {
    /// Agent-facing gRPC listen address
    #[arg(long, env = "MCTUNNEL_GRPC_LISTEN", default_value = "0.0.0.0:8443")]
    grpc_listen: String,

    /// Client-facing HTTP listen address
    #[arg(long, env = "MCTUNNEL_HTTP_LISTEN", default_value = "0.0.0.0:8080")]
    http_listen: String,

    /// PEM certificate for the gRPC endpoint (TLS disabled when omitted)
    #[arg(long, requires = "grpc_key")]
    grpc_cert: Option<PathBuf>,

    /// PEM private key for the gRPC endpoint
    #[arg(long, requires = "grpc_cert")]
    grpc_key: Option<PathBuf>,

    /// PEM certificate for the HTTP endpoint (TLS disabled when omitted)
    #[arg(long, requires = "http_key")]
    http_cert: Option<PathBuf>,

    /// PEM private key for the HTTP endpoint
    #[arg(long, requires = "http_cert")]
    http_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

fn load_grpc_tls(cert: &Path, key: &Path) -> Result<ServerTlsConfig> {
    let cert_pem = fs::read(cert)
        .with_context(|| format!("Failed to read certificate: {}", cert.display()))?;
    let key_pem =
        fs::read(key).with_context(|| format!("Failed to read private key: {}", key.display()))?;

    Ok(ServerTlsConfig::new().identity(Identity::from_pem(cert_pem, key_pem)))
}

fn load_http_tls(cert: &Path, key: &Path) -> Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        fs::File::open(cert)
            .with_context(|| format!("Failed to read certificate: {}", cert.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("Failed to parse certificate PEM")?;

    let key_der = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        fs::File::open(key)
            .with_context(|| format!("Failed to read private key: {}", key.display()))?,
    ))
    .context("Failed to parse private key PEM")?
    .context("No private key found in PEM")?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key_der)
        .context("Failed to build TLS config")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = HubConfig {
        grpc_listen_addr: args.grpc_listen,
        http_listen_addr: args.http_listen,
        ..HubConfig::default()
    };

    if let (Some(cert), Some(key)) = (&args.grpc_cert, &args.grpc_key) {
        config.grpc_tls = Some(load_grpc_tls(cert, key)?);
    }
    if let (Some(cert), Some(key)) = (&args.http_cert, &args.http_key) {
        config.http_tls = Some(load_http_tls(cert, key)?);
    }

    let server = Server::bind(config)
        .await
        .context("Failed to start hub server")?;

    info!(
        grpc_address = %server.grpc_addr(),
        http_address = %server.http_addr(),
        "Hub starting"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    if let Err(err) = server.run(cancel).await {
        error!(error = %err, "Hub server failed");
        return Err(err.into());
    }

    info!("Hub stopped");
    Ok(())
}
