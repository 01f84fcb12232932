//! Tunnel agent CLI.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mctunnel_agent::{
    Agent, AgentConfig, FileCertificateProvider, KubeRouter, PassthroughProcessor,
    DEFAULT_SOCKET_PATH,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, ClientTlsConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Multi-cluster tunnel agent: dials the hub and proxies tunneled traffic
/// into this cluster.
#[derive(Parser, Debug)]
#[command(name = "mctunnel-agent")]
#[command(about = "Multi-cluster tunnel agent: connects a managed cluster to the hub")]
#[command(version)]
#[command(long_about = r#"
The agent establishes a single outbound gRPC stream to the hub and serves
all traffic the hub multiplexes over it, so the cluster needs no inbound
reachability.

EXAMPLES:
  # Connect to a hub over TLS
  mctunnel-agent --hub-address hub.example.com:8443 \
    --cluster-name cluster-a --ca-cert /etc/mctunnel/hub-ca.pem

  # Local development without TLS
  mctunnel-agent --hub-address localhost:8443 --cluster-name dev --insecure

ENVIRONMENT VARIABLES:
  MCTUNNEL_HUB_ADDRESS   Hub gRPC address
  MCTUNNEL_CLUSTER_NAME  Cluster identity sent to the hub
"#)]
struct Args {
    /// Hub gRPC address (host:port)
    #[arg(long, env = "MCTUNNEL_HUB_ADDRESS")]
    hub_address: Option<String>,

    /// Name of the managed cluster (required)
    #[arg(long, env = "MCTUNNEL_CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Path of the local proxy's Unix socket
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    uds_socket_path: String,

    /// PEM bundle used to verify the hub's TLS certificate
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Connect to the hub without TLS (for testing only)
    #[arg(long)]
    insecure: bool,

    /// PEM bundle used to verify in-cluster target services
    #[arg(long, default_value = mctunnel_agent::certs::SERVICE_ACCOUNT_CA_PATH)]
    target_ca: PathBuf,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    hub: HubSection,

    #[serde(default)]
    agent: AgentSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HubSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    ca_cert: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    uds_socket_path: Option<String>,
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

fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge CLI args over the config file and validate the result.
fn build_agent_config(args: &Args) -> Result<AgentConfig> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let hub_address = args
        .hub_address
        .clone()
        .or(file.hub.address)
        .context("Hub address is required (use --hub-address or config file)")?;

    let cluster_name = args
        .cluster_name
        .clone()
        .or(file.agent.cluster_name)
        .context("Cluster name is required (use --cluster-name or config file)")?;

    let uds_socket_path = file
        .agent
        .uds_socket_path
        .filter(|_| args.uds_socket_path == DEFAULT_SOCKET_PATH)
        .unwrap_or_else(|| args.uds_socket_path.clone());

    let tls = if args.insecure {
        info!("Connecting to hub without TLS");
        None
    } else {
        let ca_path = args
            .ca_cert
            .clone()
            .or(file.hub.ca_cert)
            .context("Either --ca-cert or --insecure is required")?;
        let pem = fs::read(&ca_path)
            .with_context(|| format!("Failed to read CA bundle: {}", ca_path.display()))?;
        Some(ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem)))
    };

    Ok(AgentConfig {
        hub_address,
        cluster_name,
        uds_socket_path,
        tls,
        ..AgentConfig::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = build_agent_config(&args).context("Failed to build agent configuration")?;

    info!("Cluster: {}", config.cluster_name);
    info!("Hub: {}", config.hub_address);
    info!("Proxy socket: {}", config.uds_socket_path);

    let agent = Agent::new(
        config,
        Arc::new(KubeRouter),
        Arc::new(PassthroughProcessor),
        Arc::new(FileCertificateProvider::new(args.target_ca.clone())),
    )
    .context("Failed to create agent")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    if let Err(err) = agent.run(cancel).await {
        error!(error = %err, "Agent stopped with error");
        return Err(err.into());
    }

    info!("Agent stopped");
    Ok(())
}
