//! Agent configuration.

use std::time::Duration;

use tonic::transport::ClientTlsConfig;

use crate::backoff::BackoffConfig;

/// Default path of the Unix socket the local proxy listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/multiclustertunnel.sock";

/// gRPC client keepalive. Pings flow even without active streams so a
/// half-dead connection is noticed within seconds instead of at the next
/// request.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// gRPC address of the hub, with or without a scheme prefix.
    pub hub_address: String,

    /// Cluster identity sent as stream metadata. Required.
    pub cluster_name: String,

    /// Path of the local proxy's Unix socket.
    pub uds_socket_path: String,

    /// TLS for the hub connection. Plaintext when None.
    pub tls: Option<ClientTlsConfig>,

    /// Reconnect policy.
    pub backoff: BackoffConfig,

    pub keepalive: KeepaliveConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub_address: "localhost:8443".to_string(),
            cluster_name: String::new(),
            uds_socket_path: DEFAULT_SOCKET_PATH.to_string(),
            tls: None,
            backoff: BackoffConfig::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl AgentConfig {
    /// The hub address as a URI tonic accepts, inferring the scheme from
    /// the TLS setting when the operator left it off.
    pub(crate) fn hub_uri(&self) -> String {
        if self.hub_address.contains("://") {
            self.hub_address.clone()
        } else if self.tls.is_some() {
            format!("https://{}", self.hub_address)
        } else {
            format!("http://{}", self.hub_address)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_uri_scheme_inference() {
        let mut config = AgentConfig {
            hub_address: "hub.example.com:8443".to_string(),
            ..AgentConfig::default()
        };
        assert_eq!(config.hub_uri(), "http://hub.example.com:8443");

        config.tls = Some(ClientTlsConfig::new());
        assert_eq!(config.hub_uri(), "https://hub.example.com:8443");

        config.hub_address = "http://explicit:1234".to_string();
        assert_eq!(config.hub_uri(), "http://explicit:1234");
    }
}
