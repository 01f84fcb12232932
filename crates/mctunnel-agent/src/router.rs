//! Target service resolution.
//!
//! The local proxy asks a [`Router`] where a tunneled request should go.
//! The default [`KubeRouter`] understands two URL shapes:
//!
//! kube-apiserver:
//!   `/<cluster>/api/v1/pods?timeout=32s`
//!   -> (https, kubernetes.default.svc, /api/v1/pods)
//!
//! namespaced service:
//!   `/<cluster>/api/v1/namespaces/<ns>/services/<[https:]name[:port]>/proxy-service/<rest>`
//!   -> (https, <name>.<ns>.svc:<port>, /<rest>)
//!
//! The returned path never contains the query part.

use mctunnel_proto::http::RequestHead;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where a request should be proxied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    /// Host, optionally with an explicit port.
    pub host: String,
    /// Path on the target, without query.
    pub path: String,
}

impl Target {
    /// Dialable `host:port`, filling in the scheme default port when the
    /// host carries none.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.scheme.default_port())
        }
    }

    /// Host without the port, for TLS server name verification.
    pub fn host_name(&self) -> &str {
        match self.host.rfind(':') {
            Some(i) => &self.host[..i],
            None => &self.host,
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid kube-apiserver request path: {0}")]
    InvalidApiPath(String),

    #[error("invalid service proxy request path: {0}")]
    InvalidServicePath(String),

    #[error("invalid service reference: {0}")]
    InvalidService(String),

    #[error("for security reasons only https is supported, unsupported protocol: {0}")]
    UnsupportedScheme(String),
}

/// Resolves the in-cluster target of a tunneled request.
pub trait Router: Send + Sync {
    fn route(&self, head: &RequestHead) -> Result<Target, RouteError>;
}

/// Default router for managed Kubernetes clusters.
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeRouter;

/// Position of the `proxy-service` marker in a namespaced service path.
const SERVICE_MARKER_INDEX: usize = 8;

impl KubeRouter {
    fn is_service_path(segments: &[&str]) -> bool {
        segments.len() > SERVICE_MARKER_INDEX + 1
            && segments[SERVICE_MARKER_INDEX] == "proxy-service"
    }
}

impl Router for KubeRouter {
    fn route(&self, head: &RequestHead) -> Result<Target, RouteError> {
        // Leading slash yields an empty first segment; the second segment
        // is the cluster name, already consumed by the hub for routing.
        let segments: Vec<&str> = head.path().split('/').collect();

        if Self::is_service_path(&segments) {
            let namespace = segments[5];
            let (scheme, service, port) = split_scheme_name_port(segments[7])
                .ok_or_else(|| RouteError::InvalidService(segments[7].to_string()))?;

            if scheme != "https" {
                return Err(RouteError::UnsupportedScheme(scheme.to_string()));
            }

            // The port is appended even when empty, matching the
            // kube-apiserver proxy address convention this grammar
            // comes from.
            return Ok(Target {
                scheme: Scheme::Https,
                host: format!("{service}.{namespace}.svc:{port}"),
                path: format!("/{}", segments[SERVICE_MARKER_INDEX + 1..].join("/")),
            });
        }

        if segments.len() < 3 {
            return Err(RouteError::InvalidApiPath(head.uri.clone()));
        }

        Ok(Target {
            scheme: Scheme::Https,
            host: "kubernetes.default.svc".to_string(),
            path: format!("/{}", segments[2..].join("/")),
        })
    }
}

/// Split a `[scheme:]name[:port]` service reference. Mirrors the
/// kube-apiserver proxy convention: a leading `scheme:` is only recognized
/// when a port is also present.
fn split_scheme_name_port(reference: &str) -> Option<(&str, &str, &str)> {
    let parts: Vec<&str> = reference.split(':').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Some(("", name, "")),
        [name, port] if !name.is_empty() => Some(("", name, port)),
        [scheme, name, port] if !scheme.is_empty() && !name.is_empty() => {
            Some((scheme, name, port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(uri: &str) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            uri: uri.to_string(),
            version: 1,
            headers: vec![],
        }
    }

    #[test]
    fn test_apiserver_route() {
        let target = KubeRouter.route(&head("/cluster-a/api/v1/pods")).unwrap();
        assert_eq!(
            target,
            Target {
                scheme: Scheme::Https,
                host: "kubernetes.default.svc".to_string(),
                path: "/api/v1/pods".to_string(),
            }
        );
    }

    #[test]
    fn test_apiserver_route_strips_query() {
        let target = KubeRouter
            .route(&head("/cluster-a/api/v1/pods?timeout=32s"))
            .unwrap();
        assert_eq!(target.path, "/api/v1/pods");
    }

    #[test]
    fn test_service_route() {
        let target = KubeRouter
            .route(&head(
                "/cluster-a/api/v1/namespaces/monitoring/services/https:thanos:web/proxy-service/metrics/query",
            ))
            .unwrap();
        assert_eq!(
            target,
            Target {
                scheme: Scheme::Https,
                host: "thanos.monitoring.svc:web".to_string(),
                path: "/metrics/query".to_string(),
            }
        );
    }

    #[test]
    fn test_service_route_with_empty_port_keeps_trailing_colon() {
        let target = KubeRouter
            .route(&head(
                "/cluster-a/api/v1/namespaces/ns/services/https:thanos:/proxy-service/x",
            ))
            .unwrap();
        assert_eq!(target.host, "thanos.ns.svc:");
        assert_eq!(target.path, "/x");
    }

    #[test]
    fn test_service_route_requires_https() {
        let err = KubeRouter
            .route(&head(
                "/c/api/v1/namespaces/ns/services/http:plain:80/proxy-service/x",
            ))
            .unwrap_err();
        assert!(matches!(err, RouteError::UnsupportedScheme(_)));
    }

    #[test]
    fn test_service_route_without_scheme_is_rejected() {
        let err = KubeRouter
            .route(&head("/c/api/v1/namespaces/ns/services/plain:80/proxy-service/x"))
            .unwrap_err();
        assert!(matches!(err, RouteError::UnsupportedScheme(_)));
    }

    #[test]
    fn test_too_short_path_is_rejected() {
        let err = KubeRouter.route(&head("/only-cluster")).unwrap_err();
        assert!(matches!(err, RouteError::InvalidApiPath(_)));
    }

    #[test]
    fn test_authority_adds_default_port() {
        let target = Target {
            scheme: Scheme::Https,
            host: "kubernetes.default.svc".to_string(),
            path: "/".to_string(),
        };
        assert_eq!(target.authority(), "kubernetes.default.svc:443");
        assert_eq!(target.host_name(), "kubernetes.default.svc");

        let with_port = Target {
            scheme: Scheme::Http,
            host: "127.0.0.1:9000".to_string(),
            path: "/".to_string(),
        };
        assert_eq!(with_port.authority(), "127.0.0.1:9000");
        assert_eq!(with_port.host_name(), "127.0.0.1");
    }
}
