//! Cluster name extraction from inbound requests.

use mctunnel_proto::http::RequestHead;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParseClusterError(pub String);

/// Extracts the target cluster from an inbound request. Deployments with
/// different URL schemes inject their own implementation.
pub trait ClusterNameParser: Send + Sync {
    fn parse(&self, head: &RequestHead) -> Result<String, ParseClusterError>;
}

/// Default parser: the first non-empty path segment names the cluster.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathClusterNameParser;

impl ClusterNameParser for PathClusterNameParser {
    fn parse(&self, head: &RequestHead) -> Result<String, ParseClusterError> {
        head.path()
            .split('/')
            .find(|segment| !segment.is_empty())
            .map(|segment| segment.to_string())
            .ok_or_else(|| {
                ParseClusterError(format!(
                    "request path does not contain a cluster name: {}",
                    head.uri
                ))
            })
    }
}
