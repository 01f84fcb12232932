//! Request processing hook.
//!
//! A [`RequestProcessor`] runs between routing and proxying. Deployments
//! use it for authentication and header rewriting (token review,
//! impersonation headers); the tunnel core only cares that it either
//! passes the request through or rejects it with a status code.

use async_trait::async_trait;
use mctunnel_proto::http::RequestHead;
use thiserror::Error;

/// A rejected request, rendered by the proxy with this status and message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessError {
    pub status: u16,
    pub message: String,
}

impl ProcessError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, message)
    }
}

#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Authenticate and optionally rewrite the request before it is
    /// proxied to `target_host`.
    async fn process(&self, target_host: &str, head: &mut RequestHead)
        -> Result<(), ProcessError>;
}

/// Forwards every request unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughProcessor;

#[async_trait]
impl RequestProcessor for PassthroughProcessor {
    async fn process(
        &self,
        _target_host: &str,
        _head: &mut RequestHead,
    ) -> Result<(), ProcessError> {
        Ok(())
    }
}
