//! HTTP/1.x request-head parsing and serialization using httparse.
//!
//! The hub reads exactly one request head from a client socket before the
//! connection degrades into an opaque byte pipe, and the agent-side proxy
//! re-parses the head the hub serialized. The serialized form preserves the
//! original request line (including the HTTP version, which protocols like
//! SPDY rely on) and the original header order.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum number of headers to parse.
const MAX_HEADERS: usize = 100;

/// Upper bound on the size of a request head.
const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("request head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("connection closed before a complete request head was received")]
    UnexpectedEof,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed HTTP/1.x request head.
///
/// Headers keep their original order so the serialized form stays as close
/// to what the client sent as possible.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// HTTP method (GET, POST, ...).
    pub method: String,
    /// Request target as sent by the client, including any query string.
    pub uri: String,
    /// HTTP minor version (0 for HTTP/1.0, 1 for HTTP/1.1).
    pub version: u8,
    /// Request headers in original order.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Try to parse a request head from `buf`.
    ///
    /// Returns `Ok(Some((head, header_len)))` when the head is complete,
    /// `Ok(None)` when more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buf)? {
            httparse::Status::Complete(header_len) => {
                let parsed_headers = req
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).to_string(),
                        )
                    })
                    .collect();

                Ok(Some((
                    RequestHead {
                        method: req.method.unwrap_or("").to_string(),
                        uri: req.path.unwrap_or("").to_string(),
                        version: req.version.unwrap_or(1),
                        headers: parsed_headers,
                    },
                    header_len,
                )))
            }
            httparse::Status::Partial => Ok(None),
        }
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace a header value, appending the header if absent.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.headers.push((name.to_string(), value));
        }
    }

    /// Append a header without replacing existing values.
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    /// Value of the Host header, if present.
    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Authority of an absolute-form request target, if the client used
    /// one (`GET http://host:port/path HTTP/1.1`).
    pub fn uri_host(&self) -> Option<&str> {
        let rest = self
            .uri
            .strip_prefix("http://")
            .or_else(|| self.uri.strip_prefix("https://"))?;
        let end = rest.find(['/', '?']).unwrap_or(rest.len());
        (end > 0).then(|| &rest[..end])
    }

    /// The request path without the query string.
    pub fn path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    /// The query string, if any, without the leading '?'.
    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }

    /// Replace the path, preserving the original query string.
    pub fn set_path(&mut self, path: &str) {
        self.uri = match self.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        };
    }

    /// Serialize the head back to wire form.
    ///
    /// Emits the original request line and headers, synthesizing a Host
    /// header from `fallback_host` when the client did not send one.
    pub fn serialize(&self, fallback_host: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.uri, self.version).as_bytes(),
        );

        if self.host().is_none() && !fallback_host.is_empty() {
            out.extend_from_slice(format!("Host: {fallback_host}\r\n").as_bytes());
        }

        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }

        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Read a complete request head from `reader`.
///
/// Returns the parsed head together with any body bytes that were already
/// buffered past the end of the head. The caller forwards those bytes
/// verbatim; nothing beyond the head is interpreted here.
pub async fn read_head<R>(reader: &mut R) -> Result<(RequestHead, Vec<u8>), HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::UnexpectedEof);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((head, header_len)) = RequestHead::parse(&buf)? {
            let leftover = buf.split_off(header_len);
            return Ok((head, leftover));
        }

        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }
    }
}
