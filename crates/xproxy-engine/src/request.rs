//! Just enough request parsing to find a destination.
//!
//! The proxy never parses a full HTTP message. It needs:
//! - whether the first read is a `CONNECT` (tunnel) or anything else (plain HTTP)
//! - the `host:port` authority of a `CONNECT` request line
//! - the first `Host:` header of a plain HTTP request, and where it sits in
//!   the buffer so the host can be replaced in place

use crate::{ProxyError, Result};
use std::ops::Range;

/// Default port for plain HTTP when the `Host` header has none.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// How a new connection is handled, decided from its first read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `CONNECT host:port`: open an opaque tunnel.
    Tunnel,
    /// Anything else: forward as a single plain HTTP request.
    Http,
}

impl RequestKind {
    /// Classify the first bytes received from a client.
    pub fn classify(data: &[u8]) -> Self {
        if data.starts_with(b"CONNECT") {
            RequestKind::Tunnel
        } else {
            RequestKind::Http
        }
    }
}

/// Destination of a `CONNECT` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    /// Offset of the first byte after the request header block, if the
    /// header terminator was seen in this read.
    pub header_end: Option<usize>,
}

impl ConnectTarget {
    /// Parse `CONNECT host:port HTTP/1.1` from the first line of `data`.
    ///
    /// # Errors
    /// * `ProxyError::MalformedRequest` - Missing authority, missing or extra
    ///   `:` separator, empty host, or non-numeric port.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(data);
        let first_line = text.split('\n').next().unwrap_or_default();
        let first_line = first_line.strip_suffix('\r').unwrap_or(first_line);

        let authority = first_line
            .split(' ')
            .nth(1)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("CONNECT line has no authority"))?;

        let mut parts = authority.split(':');
        let (host, port) = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) => (host, port),
            _ => return Err(malformed("CONNECT authority is not host:port")),
        };
        if host.is_empty() {
            return Err(malformed("CONNECT authority has an empty host"));
        }
        let port = parse_port(port)?;

        Ok(Self {
            host: host.to_string(),
            port,
            header_end: find_header_end(data),
        })
    }
}

/// The first `Host:` header of a plain HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostHeader {
    pub host: String,
    pub port: u16,
    /// Byte range of the host name (without port) inside the request buffer.
    host_span: Range<usize>,
}

impl HostHeader {
    /// Find the first `Host:` header (name matched case-insensitively).
    ///
    /// Scanning stops at the blank line ending the header block. A value
    /// without `:port` defaults to port 80.
    ///
    /// # Errors
    /// * `ProxyError::MalformedRequest` - No `Host` header, empty host,
    ///   non-UTF-8 value, or non-numeric port.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut line_start = 0;
        for raw_line in data.split(|b| *b == b'\n') {
            let start = line_start;
            line_start += raw_line.len() + 1;

            let line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
            if line.is_empty() {
                break;
            }
            if line.len() < 5 || !line[..5].eq_ignore_ascii_case(b"host:") {
                continue;
            }

            let value = &line[5..];
            let leading = value.iter().take_while(|b| b.is_ascii_whitespace()).count();
            let trailing = value
                .iter()
                .rev()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            let value = &value[leading..value.len().saturating_sub(trailing).max(leading)];
            let value = std::str::from_utf8(value).map_err(|_| malformed("Host header is not UTF-8"))?;

            let (host, port) = match value.split_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (value, DEFAULT_HTTP_PORT),
            };
            if host.is_empty() {
                return Err(malformed("Host header is empty"));
            }

            let host_start = start + 5 + leading;
            return Ok(Self {
                host: host.to_string(),
                port,
                host_span: host_start..host_start + host.len(),
            });
        }

        Err(malformed("request has no Host header"))
    }

    /// Copy of `request` with this header's host replaced by `new_host`.
    ///
    /// Only the host name is replaced; an explicit `:port` and every other
    /// byte of the request are kept as received. The result is never
    /// truncated, even when `new_host` is longer than the original.
    pub fn rewrite(&self, request: &[u8], new_host: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(request.len() + new_host.len());
        out.extend_from_slice(&request[..self.host_span.start]);
        out.extend_from_slice(new_host.as_bytes());
        out.extend_from_slice(&request[self.host_span.end..]);
        out
    }
}

/// Offset just past the first `\r\n\r\n`, if present.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_port(port: &str) -> Result<u16> {
    port.trim()
        .parse::<u16>()
        .map_err(|_| malformed("port is not numeric"))
}

fn malformed(reason: &str) -> ProxyError {
    ProxyError::MalformedRequest(reason.to_string())
}
