//! Connection handling and policy enforcement for the xproxy forward proxy.
//!
//! `xproxy-engine` accepts plaintext HTTP requests and HTTPS `CONNECT` tunnel
//! requests, applies a hot-reloadable domain blocklist and hostname redirect
//! table, and relays bytes between client and origin with pooled buffers and
//! per-operation timeouts.
//!
//! # Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ForwardProxy (accept loop, one task per connection)
//!   |
//!   +-- first read starts with "CONNECT"?
//!   |      |
//!   |      +-- yes --> Tunnel handler
//!   |      |             redirect -> block check -> dial -> "200" -> two pipes
//!   |      |
//!   |      +-- no  --> HTTP forward handler
//!   |                    Host header -> redirect -> block check -> rewrite
//!   |                    -> dial -> forward request -> one pipe back
//!   |
//!   +-- PolicyStore (blocklist + redirect snapshots, swapped on reload)
//! ```
//!
//! # Components
//!
//! - [`PolicyStore`]: Blocklist and redirect snapshots with independent reload locks
//! - [`BufferPool`] and [`pipe`]: Bounded byte forwarding between two streams
//! - [`ForwardProxy`]: Accept loop, classifier and per-connection dispatch
//! - [`ProxyServer`]: Binds the listener and hands back a [`ProxyHandle`]
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use xproxy_engine::{PolicyStore, ProxyConfig, ProxyServer};
//!
//! let store = Arc::new(PolicyStore::load(source));
//! let handle = ProxyServer::new(ProxyConfig::default(), store)?.start().await?;
//! // ... later ...
//! handle.shutdown().await?;
//! ```

mod http;
mod pipe;
mod policy;
mod proxy;
mod request;
mod server;
mod tunnel;

pub use pipe::{pipe, Activity, BufferPool, PipeEnd, PipeOutcome, PooledBuffer};
pub use policy::{Blocklist, PolicySource, PolicyStore, RedirectTable};
pub use proxy::{ForwardProxy, ProxyConfig, ProxyStats, StatsSnapshot};
pub use request::{ConnectTarget, HostHeader, RequestKind};
pub use server::{ProxyHandle, ProxyServer};

use std::net::SocketAddr;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Request could not be parsed far enough to find a destination.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Connecting to the origin failed.
    #[error("TCP connection to {target} failed: {source}")]
    TcpConnection {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// A read or write did not complete within its timeout.
    #[error("Timed out while {0}")]
    Timeout(&'static str),

    /// The policy source could not produce a snapshot.
    #[error("Failed to load policy: {0}")]
    PolicyLoad(String),

    /// Client-side I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fixed response sent when the destination is blocked.
pub const FORBIDDEN_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\
Content-Type: text/html\r\n\
Connection: close\r\n\
\r\n\
<html><body><h1>403 Forbidden</h1><p>Access Denied by XProxy</p></body></html>";

/// Response sent once the origin of a `CONNECT` tunnel is reachable.
pub const CONNECT_ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
