//! Connection acceptor and per-connection dispatch.
//!
//! # Connection Flow
//!
//! ```text
//! Client connects to proxy
//!         |
//!         v
//! One bounded read (io_timeout, cancellable)
//!         |
//!         +-- 0 bytes --> peer closed, exit silently
//!         |
//!         v
//! RequestKind::classify(first read)
//!         |
//!         +-- Tunnel --> tunnel::handle (CONNECT host:port)
//!         |
//!         +-- Http   --> http::handle (Host header)
//! ```
//!
//! Every accepted connection runs in its own task. A failing connection is
//! logged and dropped; it never stops the accept loop.

use crate::pipe::BufferPool;
use crate::request::RequestKind;
use crate::{http, tunnel, PolicyStore, ProxyError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Idle buffers kept in the pool for reuse.
const POOL_MAX_IDLE: usize = 64;

/// Pause after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration for the forward proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    /// Default: `0.0.0.0:8080`
    pub bind_addr: SocketAddr,

    /// Listen backlog.
    /// Default: 500
    pub backlog: u32,

    /// Send and receive buffer size for client, origin and listening sockets.
    /// Default: 512 KiB
    pub socket_buffer_size: usize,

    /// Size of each pooled buffer (first read and pipe chunk).
    /// Default: 256 KiB
    pub chunk_size: usize,

    /// Timeout applied to each individual read or write.
    /// Default: 30 seconds
    pub io_timeout: Duration,

    /// Timeout for resolving and connecting to an origin.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Maximum concurrent connections; `None` accepts without limit.
    /// Default: `None`
    pub max_connections: Option<usize>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backlog: 500,
            socket_buffer_size: 512 * 1024,
            chunk_size: 256 * 1024,
            io_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            max_connections: None,
        }
    }
}

/// Live counters for the proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub accepted: AtomicU64,
    pub active: AtomicUsize,
    pub rejected: AtomicU64,
    pub tunnels: AtomicU64,
    pub http_forwards: AtomicU64,
    pub blocked: AtomicU64,
    pub redirected: AtomicU64,
    pub dial_attempts: AtomicU64,
    pub dial_failures: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: usize,
    pub rejected: u64,
    pub tunnels: u64,
    pub http_forwards: u64,
    pub blocked: u64,
    pub redirected: u64,
    pub dial_attempts: u64,
    pub dial_failures: u64,
}

impl ProxyStats {
    /// Read all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            tunnels: self.tunnels.load(Ordering::Relaxed),
            http_forwards: self.http_forwards.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            redirected: self.redirected.load(Ordering::Relaxed),
            dial_attempts: self.dial_attempts.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decrements the active connection count when the handling task ends,
/// including on panic.
struct ActiveGuard(Arc<ProxyContext>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// State shared by every connection handler.
pub(crate) struct ProxyContext {
    pub(crate) config: ProxyConfig,
    pub(crate) store: Arc<PolicyStore>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) stats: Arc<ProxyStats>,
}

impl ProxyContext {
    /// Write `bytes` and flush, bounded by the I/O timeout.
    pub(crate) async fn write_all<W>(&self, stream: &mut W, bytes: &[u8], what: &'static str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let write = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match tokio::time::timeout(self.config.io_timeout, write).await {
            Ok(result) => result.map_err(ProxyError::from),
            Err(_) => Err(ProxyError::Timeout(what)),
        }
    }

    /// Resolve `host` and connect to the first reachable address.
    ///
    /// # Errors
    /// * `ProxyError::TcpConnection` - Resolution failed, no address accepted
    ///   the connection, or the connect timeout elapsed.
    pub(crate) async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        ProxyStats::bump(&self.stats.dial_attempts);
        match self.try_dial(host, port).await {
            Ok(stream) => Ok(stream),
            Err(source) => {
                ProxyStats::bump(&self.stats.dial_failures);
                Err(ProxyError::TcpConnection {
                    target: format!("{host}:{port}"),
                    source,
                })
            }
        }
    }

    async fn try_dial(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        let timeout = self.config.connect_timeout;
        let addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((host, port)))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "name resolution timed out")
            })??;

        let buffer_size = u32::try_from(self.config.socket_buffer_size).unwrap_or(u32::MAX);
        let mut last_err = None;
        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            // Best-effort sizing; the OS may clamp or refuse it.
            let _ = socket.set_send_buffer_size(buffer_size);
            let _ = socket.set_recv_buffer_size(buffer_size);

            match tokio::time::timeout(timeout, socket.connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => {
                    last_err = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connection timed out",
                    ))
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
        }))
    }
}

/// Forward proxy for plain HTTP and `CONNECT` tunnels.
pub struct ForwardProxy {
    ctx: Arc<ProxyContext>,
}

impl ForwardProxy {
    /// Create a new forward proxy.
    ///
    /// # Arguments
    /// * `config` - Proxy configuration
    /// * `store` - Blocklist and redirect policy
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`. The `Result` return type
    /// is present for forward compatibility.
    pub fn new(config: ProxyConfig, store: Arc<PolicyStore>) -> Result<Self> {
        let pool = BufferPool::new(config.chunk_size, POOL_MAX_IDLE);
        Ok(Self {
            ctx: Arc::new(ProxyContext {
                config,
                store,
                pool,
                stats: Arc::new(ProxyStats::default()),
            }),
        })
    }

    /// Live counters.
    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Buffer pool shared by all connections.
    pub fn pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.ctx.pool)
    }

    /// Bind the configured address and accept connections until `shutdown`.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - If binding to `config.bind_addr` fails.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = bind_listener(&self.ctx.config)?;
        self.run_on(listener, shutdown).await
    }

    /// Accept connections on a pre-bound listener until `shutdown` fires.
    ///
    /// Each connection gets a child of `shutdown`, so cancelling it also
    /// unblocks every in-flight read and pipe.
    ///
    /// # Errors
    /// Currently infallible; accept errors are logged and retried.
    pub async fn run_on(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            let (client, client_addr) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(error = %e, "TCP accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            // Check connection limit
            if let Some(max) = self.ctx.config.max_connections {
                if self.ctx.stats.active.load(Ordering::Relaxed) >= max {
                    ProxyStats::bump(&self.ctx.stats.rejected);
                    warn!(client = %client_addr, "Connection limit reached, rejecting");
                    drop(client);
                    continue;
                }
            }

            ProxyStats::bump(&self.ctx.stats.accepted);
            self.ctx.stats.active.fetch_add(1, Ordering::Relaxed);
            let guard = ActiveGuard(Arc::clone(&self.ctx));
            let cancel = shutdown.child_token();

            tokio::spawn(async move {
                let ctx = Arc::clone(&guard.0);
                match handle_connection(&ctx, client, cancel).await {
                    Ok(()) => {}
                    Err(ProxyError::MalformedRequest(reason)) => {
                        debug!(client = %client_addr, reason = %reason, "Malformed request, closing");
                    }
                    Err(e) => warn!(client = %client_addr, error = %e, "Connection error"),
                }
                drop(guard);
            });
        }
    }
}

/// Handle a single client connection.
///
/// # Behavior
/// 1. Tune the client socket
/// 2. Read the first chunk (bounded, with timeout, cancellable)
/// 3. Classify and dispatch to the tunnel or HTTP handler
async fn handle_connection(
    ctx: &ProxyContext,
    mut client: TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    tune_client(&client, ctx.config.socket_buffer_size);

    let mut buffer = ctx.pool.rent();
    let n = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        read = tokio::time::timeout(ctx.config.io_timeout, client.read(&mut buffer)) => {
            read.map_err(|_| ProxyError::Timeout("reading the request"))??
        }
    };
    if n == 0 {
        return Ok(());
    }

    let request = &buffer[..n];
    match RequestKind::classify(request) {
        RequestKind::Tunnel => tunnel::handle(ctx, client, request, cancel).await,
        RequestKind::Http => http::handle(ctx, client, request, cancel).await,
    }
}

fn tune_client(client: &TcpStream, buffer_size: usize) {
    // Best-effort; a socket that refuses tuning still works.
    let _ = client.set_nodelay(true);
    let sock = socket2::SockRef::from(client);
    let _ = sock.set_recv_buffer_size(buffer_size);
    let _ = sock.set_send_buffer_size(buffer_size);
}

/// Create the listening socket: reuse-address, no-delay, sized buffers,
/// configured backlog.
///
/// # Errors
/// * `ProxyError::Bind` - Socket creation, bind or listen failed.
pub(crate) fn bind_listener(config: &ProxyConfig) -> Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let addr = config.bind_addr;
    let bind_err = |source: std::io::Error| ProxyError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    // TCP tuning, inherited by accepted sockets on most platforms
    let _ = socket.set_nodelay(true);
    let _ = socket.set_recv_buffer_size(config.socket_buffer_size);
    let _ = socket.set_send_buffer_size(config.socket_buffer_size);

    socket.bind(&addr.into()).map_err(bind_err)?;
    let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(bind_err)?;

    let listener = TcpListener::from_std(socket.into()).map_err(bind_err)?;
    info!(addr = %listener.local_addr().unwrap_or(addr), "Proxy listening");
    Ok(listener)
}
