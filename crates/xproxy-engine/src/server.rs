//! Proxy server lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//! ProxyServer::new(config, store)
//!       |
//!       v
//! ProxyServer::start() --> ProxyHandle
//!       |                       |
//!       v                       |
//! Bind listener, spawn          |
//! accept loop                   |
//!       |                       v
//!       |               ProxyHandle::shutdown()
//!       |                       |  (cancels the root token; every
//!       |                       |   connection holds a child token)
//!       v                       v
//! Accept loop and in-flight pipes stop <--+
//! ```

use crate::proxy::bind_listener;
use crate::{BufferPool, ForwardProxy, PolicyStore, ProxyConfig, ProxyError, ProxyStats, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How long `shutdown` waits for the accept loop to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    /// Root cancellation token.
    shutdown: CancellationToken,

    /// Join handle for the accept loop.
    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,

    /// Actual listening address (port resolved if 0 was requested).
    proxy_addr: SocketAddr,

    store: Arc<PolicyStore>,
    stats: Arc<ProxyStats>,
    pool: Arc<BufferPool>,
}

impl ProxyHandle {
    /// Check if the server is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Get the proxy listening address.
    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Policy store used by the running server; reload it in place.
    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Live counters.
    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Buffer pool shared by all connections.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Token cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait until the accept loop ends on its own.
    ///
    /// Returns immediately if it already ended and was awaited before.
    ///
    /// # Errors
    /// Whatever error the accept loop returned.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.join_handle.as_mut() else {
            return Ok(());
        };
        let result = handle.await;
        self.join_handle = None;
        match result {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Io(std::io::Error::other(e))),
        }
    }

    /// Shut down the proxy server.
    ///
    /// Cancels the root token, which stops the accept loop and unblocks every
    /// in-flight read, write and pipe.
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`. If the accept loop does not
    /// finish within 2 seconds it is left to finish on its own.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();

        if let Some(handle) = self.join_handle.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(_)) => {} // Task panicked, already reported by the runtime
                Err(_) => warn!("Proxy did not stop within the shutdown grace period"),
            }
        }

        Ok(())
    }
}

/// Forward proxy server.
pub struct ProxyServer {
    /// Server configuration.
    config: ProxyConfig,

    /// Blocklist and redirect policy.
    store: Arc<PolicyStore>,
}

impl ProxyServer {
    /// Create a new proxy server.
    ///
    /// # Arguments
    /// * `config` - Server configuration
    /// * `store` - Policy shared with whoever triggers reloads
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`. The `Result` return type
    /// is present for forward compatibility.
    ///
    /// # Example
    /// ```ignore
    /// let server = ProxyServer::new(ProxyConfig::default(), store)?;
    /// let handle = server.start().await?;
    /// // ... later ...
    /// handle.shutdown().await?;
    /// ```
    pub fn new(config: ProxyConfig, store: Arc<PolicyStore>) -> Result<Self> {
        Ok(Self { config, store })
    }

    /// Start the proxy server.
    ///
    /// The listener is bound before this returns, so the actual port is known
    /// immediately and bind failures surface here.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - If binding the listener fails (e.g. address
    ///   already in use).
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = bind_listener(&self.config)?;
        let proxy_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: self.config.bind_addr,
            source: e,
        })?;

        let proxy = ForwardProxy::new(self.config, Arc::clone(&self.store))?;
        let stats = proxy.stats();
        let pool = proxy.pool();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let join_handle = tokio::spawn(async move { proxy.run_on(listener, token).await });

        Ok(ProxyHandle {
            shutdown,
            join_handle: Some(join_handle),
            proxy_addr,
            store: self.store,
            stats,
            pool,
        })
    }

    /// Run the proxy server until `shutdown` is cancelled.
    ///
    /// Alternative to `start()` for blocking operation.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - If binding to the configured address fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let proxy = ForwardProxy::new(self.config, self.store)?;
        proxy.run(shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tests::store;
    use crate::FORBIDDEN_RESPONSE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn can_bind_tcp_localhost() -> bool {
        match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
            Err(err) => panic!("Failed to bind TCP localhost for test: {err}"),
        }
    }

    macro_rules! skip_if_no_bind {
        () => {
            if !can_bind_tcp_localhost() {
                return;
            }
        };
    }

    fn local_config() -> ProxyConfig {
        ProxyConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            chunk_size: 16 * 1024,
            ..Default::default()
        }
    }

    async fn start_local(blocklist: &[&str]) -> ProxyHandle {
        ProxyServer::new(local_config(), store(blocklist, &[]))
            .unwrap()
            .start()
            .await
            .unwrap()
    }

    // ========================================================================
    // ProxyHandle Tests
    // ========================================================================

    #[tokio::test]
    async fn test_proxy_handle_is_running_true() {
        skip_if_no_bind!();
        let handle = start_local(&[]).await;

        assert!(handle.is_running());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_proxy_handle_proxy_addr_resolves_port() {
        skip_if_no_bind!();
        let handle = start_local(&[]).await;

        let addr = handle.proxy_addr();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert!(TcpStream::connect(addr).await.is_ok());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_proxy_handle_store_reload_is_live() {
        skip_if_no_bind!();
        let handle = start_local(&["blocked.test"]).await;

        assert!(handle.store().is_blocked("blocked.test"));
        assert_eq!(handle.store().reload_blocklist().unwrap(), 1);
        assert!(handle.store().is_blocked("www.blocked.test"));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_proxy_handle_wait_returns_after_cancel() {
        skip_if_no_bind!();
        let mut handle = start_local(&[]).await;

        handle.shutdown_token().cancel();
        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("accept loop did not stop")
            .unwrap();
        assert!(!handle.is_running());

        handle.shutdown().await.unwrap();
    }

    // ========================================================================
    // ProxyServer Lifecycle Tests
    // ========================================================================

    #[tokio::test]
    async fn test_proxy_server_serves_blocked_response() {
        skip_if_no_bind!();
        let handle = start_local(&["blocked.test"]).await;

        let mut client = TcpStream::connect(handle.proxy_addr()).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: blocked.test\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response, FORBIDDEN_RESPONSE);
        assert_eq!(handle.stats().snapshot().blocked, 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_proxy_server_shutdown_stops_accepting() {
        skip_if_no_bind!();
        let handle = start_local(&[]).await;
        let addr = handle.proxy_addr();

        handle.shutdown().await.unwrap();

        // Listener is dropped with the accept loop.
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_proxy_server_shutdown_closes_idle_clients() {
        skip_if_no_bind!();
        let handle = start_local(&[]).await;
        let pool = Arc::clone(handle.pool());
        let stats = Arc::clone(handle.stats());

        let mut idle = TcpStream::connect(handle.proxy_addr()).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while stats.snapshot().active == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await.unwrap();

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), idle.read_to_end(&mut rest))
            .await
            .expect("client was not closed on shutdown")
            .unwrap();
        assert!(rest.is_empty());
        while stats.snapshot().active > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_proxy_server_run_until_cancelled() {
        skip_if_no_bind!();
        let server = ProxyServer::new(local_config(), store(&[], &[])).unwrap();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let task = tokio::spawn(async move { server.run(token).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    // ========================================================================
    // Error Handling Tests
    // ========================================================================

    #[tokio::test]
    async fn test_start_proxy_port_in_use() {
        skip_if_no_bind!();
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap();

        let config = ProxyConfig {
            bind_addr: taken,
            ..local_config()
        };
        let server = ProxyServer::new(config, store(&[], &[])).unwrap();
        // start() binds before spawning; the error surfaces immediately.
        let result = server.start().await;
        assert!(matches!(result, Err(ProxyError::Bind { .. })));
    }
}
