//! One-directional byte forwarding with pooled buffers.
//!
//! A pipe reads up to one chunk from the source, writes exactly those bytes
//! to the destination and flushes, until one of:
//!
//! ```text
//! source read returns 0       --> PipeEnd::Eof
//! read or write fails         --> PipeEnd::Error
//! connection idle for timeout --> PipeEnd::Timeout
//! cancellation token fires    --> PipeEnd::Cancelled
//! ```
//!
//! Pipes serving the same connection share an [`Activity`] clock, so a
//! silent direction keeps waiting while the other one is moving bytes.
//!
//! None of these is an error for the caller. The chunk buffer is rented
//! from a [`BufferPool`] and returned when the pipe future completes or is
//! dropped.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Pool of fixed-size byte buffers shared by all connections.
///
/// Idle buffers are retained up to `max_idle`; beyond that, returned
/// buffers are freed.
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            max_idle,
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Rent a buffer. It goes back to the pool when the guard is dropped.
    pub fn rent(self: &Arc<Self>) -> PooledBuffer {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let buf = reused.unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently rented.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Number of buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn give_back(&self, buf: Box<[u8]>) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
        drop(idle);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A buffer rented from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

/// Last time any pipe of a connection moved bytes.
#[derive(Debug)]
pub struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record progress now.
    pub fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last recorded progress.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a pipe stopped forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    /// Source reached end of stream.
    Eof,
    /// Read or write failed.
    Error(std::io::ErrorKind),
    /// The connection moved no bytes within the I/O timeout, or a write
    /// stalled for that long.
    Timeout,
    /// Shutdown was requested.
    Cancelled,
}

/// Result of running a pipe to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOutcome {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Why forwarding stopped.
    pub end: PipeEnd,
}

/// Forward bytes from `source` to `destination` until EOF, error, timeout
/// or cancellation.
///
/// A read waits as long as `activity` shows progress within `io_timeout`;
/// each write+flush is bounded by `io_timeout` on its own.
pub async fn pipe<R, W>(
    source: &mut R,
    destination: &mut W,
    pool: &Arc<BufferPool>,
    io_timeout: Duration,
    activity: &Activity,
    cancel: &CancellationToken,
) -> PipeOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = pool.rent();
    let mut bytes = 0u64;

    let end = 'forward: loop {
        let n = loop {
            let wait = io_timeout.saturating_sub(activity.idle_for());
            if wait.is_zero() {
                break 'forward PipeEnd::Timeout;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'forward PipeEnd::Cancelled,
                read = tokio::time::timeout(wait, source.read(&mut buf)) => match read {
                    Ok(Ok(0)) => break 'forward PipeEnd::Eof,
                    Ok(Ok(n)) => break n,
                    Ok(Err(e)) => break 'forward PipeEnd::Error(e.kind()),
                    // Re-check: the other direction may have moved bytes.
                    Err(_) => continue,
                },
            }
        };
        activity.touch();

        let write = async {
            destination.write_all(&buf[..n]).await?;
            destination.flush().await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break PipeEnd::Cancelled,
            written = tokio::time::timeout(io_timeout, write) => match written {
                Ok(Ok(())) => bytes += n as u64,
                Ok(Err(e)) => break PipeEnd::Error(e.kind()),
                Err(_) => break PipeEnd::Timeout,
            },
        }
        activity.touch();
    };

    PipeOutcome { bytes, end }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    // ========================================================================
    // BufferPool Tests
    // ========================================================================

    #[test]
    fn test_pool_rent_has_configured_size() {
        let pool = BufferPool::new(1024, 4);
        let buf = pool.rent();
        assert_eq!(buf.len(), 1024);
        assert_eq!(pool.buffer_size(), 1024);
    }

    #[test]
    fn test_pool_tracks_outstanding() {
        let pool = BufferPool::new(16, 4);
        let a = pool.rent();
        let b = pool.rent();
        assert_eq!(pool.outstanding(), 2);
        drop(a);
        assert_eq!(pool.outstanding(), 1);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let pool = BufferPool::new(16, 4);
        let mut first = pool.rent();
        first[0] = 42;
        drop(first);
        let again = pool.rent();
        assert_eq!(again[0], 42);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pool_caps_idle_buffers() {
        let pool = BufferPool::new(16, 1);
        let a = pool.rent();
        let b = pool.rent();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    // ========================================================================
    // Pipe Tests
    // ========================================================================

    #[tokio::test]
    async fn test_pipe_forwards_until_eof() {
        let pool = BufferPool::new(4, 4);
        let cancel = CancellationToken::new();
        let mut source: &[u8] = b"hello, world";
        let mut destination = Vec::new();

        let outcome = pipe(
            &mut source,
            &mut destination,
            &pool,
            Duration::from_secs(5),
            &Activity::new(),
            &cancel,
        )
        .await;

        assert_eq!(outcome.end, PipeEnd::Eof);
        assert_eq!(outcome.bytes, 12);
        assert_eq!(destination, b"hello, world");
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_pipe_stops_on_cancellation() {
        let pool = BufferPool::new(64, 4);
        let cancel = CancellationToken::new();
        // Keep the writer half open so the read never sees EOF.
        let (_writer, mut reader) = duplex(64);
        let mut destination = Vec::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = pipe(
            &mut reader,
            &mut destination,
            &pool,
            Duration::from_secs(30),
            &Activity::new(),
            &cancel,
        )
        .await;

        assert_eq!(outcome.end, PipeEnd::Cancelled);
        assert_eq!(outcome.bytes, 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_pipe_stops_on_idle_timeout() {
        let pool = BufferPool::new(64, 4);
        let cancel = CancellationToken::new();
        let (_writer, mut reader) = duplex(64);
        let mut destination = Vec::new();

        let outcome = pipe(
            &mut reader,
            &mut destination,
            &pool,
            Duration::from_millis(20),
            &Activity::new(),
            &cancel,
        )
        .await;

        assert_eq!(outcome.end, PipeEnd::Timeout);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_pipe_silent_source_waits_while_connection_active() {
        let pool = BufferPool::new(64, 4);
        let cancel = CancellationToken::new();
        let activity = Activity::new();
        let (_writer, mut reader) = duplex(64);
        let mut destination = Vec::new();

        let silent = pipe(
            &mut reader,
            &mut destination,
            &pool,
            Duration::from_millis(100),
            &activity,
            &cancel,
        );
        tokio::pin!(silent);

        // Progress elsewhere on the connection for well past the timeout.
        for _ in 0..6 {
            let waited =
                tokio::time::timeout(Duration::from_millis(50), silent.as_mut()).await;
            assert!(waited.is_err(), "silent pipe ended while connection was active");
            activity.touch();
        }

        let outcome = silent.await;
        assert_eq!(outcome.end, PipeEnd::Timeout);
        assert!(activity.idle_for() >= Duration::from_millis(100));
    }

    #[test]
    fn test_activity_touch_resets_idle_time() {
        let activity = Activity::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(activity.idle_for() >= Duration::from_millis(30));
        activity.touch();
        assert!(activity.idle_for() < Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_pipe_stops_on_write_error() {
        let pool = BufferPool::new(64, 4);
        let cancel = CancellationToken::new();
        let mut source: &[u8] = b"payload";
        let (dest_writer, dest_reader) = duplex(64);
        drop(dest_reader);
        let mut dest_writer = dest_writer;

        let outcome = pipe(
            &mut source,
            &mut dest_writer,
            &pool,
            Duration::from_secs(5),
            &Activity::new(),
            &cancel,
        )
        .await;

        assert!(matches!(outcome.end, PipeEnd::Error(_)));
        assert_eq!(outcome.bytes, 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_pipe_dropped_midway_returns_buffer() {
        let pool = BufferPool::new(64, 4);
        let cancel = CancellationToken::new();
        let (_writer, mut reader) = duplex(64);
        let mut destination = Vec::new();
        let activity = Activity::new();

        {
            let fut = pipe(
                &mut reader,
                &mut destination,
                &pool,
                Duration::from_secs(30),
                &activity,
                &cancel,
            );
            tokio::pin!(fut);
            let polled =
                tokio::time::timeout(Duration::from_millis(10), fut.as_mut()).await;
            assert!(polled.is_err());
            assert_eq!(pool.outstanding(), 1);
        }

        assert_eq!(pool.outstanding(), 0);
    }
}
