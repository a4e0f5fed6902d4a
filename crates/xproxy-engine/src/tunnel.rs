//! HTTPS `CONNECT` tunnels.
//!
//! ```text
//! CONNECT host:port
//!     |
//!     v
//! redirect lookup --> block check --blocked--> 403, close
//!     |
//!     v
//! dial origin --> "200 Connection established"
//!     |
//!     v
//! client <==pipe==> origin   (first pipe to end closes both,
//!                             idle only when neither side moves bytes)
//! ```

use crate::pipe::{pipe, Activity};
use crate::proxy::{ProxyContext, ProxyStats};
use crate::request::ConnectTarget;
use crate::{Result, CONNECT_ESTABLISHED_RESPONSE, FORBIDDEN_RESPONSE};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Serve a `CONNECT` request whose first chunk is `request`.
///
/// Bytes the client sent after the request's blank line are forwarded to the
/// origin before relaying starts.
///
/// # Errors
/// * `ProxyError::MalformedRequest` - The target could not be parsed.
/// * `ProxyError::TcpConnection` - The origin was unreachable.
pub(crate) async fn handle(
    ctx: &ProxyContext,
    mut client: TcpStream,
    request: &[u8],
    cancel: CancellationToken,
) -> Result<()> {
    let target = ConnectTarget::parse(request)?;
    let host = ctx.store.lookup_redirect(&target.host);
    let redirected = host != target.host;
    if redirected {
        ProxyStats::bump(&ctx.stats.redirected);
    }

    if ctx.store.is_blocked(&host) {
        ProxyStats::bump(&ctx.stats.blocked);
        info!(host = %host, port = target.port, "Blocked HTTPS");
        ctx.write_all(&mut client, FORBIDDEN_RESPONSE, "sending the blocked response")
            .await?;
        return Ok(());
    }

    let mut origin = ctx.dial(&host, target.port).await?;
    ctx.write_all(
        &mut client,
        CONNECT_ESTABLISHED_RESPONSE,
        "confirming the tunnel",
    )
    .await?;
    ProxyStats::bump(&ctx.stats.tunnels);
    if redirected {
        info!(from = %target.host, host = %host, port = target.port, "HTTPS (redirected)");
    } else {
        info!(host = %host, port = target.port, "HTTPS");
    }

    if let Some(early) = target.header_end.and_then(|end| request.get(end..)) {
        if !early.is_empty() {
            ctx.write_all(&mut origin, early, "forwarding early tunnel bytes")
                .await?;
        }
    }

    let io_timeout = ctx.config.io_timeout;
    let activity = Activity::new();
    let (mut client_read, mut client_write) = client.split();
    let (mut origin_read, mut origin_write) = origin.split();

    let (direction, outcome) = tokio::select! {
        outcome = pipe(
            &mut client_read,
            &mut origin_write,
            &ctx.pool,
            io_timeout,
            &activity,
            &cancel,
        ) => {
            ("client->origin", outcome)
        }
        outcome = pipe(
            &mut origin_read,
            &mut client_write,
            &ctx.pool,
            io_timeout,
            &activity,
            &cancel,
        ) => {
            ("origin->client", outcome)
        }
    };
    debug!(
        host = %host,
        direction,
        bytes = outcome.bytes,
        end = ?outcome.end,
        "Tunnel closed"
    );

    Ok(())
}
