//! Plain HTTP forwarding.
//!
//! The first chunk from the client is forwarded to the origin named by its
//! `Host` header (after redirect and block checks), then the origin's
//! response is relayed back until either side closes. Only the first request
//! on a connection is inspected.

use crate::pipe::{pipe, Activity};
use crate::proxy::{ProxyContext, ProxyStats};
use crate::request::HostHeader;
use crate::{Result, FORBIDDEN_RESPONSE};
use std::borrow::Cow;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Serve a plain HTTP request whose first chunk is `request`.
///
/// # Errors
/// * `ProxyError::MalformedRequest` - No usable `Host` header.
/// * `ProxyError::TcpConnection` - The origin was unreachable.
pub(crate) async fn handle(
    ctx: &ProxyContext,
    mut client: TcpStream,
    request: &[u8],
    cancel: CancellationToken,
) -> Result<()> {
    let header = HostHeader::parse(request)?;
    let host = ctx.store.lookup_redirect(&header.host);
    let redirected = host != header.host;
    if redirected {
        ProxyStats::bump(&ctx.stats.redirected);
    }

    if ctx.store.is_blocked(&host) {
        ProxyStats::bump(&ctx.stats.blocked);
        info!(host = %host, port = header.port, "Blocked HTTP");
        ctx.write_all(&mut client, FORBIDDEN_RESPONSE, "sending the blocked response")
            .await?;
        return Ok(());
    }

    let outbound = if redirected {
        Cow::Owned(header.rewrite(request, &host))
    } else {
        Cow::Borrowed(request)
    };

    let mut origin = ctx.dial(&host, header.port).await?;
    ctx.write_all(&mut origin, &outbound, "forwarding the request")
        .await?;
    ProxyStats::bump(&ctx.stats.http_forwards);
    if redirected {
        info!(from = %header.host, host = %host, port = header.port, "HTTP (redirected)");
    } else {
        info!(host = %host, port = header.port, "HTTP");
    }

    let outcome = pipe(
        &mut origin,
        &mut client,
        &ctx.pool,
        ctx.config.io_timeout,
        &Activity::new(),
        &cancel,
    )
    .await;
    debug!(
        host = %host,
        bytes = outcome.bytes,
        end = ?outcome.end,
        "HTTP response relayed"
    );

    Ok(())
}
