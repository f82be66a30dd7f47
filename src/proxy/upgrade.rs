use std::{net::SocketAddr, sync::Arc};

use http::{Method, StatusCode, header};
use n0_error::{Result, StackResultExt, StdResultExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    addr::{SocksAddr, with_default_port},
    parse::{HttpRequest, HttpResponse, filter_proxy_headers},
    tunnel::{DynTunnel, InboundKind, Metadata, open_pipe},
    util::{AsyncStream, BoxedStream, Prebuffered, forward_bidi},
};

use super::ProxyOpts;

/// Relays a protocol upgrade request through the tunnel.
///
/// Owns the client connection from here on. The request is replayed over a
/// fresh tunnel pipe and the upstream response head is passed back; on
/// `101 Switching Protocols` both sides are spliced until either closes.
pub(super) async fn handle_upgrade<S: AsyncStream>(
    mut conn: Prebuffered<S>,
    mut request: HttpRequest,
    tunnel: &Arc<DynTunnel<'static>>,
    opts: &ProxyOpts,
    source: SocketAddr,
) {
    filter_proxy_headers(&mut request.headers);
    request.remove_extra_host_port();

    let upstream = match open_upstream(&request, tunnel, opts, source).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!("upgrade failed: {err:#}");
            let mut response = HttpResponse::for_request(&request, StatusCode::BAD_GATEWAY);
            response.close = true;
            response.write(&mut conn).await.ok();
            return;
        }
    };
    if let Err(err) = relay(conn, upstream, &request).await {
        debug!("upgrade relay ended: {err:#}");
    }
}

async fn open_upstream(
    request: &HttpRequest,
    tunnel: &Arc<DynTunnel<'static>>,
    opts: &ProxyOpts,
    source: SocketAddr,
) -> Result<Prebuffered<BoxedStream>> {
    let default_port = if request.tls.is_some() { 443 } else { 80 };
    let address = with_default_port(&request.host, default_port);
    let destination = SocksAddr::parse(&address).context("Unsupported upgrade destination")?;
    debug!(%destination, "relaying upgrade");
    let metadata = Metadata::new(InboundKind::Upgrade, destination, source)
        .with_method(request.method.clone())
        .with_user_agent(request.user_agent())
        .with_additions(&opts.additions);
    let local = open_pipe(tunnel, metadata);
    let stream: BoxedStream = match &request.tls {
        Some(tls) => Box::new(
            opts.tls
                .connect(&tls.server_name, local)
                .await
                .context("Upstream TLS failed")?,
        ),
        None => Box::new(local),
    };
    Ok(Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH))
}

async fn relay<S: AsyncStream>(
    mut conn: Prebuffered<S>,
    mut upstream: Prebuffered<BoxedStream>,
    request: &HttpRequest,
) -> Result<()> {
    request.write(&mut upstream).await?;
    let mut response = HttpResponse::read(&mut upstream)
        .await
        .context("Invalid upgrade response")?;
    filter_proxy_headers(&mut response.headers);
    response.write_head(&mut conn).await?;

    if response.status == StatusCode::SWITCHING_PROTOCOLS {
        let (mut conn_recv, mut conn_send) = tokio::io::split(conn);
        let (mut up_recv, mut up_send) = tokio::io::split(upstream);
        let (sent, received) =
            forward_bidi(&mut conn_recv, &mut conn_send, &mut up_recv, &mut up_send).await?;
        debug!(sent, received, "upgraded connection closed");
        return Ok(());
    }

    // Declined upgrade: pass the body through unchanged, then close.
    let bodyless = request.method == Method::HEAD
        || response.status.is_informational()
        || response.status == StatusCode::NO_CONTENT
        || response.status == StatusCode::NOT_MODIFIED;
    if !bodyless {
        let content_length = response
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .std_context("Invalid Content-Length")?;
        match content_length {
            Some(len) => tokio::io::copy(&mut (&mut upstream).take(len), &mut conn).await?,
            None => tokio::io::copy(&mut upstream, &mut conn).await?,
        };
    }
    conn.shutdown().await?;
    Ok(())
}
