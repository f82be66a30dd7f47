use std::{net::SocketAddr, sync::Arc};

use http::{HeaderName, HeaderValue, Method, StatusCode, header};
use n0_error::Result;
use tokio::{io::AsyncWriteExt, net::TcpListener};
use tracing::{Instrument, debug, error_span, warn};

pub use self::opts::ProxyOpts;
use self::client::SessionClient;
use crate::{
    HEADER_SECTION_MAX_LENGTH,
    addr::SocksAddr,
    mitm::MitmBridge,
    parse::{HttpRequest, HttpResponse, PROXY_CONNECTION, filter_hop_by_hop_headers},
    tunnel::{DynTunnel, InboundConn, InboundKind, Metadata, Tunnel},
    util::{AsyncStream, Prebuffered},
};

mod client;
mod opts;
mod upgrade;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Whether a connection has passed authentication.
///
/// `Trusted` is final for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    Unverified,
    Trusted,
}

/// Outcome of dispatching one request.
#[derive(derive_more::Debug)]
enum Dispatch<C> {
    /// Write `response` and keep serving `conn`.
    Continue {
        response: HttpResponse,
        #[debug(skip)]
        conn: C,
    },
    /// The connection now belongs to someone else.
    Hijacked,
    /// The connection failed and was dropped.
    Closed,
}

/// HTTP proxy listener that routes everything through a [`Tunnel`].
///
/// Handles plain forwarding of absolute-form requests, `CONNECT` tunnels,
/// and protocol upgrades. Clients may be required to authenticate with
/// `Proxy-Authorization: Basic`.
#[derive(derive_more::Debug, Clone)]
pub struct HttpProxy {
    #[debug("DynTunnel")]
    tunnel: Arc<DynTunnel<'static>>,
    opts: ProxyOpts,
}

impl HttpProxy {
    pub fn new(tunnel: impl Tunnel + 'static, opts: ProxyOpts) -> Self {
        Self {
            tunnel: DynTunnel::new_arc(tunnel),
            opts,
        }
    }

    /// Returns a bridge for intercepted requests that shares this proxy's tunnel.
    pub fn mitm_bridge(&self) -> MitmBridge {
        MitmBridge::from_shared(self.tunnel.clone(), self.opts.tls.clone())
    }

    /// Accepts TCP connections and serves each in a new task.
    ///
    /// Runs until accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut id = 0u64;
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(
                async move {
                    debug!("accepted connection");
                    this.handle_connection(stream, remote_addr).await;
                }
                .instrument(error_span!("http-conn", id, client = %remote_addr)),
            );
            id += 1;
        }
    }

    /// Serves one client connection until it closes or is hijacked.
    ///
    /// Requests are handled strictly one after another. The connection stays
    /// open only while the client sends `Proxy-Connection: keep-alive`.
    pub async fn handle_connection<S: AsyncStream + 'static>(
        &self,
        stream: S,
        remote_addr: SocketAddr,
    ) {
        let mut conn = Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH);
        let mut client = SessionClient::new(
            self.tunnel.clone(),
            self.opts.tls.clone(),
            remote_addr,
            self.opts.additions.clone(),
        );
        let mut trust = match self.opts.auth_cache {
            Some(_) => TrustState::Unverified,
            None => TrustState::Trusted,
        };

        loop {
            let mut request = match HttpRequest::read(&mut conn).await {
                Ok(request) => request,
                Err(err) => {
                    debug!("closing connection: {err:#}");
                    break;
                }
            };
            request.remote_addr = Some(remote_addr);
            if request.method != Method::CONNECT
                && !request.is_upgrade()
                && let Err(err) = request.read_body(&mut conn).await
            {
                debug!("failed to read request body: {err:#}");
                break;
            }
            debug!(method = %request.method, uri = %request.uri, "request");

            let keep_alive = request.wants_keep_alive();

            let mut denied = None;
            if let (TrustState::Unverified, Some(cache)) = (trust, &self.opts.auth_cache) {
                denied = self.opts.auth.authenticate(&request, cache);
                if denied.is_none() {
                    trust = TrustState::Trusted;
                }
            }

            let mut response = match denied {
                Some(response) => response,
                None => match self.dispatch(conn, request, &mut client, remote_addr).await {
                    Dispatch::Continue {
                        response,
                        conn: returned,
                    } => {
                        conn = returned;
                        response
                    }
                    Dispatch::Hijacked | Dispatch::Closed => return,
                },
            };

            if keep_alive {
                let value = HeaderValue::from_static("keep-alive");
                response.headers.insert(PROXY_CONNECTION, value.clone());
                response.headers.insert(header::CONNECTION, value);
                response
                    .headers
                    .insert(KEEP_ALIVE, HeaderValue::from_static("timeout=4"));
            }
            response.close = !keep_alive;

            match response.write(&mut conn).await {
                Ok(false) => {}
                Ok(true) => break,
                Err(err) => {
                    debug!("failed to write response: {err:#}");
                    break;
                }
            }
        }
        conn.shutdown().await.ok();
    }

    /// Relays an upgrade request read from an intercepted TLS session.
    ///
    /// `request.tls` carries the client's server name; when set, the upstream
    /// leg is TLS-wrapped with that name and defaults to port 443.
    pub async fn handle_intercepted_upgrade<S: AsyncStream>(
        &self,
        stream: S,
        mut request: HttpRequest,
        remote_addr: SocketAddr,
    ) {
        request.remote_addr = Some(remote_addr);
        request.normalize_host();
        let conn = Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH);
        upgrade::handle_upgrade(conn, request, &self.tunnel, &self.opts, remote_addr).await;
    }

    async fn dispatch<S: AsyncStream + 'static>(
        &self,
        mut conn: Prebuffered<S>,
        mut request: HttpRequest,
        client: &mut SessionClient,
        remote_addr: SocketAddr,
    ) -> Dispatch<Prebuffered<S>> {
        if request.method == Method::CONNECT {
            let destination = match SocksAddr::parse(&request.host) {
                Ok(destination) => destination,
                Err(err) => {
                    debug!("invalid CONNECT target: {err:#}");
                    let response = HttpResponse::for_request(&request, StatusCode::BAD_REQUEST);
                    return Dispatch::Continue { response, conn };
                }
            };
            // Written by hand: HTTP/1.0 clients need the status line without headers.
            let established = format!("{:?} 200 Connection established\r\n\r\n", request.version);
            if let Err(err) = conn.write_all(established.as_bytes()).await {
                debug!("failed to confirm CONNECT: {err:#}");
                return Dispatch::Closed;
            }
            if let Err(err) = conn.flush().await {
                debug!("failed to confirm CONNECT: {err:#}");
                return Dispatch::Closed;
            }
            let metadata = Metadata::new(InboundKind::Https, destination, remote_addr)
                .with_method(Method::CONNECT)
                .with_user_agent(request.user_agent())
                .with_additions(&self.opts.additions);
            self.tunnel
                .handle_tcp_conn(InboundConn::new(metadata, Box::new(conn)))
                .await;
            return Dispatch::Hijacked;
        }

        request.normalize_host();

        if request.is_upgrade() {
            upgrade::handle_upgrade(conn, request, &self.tunnel, &self.opts, remote_addr).await;
            return Dispatch::Hijacked;
        }

        filter_hop_by_hop_headers(&mut request.headers);
        request.remove_extra_host_port();

        let mut response = if request.uri.scheme().is_none()
            || request.uri.host().is_none_or(str::is_empty)
        {
            HttpResponse::for_request(&request, StatusCode::BAD_REQUEST)
        } else {
            match client.send(&request).await {
                Ok(mut response) => {
                    response.version = request.version;
                    response
                }
                Err(err) => {
                    warn!(uri = %request.uri, "forwarding failed: {err:#}");
                    HttpResponse::for_request(&request, StatusCode::BAD_GATEWAY)
                }
            }
        };
        filter_hop_by_hop_headers(&mut response.headers);
        Dispatch::Continue { response, conn }
    }
}
