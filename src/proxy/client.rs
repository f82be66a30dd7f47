use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderValue, Method, Uri, header, uri::Scheme};
use http_body_util::Full;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use n0_error::{Result, StackResultExt, StdResultExt};
use tokio_util::time::FutureExt;
use tracing::{Instrument, debug};

use crate::{
    addr::{SocksAddr, with_default_port},
    parse::{HttpRequest, HttpResponse},
    tls::TlsOpts,
    tunnel::{Addition, DynTunnel, InboundKind, Metadata, open_pipe},
    util::BoxedStream,
};

/// How long a pooled connection may take to become ready again.
const POOLED_READY_TIMEOUT: Duration = Duration::from_secs(1);

type Sender = SendRequest<Full<Bytes>>;

/// HTTP client bound to one proxy session.
///
/// Every upstream connection is a tunnel pipe of kind [`InboundKind::Http`]
/// instead of a socket. Idle connections are pooled per scheme and
/// destination, and close when the client is dropped. Redirects are returned
/// to the caller as is.
#[derive(derive_more::Debug)]
pub(crate) struct SessionClient {
    #[debug("DynTunnel")]
    tunnel: Arc<DynTunnel<'static>>,
    tls: TlsOpts,
    source: SocketAddr,
    additions: Vec<Addition>,
    #[debug("{} destinations", idle.len())]
    idle: HashMap<(bool, String), Vec<Sender>>,
}

impl SessionClient {
    pub(crate) fn new(
        tunnel: Arc<DynTunnel<'static>>,
        tls: TlsOpts,
        source: SocketAddr,
        additions: Vec<Addition>,
    ) -> Self {
        Self {
            tunnel,
            tls,
            source,
            additions,
            idle: HashMap::new(),
        }
    }

    /// Sends an absolute-form request upstream and returns the response head.
    ///
    /// The body of the returned response streams from the upstream connection.
    pub(crate) async fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let https = request.uri.scheme() == Some(&Scheme::HTTPS);
        let authority = request
            .uri
            .authority()
            .context("Missing authority in request target")?;
        let default_port = if https { 443 } else { 80 };
        let address = with_default_port(
            authority.host(),
            authority.port_u16().unwrap_or(default_port),
        );
        let key = (https, address);

        let mut sender = match self.checkout(&key).await {
            Some(sender) => sender,
            None => self.connect(&key.1, https, authority.host(), request).await?,
        };

        let mut upstream = hyper::Request::new(Full::new(request.body.clone()));
        *upstream.method_mut() = request.method.clone();
        *upstream.uri_mut() =
            Uri::try_from(request.origin_target()).std_context("Invalid request target")?;
        *upstream.headers_mut() = request.headers.clone();
        upstream.headers_mut().insert(
            header::HOST,
            HeaderValue::from_str(&request.host).std_context("Invalid host")?,
        );

        let response = sender
            .send_request(upstream)
            .await
            .std_context("Upstream request failed")?;
        debug!(status = %response.status(), destination = %key.1, "upstream response");
        self.idle.entry(key).or_default().push(sender);
        Ok(HttpResponse::from_hyper(
            response,
            request.method == Method::HEAD,
        ))
    }

    /// Takes a pooled connection that is ready for another request.
    async fn checkout(&mut self, key: &(bool, String)) -> Option<Sender> {
        let pooled = self.idle.get_mut(key)?;
        while let Some(mut sender) = pooled.pop() {
            if sender.is_closed() {
                continue;
            }
            match sender.ready().timeout(POOLED_READY_TIMEOUT).await {
                Ok(Ok(())) => return Some(sender),
                _ => debug!(destination = %key.1, "dropping stale upstream connection"),
            }
        }
        None
    }

    async fn connect(
        &self,
        address: &str,
        https: bool,
        server_name: &str,
        request: &HttpRequest,
    ) -> Result<Sender> {
        let destination = SocksAddr::parse(address).context("Unsupported upstream address")?;
        let metadata = Metadata::new(InboundKind::Http, destination, self.source)
            .with_method(request.method.clone())
            .with_user_agent(request.user_agent())
            .with_additions(&self.additions);
        let local = open_pipe(&self.tunnel, metadata);
        let stream: BoxedStream = if https {
            Box::new(
                self.tls
                    .connect(server_name, local)
                    .await
                    .context("Upstream TLS failed")?,
            )
        } else {
            Box::new(local)
        };
        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .std_context("Upstream handshake failed")?;
        tokio::spawn(
            async move {
                if let Err(err) = conn.await {
                    debug!("upstream connection closed: {err:#}");
                }
            }
            .instrument(tracing::Span::current()),
        );
        Ok(sender)
    }
}
