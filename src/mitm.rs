//! Bridges decrypted, intercepted requests back into the tunnel.

use std::{net::SocketAddr, sync::Arc};

use n0_error::e;
use tracing::debug;

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    addr::{SocksAddr, with_default_port},
    error::BridgeError,
    parse::HttpRequest,
    tls::TlsOpts,
    tunnel::{DynTunnel, InboundKind, Metadata, Tunnel, open_pipe},
    util::{BoxedStream, Prebuffered},
};

/// Buffered virtual connection to the upstream of an intercepted request.
pub type ServerConn = Prebuffered<BoxedStream>;

/// Builds virtual upstream connections for intercepted requests.
///
/// Instead of dialing the origin, each connection is an in-memory pipe whose
/// far end is handed to the tunnel as a [`InboundKind::Mitm`] inbound, so that
/// decrypted traffic is routed like any other connection.
#[derive(derive_more::Debug, Clone)]
pub struct MitmBridge {
    #[debug("DynTunnel")]
    tunnel: Arc<DynTunnel<'static>>,
    tls: TlsOpts,
}

impl MitmBridge {
    pub fn new(tunnel: impl Tunnel + 'static, tls: TlsOpts) -> Self {
        Self::from_shared(DynTunnel::new_arc(tunnel), tls)
    }

    pub(crate) fn from_shared(tunnel: Arc<DynTunnel<'static>>, tls: TlsOpts) -> Self {
        Self { tunnel, tls }
    }

    /// Returns the upstream connection for `request`.
    ///
    /// An `existing` connection is returned unchanged. Otherwise the
    /// destination comes from the request URI (or host) with port 443 for
    /// requests that carry [`TlsInfo`](crate::TlsInfo) and 80 otherwise. A new
    /// pipe is handed to the tunnel in a detached task, and the local end is
    /// TLS-wrapped with the recorded server name if the request was intercepted
    /// from TLS.
    pub async fn server_conn(
        &self,
        existing: Option<ServerConn>,
        request: &HttpRequest,
        source: SocketAddr,
    ) -> Result<ServerConn, BridgeError> {
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let default_port = if request.tls.is_some() { 443 } else { 80 };
        let address = match request.uri.authority() {
            Some(authority) => with_default_port(
                authority.host(),
                authority.port_u16().unwrap_or(default_port),
            ),
            None => with_default_port(&request.host, default_port),
        };
        let destination = SocksAddr::parse(&address).map_err(|source| {
            e!(BridgeError::AddressNotSupported {
                address: address.clone(),
                source
            })
        })?;
        debug!(%destination, tls = request.tls.is_some(), "opening mitm bridge");

        let metadata = Metadata::new(InboundKind::Mitm, destination, source)
            .with_user_agent(request.user_agent());
        let local = open_pipe(&self.tunnel, metadata);
        let stream: BoxedStream = match &request.tls {
            Some(tls) => Box::new(self.tls.connect(&tls.server_name, local).await?),
            None => Box::new(local),
        };
        Ok(Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH))
    }
}
