//! The routing seam: inbound connections and the [`Tunnel`] that receives them.

use std::{future::Future, net::SocketAddr, sync::Arc};

use dynosaur::dynosaur;
use http::Method;
use tokio::io::DuplexStream;
use tracing::{Instrument, debug, debug_span};

use crate::{addr::SocksAddr, util::BoxedStream};

/// Buffer size of each direction of an in-memory pipe.
pub(crate) const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// How an inbound connection entered the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum InboundKind {
    /// An upstream connection dialed by the plain forwarding client.
    #[display("HTTP")]
    Http,
    /// A client connection hijacked by a `CONNECT` request.
    #[display("HTTPS")]
    Https,
    /// A connection carrying a protocol upgrade (e.g. WebSocket).
    #[display("UPGRADE")]
    Upgrade,
    /// A bridge for a decrypted, intercepted request.
    #[display("MITM")]
    Mitm,
}

/// Describes an inbound connection for the routing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub kind: InboundKind,
    /// Where the connection wants to go.
    pub destination: SocksAddr,
    /// The client that caused the connection.
    pub source: SocketAddr,
    pub method: Option<Method>,
    pub user_agent: Option<String>,
    /// Name of the listener the connection arrived on.
    pub in_name: Option<String>,
    /// Authenticated user, if the listener knows one.
    pub in_user: Option<String>,
    /// Tag that selects a special rule set in the router.
    pub special_rules: Option<String>,
}

impl Metadata {
    pub fn new(kind: InboundKind, destination: SocksAddr, source: SocketAddr) -> Self {
        Self {
            kind,
            destination,
            source,
            method: None,
            user_agent: None,
            in_name: None,
            in_user: None,
            special_rules: None,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<&str>) -> Self {
        self.user_agent = user_agent.map(ToOwned::to_owned);
        self
    }

    /// Applies listener-level additions in order.
    pub fn with_additions(mut self, additions: &[Addition]) -> Self {
        for addition in additions {
            addition.apply(&mut self);
        }
        self
    }
}

/// Extra metadata a listener attaches to every connection it hands off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addition {
    InName(String),
    InUser(String),
    SpecialRules(String),
}

impl Addition {
    pub fn apply(&self, metadata: &mut Metadata) {
        match self {
            Self::InName(name) => metadata.in_name = Some(name.clone()),
            Self::InUser(user) => metadata.in_user = Some(user.clone()),
            Self::SpecialRules(rules) => metadata.special_rules = Some(rules.clone()),
        }
    }
}

/// A connection handed to the [`Tunnel`], which takes ownership of the stream.
#[derive(derive_more::Debug)]
pub struct InboundConn {
    pub metadata: Metadata,
    #[debug(skip)]
    pub stream: BoxedStream,
}

impl InboundConn {
    pub fn new(metadata: Metadata, stream: BoxedStream) -> Self {
        Self { metadata, stream }
    }
}

#[dynosaur(pub(crate) DynTunnel = dyn(box) Tunnel)]
/// Routes inbound connections to their egress.
///
/// The proxy never waits on the tunnel for a result: once a connection is
/// handed over, the tunnel owns it and closes it when done.
pub trait Tunnel: Send + Sync {
    /// Takes ownership of `conn` and relays it to its destination.
    fn handle_tcp_conn(&self, conn: InboundConn) -> impl Future<Output = ()> + Send;
}

/// Creates an in-memory pipe and hands its far end to the tunnel.
///
/// The hand-off runs in a detached task; the returned end is the local side
/// of the virtual connection. Dropping it closes the tunnel's side.
pub(crate) fn open_pipe(tunnel: &Arc<DynTunnel<'static>>, metadata: Metadata) -> DuplexStream {
    let (local, remote) = tokio::io::duplex(PIPE_BUFFER_SIZE);
    let span = debug_span!("tunnel", kind = %metadata.kind, dst = %metadata.destination);
    let tunnel = tunnel.clone();
    tokio::spawn(
        async move {
            debug!("handing pipe to tunnel");
            tunnel
                .handle_tcp_conn(InboundConn::new(metadata, Box::new(remote)))
                .await;
            debug!("tunnel released pipe");
        }
        .instrument(span),
    );
    local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additions_apply_in_order() {
        let metadata = Metadata::new(
            InboundKind::Http,
            SocksAddr::parse("example.com:80").unwrap(),
            "127.0.0.1:5000".parse().unwrap(),
        )
        .with_additions(&[
            Addition::InName("http-in".into()),
            Addition::InUser("alice".into()),
            Addition::SpecialRules("direct".into()),
            Addition::InName("renamed".into()),
        ]);
        assert_eq!(metadata.in_name.as_deref(), Some("renamed"));
        assert_eq!(metadata.in_user.as_deref(), Some("alice"));
        assert_eq!(metadata.special_rules.as_deref(), Some("direct"));
    }
}
