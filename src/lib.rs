//! Request handling core of an intercepting HTTP forward proxy.
//!
//! [`HttpProxy`] serves proxy clients: it authenticates them, forwards plain
//! HTTP requests, and hands `CONNECT` and upgrade connections to a [`Tunnel`].
//! [`MitmBridge`] re-injects decrypted, intercepted requests into the same
//! tunnel through in-memory pipes.

mod addr;
mod auth;
mod error;
mod mitm;
mod parse;
mod proxy;
mod tls;
mod tunnel;
mod util;


pub use {
    addr::SocksAddr,
    auth::{AuthBypass, AuthCache, Authenticator, ProxyAuth, SkipAuthPrefixes, StaticUsers},
    error::{AddressError, BridgeError},
    mitm::{MitmBridge, ServerConn},
    parse::{
        HttpRequest, HttpResponse, PROXY_CONNECTION, ResponseBody, TlsInfo,
        filter_hop_by_hop_headers,
    },
    proxy::{HttpProxy, ProxyOpts, TrustState},
    tls::{DEFAULT_TLS_TIMEOUT, TlsOpts},
    tunnel::{Addition, InboundConn, InboundKind, Metadata, Tunnel},
    util::{AsyncStream, BoxedStream, Prebuffered},
};

/// Maximum length of a request or response header section.
pub const HEADER_SECTION_MAX_LENGTH: usize = 8192;
