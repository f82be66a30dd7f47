use std::sync::Arc;

use crate::{
    auth::{AuthCache, ProxyAuth},
    tls::TlsOpts,
    tunnel::Addition,
};

/// Configuration for [`HttpProxy`](super::HttpProxy).
///
/// Authentication is only enforced when an [`AuthCache`] is configured; the
/// cache is usually shared by all listeners that use the same user table.
#[derive(Debug, Clone, Default)]
pub struct ProxyOpts {
    pub(crate) auth_cache: Option<Arc<AuthCache>>,
    pub(crate) auth: ProxyAuth,
    pub(crate) additions: Vec<Addition>,
    pub(crate) tls: TlsOpts,
}

impl ProxyOpts {
    /// Enables authentication with results cached in `cache`.
    pub fn auth(mut self, auth: ProxyAuth, cache: Arc<AuthCache>) -> Self {
        self.auth = auth;
        self.auth_cache = Some(cache);
        self
    }

    /// Adds metadata to every connection handed to the tunnel.
    pub fn addition(mut self, addition: Addition) -> Self {
        self.additions.push(addition);
        self
    }

    /// Sets TLS client settings for upstream connections.
    pub fn tls(mut self, tls: TlsOpts) -> Self {
        self.tls = tls;
        self
    }
}
