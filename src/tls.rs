use std::{sync::Arc, time::Duration};

use n0_error::e;
use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tokio_util::time::FutureExt;
use tracing::{debug, warn};

use crate::error::BridgeError;

/// Default bound for a TLS client handshake over a tunnel pipe.
pub const DEFAULT_TLS_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS client settings for connections the proxy opens through the tunnel.
#[derive(derive_more::Debug, Clone)]
pub struct TlsOpts {
    #[debug(skip)]
    config: Arc<ClientConfig>,
    handshake_timeout: Duration,
}

impl Default for TlsOpts {
    fn default() -> Self {
        Self::native_roots()
    }
}

impl TlsOpts {
    /// Uses a caller-provided client configuration.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            handshake_timeout: DEFAULT_TLS_TIMEOUT,
        }
    }

    /// Verifies servers against the platform's root certificates.
    pub fn native_roots() -> Self {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in native.errors {
            debug!("failed to load native certificate: {err}");
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        if roots.is_empty() {
            warn!("no native root certificates found, upstream TLS will fail");
        }
        debug!(added, ignored, "loaded native root certificates");
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::new(Arc::new(config))
    }

    /// Sets the handshake bound.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Runs a TLS client handshake over `stream` for `server_name`.
    ///
    /// Brackets around IPv6 literals are ignored.
    pub(crate) async fn connect<S>(
        &self,
        server_name: &str,
        stream: S,
    ) -> Result<TlsStream<S>, BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = server_name
            .strip_prefix('[')
            .and_then(|n| n.strip_suffix(']'))
            .unwrap_or(server_name);
        let name = ServerName::try_from(name.to_string()).map_err(|source| {
            e!(BridgeError::InvalidServerName {
                server_name: server_name.to_string(),
                source
            })
        })?;
        let connector = TlsConnector::from(self.config.clone());
        match connector
            .connect(name, stream)
            .timeout(self.handshake_timeout)
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(e!(BridgeError::Handshake {
                server_name: server_name.to_string(),
                source
            })),
            Err(_elapsed) => Err(e!(BridgeError::HandshakeTimeout {
                server_name: server_name.to_string()
            })),
        }
    }
}
