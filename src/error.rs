use std::io;

use n0_error::stack_error;
use rustls::pki_types::InvalidDnsNameError;

/// Errors from parsing a `host:port` string into a [`SocksAddr`](crate::SocksAddr).
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum AddressError {
    /// The string has no `:port` suffix.
    #[error("missing port in {address:?}")]
    MissingPort { address: String },

    /// The port is not a number in `1..=65535`.
    #[error("invalid port in {address:?}")]
    InvalidPort { address: String },

    /// The host part is empty.
    #[error("empty host in {address:?}")]
    EmptyHost { address: String },

    /// Domain names must fit the one-byte SOCKS length prefix.
    #[error("domain name in {address:?} exceeds 255 bytes")]
    DomainTooLong { address: String },
}

/// Errors from establishing a MITM bridge to the tunnel.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum BridgeError {
    /// The request target cannot be encoded as a tunnel destination.
    #[error("address not supported: {address}")]
    AddressNotSupported {
        /// The `host:port` string derived from the request.
        address: String,
        #[error(source)]
        source: AddressError,
    },

    /// The recorded TLS server name is not a valid DNS name or IP literal.
    #[error("invalid tls server name {server_name:?}")]
    InvalidServerName {
        server_name: String,
        #[error(source, std_err)]
        source: InvalidDnsNameError,
    },

    /// The TLS client handshake over the bridge failed.
    #[error("tls handshake with {server_name} failed")]
    Handshake {
        server_name: String,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The TLS client handshake did not complete within the configured bound.
    #[error("tls handshake with {server_name} timed out")]
    HandshakeTimeout { server_name: String },
}
