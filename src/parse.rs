use std::{net::SocketAddr, str::FromStr};

use bytes::{Bytes, BytesMut};
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version, header,
    uri::{Authority, PathAndQuery},
};
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{addr::split_host_port, util::Prebuffered};

/// Non-standard header used by proxy clients to request keep-alive.
pub const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Largest request body the proxy buffers before forwarding.
pub(crate) const BODY_MAX_LENGTH: usize = 16 * 1024 * 1024;

/// Headers that only apply to a single transport leg.
///
/// Headers named in the `Connection` value are removed as well, see
/// [`filter_hop_by_hop_headers`].
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including those listed in `Connection`.
pub fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = connection_tokens(headers)
        .map(|token| token.to_ascii_lowercase())
        .collect();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name.as_str());
    }
}

/// Removes the headers a proxy consumes before relaying an upgrade request.
pub(crate) fn filter_proxy_headers(headers: &mut HeaderMap) {
    headers.remove(PROXY_CONNECTION);
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(header::PROXY_AUTHORIZATION);
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// TLS parameters recorded when a request arrived over an intercepted TLS session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    /// Server name indicated by the client, used for the upstream handshake.
    pub server_name: String,
}

impl TlsInfo {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }
}

/// Parsed HTTP/1.x request with a buffered body.
#[derive(derive_more::Debug)]
pub struct HttpRequest {
    /// HTTP method from the request line.
    pub method: Method,
    /// Request target as sent by the client.
    pub uri: Uri,
    /// Protocol version from the request line.
    pub version: Version,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
    /// Target host, from the absolute-form target or the `Host` header.
    pub host: String,
    /// Peer address of the client connection.
    pub remote_addr: Option<SocketAddr>,
    /// Set when the request was decrypted from an intercepted TLS session.
    pub tls: Option<TlsInfo>,
    /// Request body, read according to its framing headers.
    #[debug("{} bytes", body.len())]
    pub body: Bytes,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    pub fn new(method: Method, uri: Uri) -> Self {
        let host = uri
            .authority()
            .map(|authority| authority.as_str().to_string())
            .unwrap_or_default();
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            host,
            remote_addr: None,
            tls: None,
            body: Bytes::new(),
        }
    }

    /// Reads and parses the request line and header section.
    ///
    /// Does not remove the header section from `reader`.
    /// Returns the length of the header section and the request.
    /// Returns [`io::ErrorKind::UnexpectedEof`] if the stream ends first, and
    /// [`io::ErrorKind::OutOfMemory`] if the header section exceeds the buffer limit.
    pub async fn peek(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<(usize, Self)> {
        if let Some(request) = Self::parse_with_len(reader.buffer())? {
            return Ok(request);
        }
        while !reader.is_full() {
            if reader.buffer_more().await? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            if let Some(request) = Self::parse_with_len(reader.buffer())? {
                return Ok(request);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "Buffer size limit reached before end of request header section",
        )
        .into())
    }

    /// Reads and parses the request line and header section.
    ///
    /// Removes the header section from `reader`; the body is left in place.
    pub async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Self> {
        let (len, request) = Self::peek(reader).await?;
        reader.discard(len);
        Ok(request)
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, req)| req))
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the request.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("Invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                Self::from_request(req).map(|req| Some((header_len, req)))
            }
        }
    }

    fn from_request(req: httparse::Request) -> Result<Self> {
        let method_str = req.method.context("Missing HTTP method")?;
        let method = Method::from_str(method_str).std_context("Invalid HTTP method")?;
        let path = req.path.context("Missing request target")?;
        let uri = Uri::from_str(path).std_context("Invalid request target")?;
        let version = match req.version.context("Missing HTTP version")? {
            0 => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let headers = HeaderMap::from_iter(req.headers.iter().flat_map(|h| {
            let value = HeaderValue::from_bytes(h.value).ok()?;
            let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            Some((name, value))
        }));
        let mut request = Self::new(method, uri);
        request.version = version;
        request.headers = headers;
        if request.host.is_empty()
            && let Some(host) = request.host_header()
        {
            request.host = host.to_string();
        }
        Ok(request)
    }

    /// Reads the request body announced by the framing headers.
    ///
    /// Supports `Transfer-Encoding: chunked` (trailers are discarded) and
    /// `Content-Length`. Requests with neither have no body.
    pub async fn read_body(
        &mut self,
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<()> {
        if self.is_chunked() {
            self.body = read_chunked_body(reader).await?;
        } else if let Some(len) = self.content_length()? {
            if len > BODY_MAX_LENGTH {
                return Err(anyerr!("Request body exceeds size limit"));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            self.body = body.into();
        }
        Ok(())
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    fn content_length(&self) -> Result<Option<usize>> {
        let Some(value) = self.headers.get(header::CONTENT_LENGTH) else {
            return Ok(None);
        };
        let len = value
            .to_str()
            .std_context("Invalid Content-Length")?
            .trim()
            .parse::<usize>()
            .std_context("Invalid Content-Length")?;
        Ok(Some(len))
    }

    /// Returns the value of the `Host` header, if present and valid.
    pub fn host_header(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
    }

    /// Whether the client asked to keep the proxy connection open.
    ///
    /// Only `Proxy-Connection: keep-alive` counts, compared case-insensitively
    /// after trimming.
    pub fn wants_keep_alive(&self) -> bool {
        self.headers
            .get(PROXY_CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("keep-alive"))
    }

    /// Whether the `Connection` header requests a protocol upgrade.
    pub fn is_upgrade(&self) -> bool {
        connection_tokens(&self.headers).any(|token| token.eq_ignore_ascii_case("upgrade"))
    }

    /// Copies a non-empty `Host` header into [`Self::host`].
    pub fn normalize_host(&mut self) {
        if let Some(host) = self.host_header() {
            self.host = host.to_string();
        }
    }

    /// Drops a port that is the default for the URI scheme.
    ///
    /// Updates both [`Self::host`] and the URI authority. IPv6 literals keep
    /// their brackets.
    pub fn remove_extra_host_port(&mut self) {
        let host = if self.host.is_empty() {
            self.uri
                .authority()
                .map(|a| a.as_str().to_string())
                .unwrap_or_default()
        } else {
            std::mem::take(&mut self.host)
        };
        let scheme = self.uri.scheme_str();
        let host = match split_host_port(&host) {
            (h, Some("80")) if scheme == Some("http") => h.to_string(),
            (h, Some("443")) if scheme == Some("https") => h.to_string(),
            _ => host,
        };
        if self.uri.scheme().is_some()
            && !host.is_empty()
            && let Ok(authority) = Authority::from_str(&host)
        {
            let mut parts = self.uri.clone().into_parts();
            parts.authority = Some(authority);
            if parts.path_and_query.is_none() {
                parts.path_and_query = Some(PathAndQuery::from_static("/"));
            }
            if let Ok(uri) = Uri::from_parts(parts) {
                self.uri = uri;
            }
        }
        self.host = host;
    }

    /// Returns the origin-form request target (`/path?query`).
    pub fn origin_target(&self) -> &str {
        self.uri
            .path_and_query()
            .map(PathAndQuery::as_str)
            .filter(|target| !target.is_empty())
            .unwrap_or("/")
    }

    /// Writes the request in origin-form, followed by the buffered body.
    pub async fn write(&self, writer: &mut (impl AsyncWrite + Unpin)) -> io::Result<()> {
        let mut head = format!(
            "{} {} {:?}\r\n",
            self.method,
            self.origin_target(),
            self.version
        )
        .into_bytes();
        if !self.headers.contains_key(header::HOST) && !self.host.is_empty() {
            push_header(&mut head, header::HOST.as_str(), self.host.as_bytes());
        }
        for (key, value) in self.headers.iter() {
            push_header(&mut head, key.as_str(), value.as_bytes());
        }
        head.extend_from_slice(b"\r\n");
        writer.write_all(&head).await?;
        writer.write_all(&self.body).await?;
        writer.flush().await
    }
}

async fn read_chunked_body(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Bytes> {
    let mut body = BytesMut::new();
    loop {
        let line = reader.read_line().await?;
        let size = line.split(|b| *b == b';').next().unwrap_or_default();
        let size = std::str::from_utf8(size)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
            .context("Invalid chunk size")?;
        if size == 0 {
            while !reader.read_line().await?.is_empty() {}
            return Ok(body.freeze());
        }
        if size > BODY_MAX_LENGTH - body.len() {
            return Err(anyerr!("Request body exceeds size limit"));
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;
        if !reader.read_line().await?.is_empty() {
            return Err(anyerr!("Missing chunk terminator"));
        }
    }
}

fn push_header(buf: &mut Vec<u8>, name: &str, value: &[u8]) {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

/// Body of an [`HttpResponse`].
#[derive(derive_more::Debug, Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    #[debug("Full({} bytes)", _0.len())]
    Full(Bytes),
    /// Streamed from an upstream connection.
    #[debug("Incoming")]
    Incoming(Incoming),
}

/// HTTP response with status, reason, headers, and body.
#[derive(derive_more::Debug)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Protocol version of the status line.
    pub version: Version,
    /// Header map to write.
    pub headers: HeaderMap<HeaderValue>,
    pub body: ResponseBody,
    /// Close the connection after writing this response.
    pub close: bool,
    /// The response answers a `HEAD` request and carries no body.
    pub(crate) head_only: bool,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            close: false,
            head_only: false,
        }
    }

    /// Creates an empty response matching the protocol version of `request`.
    pub fn for_request(request: &HttpRequest, status: StatusCode) -> Self {
        let mut response = Self::new(status);
        response.version = request.version;
        response.head_only = request.method == Method::HEAD;
        response
    }

    /// Wraps a response received from an upstream connection.
    pub(crate) fn from_hyper(response: hyper::Response<Incoming>, head_only: bool) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            reason: None,
            version: parts.version,
            headers: parts.headers,
            body: ResponseBody::Incoming(body),
            close: false,
            head_only,
        }
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!(
            "{:?} {} {}\r\n",
            self.version,
            self.status.as_u16(),
            self.reason()
        )
    }

    fn is_bodyless(&self) -> bool {
        self.head_only
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }

    /// Writes the response, re-framing the body for the client leg.
    ///
    /// A body of known length is sent with `Content-Length`. Otherwise the body
    /// is chunked on HTTP/1.1, and close-delimited on HTTP/1.0.
    /// Returns whether the connection must be closed after this response.
    pub async fn write(mut self, writer: &mut (impl AsyncWrite + Unpin)) -> io::Result<bool> {
        let bodyless = self.is_bodyless();
        let mut chunked = false;
        match &self.body {
            _ if bodyless => {}
            ResponseBody::Empty => {
                self.headers
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
            }
            ResponseBody::Full(bytes) => {
                self.headers
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            }
            ResponseBody::Incoming(_) if self.headers.contains_key(header::CONTENT_LENGTH) => {}
            ResponseBody::Incoming(body) => {
                if let Some(len) = body.size_hint().exact() {
                    self.headers
                        .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                } else if self.version == Version::HTTP_11 {
                    self.headers.insert(
                        header::TRANSFER_ENCODING,
                        HeaderValue::from_static("chunked"),
                    );
                    chunked = true;
                } else {
                    self.close = true;
                }
            }
        }
        if self.close {
            self.headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        let mut head = self.status_line().into_bytes();
        for (key, value) in self.headers.iter() {
            push_header(&mut head, key.as_str(), value.as_bytes());
        }
        head.extend_from_slice(b"\r\n");
        writer.write_all(&head).await?;

        match self.body {
            _ if bodyless => {}
            ResponseBody::Empty => {}
            ResponseBody::Full(bytes) => writer.write_all(&bytes).await?,
            ResponseBody::Incoming(mut body) => {
                while let Some(frame) = body.frame().await {
                    let frame = frame.map_err(io::Error::other)?;
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if data.is_empty() {
                        continue;
                    }
                    if chunked {
                        writer
                            .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                            .await?;
                        writer.write_all(&data).await?;
                        writer.write_all(b"\r\n").await?;
                    } else {
                        writer.write_all(&data).await?;
                    }
                }
                if chunked {
                    writer.write_all(b"0\r\n\r\n").await?;
                }
            }
        }
        writer.flush().await?;
        Ok(self.close)
    }

    /// Writes only the status line and header section, as received.
    pub(crate) async fn write_head(&self, writer: &mut (impl AsyncWrite + Unpin)) -> io::Result<()> {
        let mut head = self.status_line().into_bytes();
        for (key, value) in self.headers.iter() {
            push_header(&mut head, key.as_str(), value.as_bytes());
        }
        head.extend_from_slice(b"\r\n");
        writer.write_all(&head).await?;
        writer.flush().await
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, res)| res))
    }

    /// Parses a response head from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(buf)
            .std_context("Failed to parse HTTP response")?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let version = match res.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                let headers = HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    Some((name, value))
                }));
                let mut response = HttpResponse::new(status);
                response.reason = res.reason.map(ToOwned::to_owned);
                response.version = version;
                response.headers = headers;
                Ok(Some((header_len, response)))
            }
        }
    }

    /// Reads and parses the response status line and header section.
    ///
    /// Removes the header section from `reader`; the body is left in place.
    pub async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Self> {
        while !reader.is_full() {
            if let Some((len, response)) = Self::parse_with_len(reader.buffer())? {
                reader.discard(len);
                return Ok(response);
            }
            if reader.buffer_more().await? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
        Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "Buffer size limit reached before end of response header section",
        )
        .into())
    }
}
