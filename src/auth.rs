//! Proxy authentication with `Basic` credentials and a shared result cache.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use http::{HeaderValue, StatusCode, header};
use lru::LruCache;
use tracing::info;

use crate::parse::{HttpRequest, HttpResponse};

/// Verifies a user name and password.
pub trait Authenticator: Send + Sync {
    fn verify(&self, user: &str, pass: &str) -> bool;
}

/// Authenticator backed by a fixed user table.
#[derive(Debug, Clone, Default)]
pub struct StaticUsers(HashMap<String, String>);

impl StaticUsers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user, replacing any previous password.
    pub fn with_user(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.0.insert(user.into(), pass.into());
        self
    }
}

impl<U: Into<String>, P: Into<String>> FromIterator<(U, P)> for StaticUsers {
    fn from_iter<T: IntoIterator<Item = (U, P)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(user, pass)| (user.into(), pass.into()))
                .collect(),
        )
    }
}

impl Authenticator for StaticUsers {
    fn verify(&self, user: &str, pass: &str) -> bool {
        self.0.get(user).is_some_and(|expected| expected == pass)
    }
}

/// Exempts clients from authentication by their address.
pub trait AuthBypass: Send + Sync {
    fn skip(&self, remote_addr: SocketAddr) -> bool;
}

impl<F> AuthBypass for F
where
    F: Fn(SocketAddr) -> bool + Send + Sync,
{
    fn skip(&self, remote_addr: SocketAddr) -> bool {
        self(remote_addr)
    }
}

/// Skips authentication for clients inside any of a list of IP prefixes.
///
/// IPv4-mapped IPv6 client addresses match IPv4 prefixes.
#[derive(Debug, Clone, Default)]
pub struct SkipAuthPrefixes(Vec<(IpAddr, u8)>);

impl SkipAuthPrefixes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a prefix. Lengths beyond the address width are clamped.
    pub fn with_prefix(mut self, network: IpAddr, len: u8) -> Self {
        let max = if network.is_ipv4() { 32 } else { 128 };
        self.0.push((network, len.min(max)));
        self
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.0
            .iter()
            .any(|(network, len)| prefix_matches(*network, *len, ip))
    }
}

fn prefix_matches(network: IpAddr, len: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(network), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - len as u32).unwrap_or(0);
            u32::from(network) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(network), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - len as u32).unwrap_or(0);
            u128::from(network) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

impl AuthBypass for SkipAuthPrefixes {
    fn skip(&self, remote_addr: SocketAddr) -> bool {
        self.contains(remote_addr.ip())
    }
}

/// LRU cache of authentication results, keyed by the raw `Basic` token.
///
/// Shared by all connections of a listener. Entries leave only by eviction or
/// [`AuthCache::clear`].
#[derive(derive_more::Debug)]
pub struct AuthCache {
    #[debug("{} entries", inner.lock().map(|c| c.len()).unwrap_or_default())]
    inner: Mutex<LruCache<String, bool>>,
}

impl AuthCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, bool>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached result and marks the entry as recently used.
    pub fn get(&self, token: &str) -> Option<bool> {
        self.lock().get(token).copied()
    }

    pub fn set(&self, token: impl Into<String>, authenticated: bool) {
        self.lock().put(token.into(), authenticated);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all cached results, e.g. after the user table changed.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Authentication policy of a proxy listener.
#[derive(derive_more::Debug, Clone, Default)]
pub struct ProxyAuth {
    #[debug("{:?}", authenticator.as_ref().map(|_| "Authenticator"))]
    authenticator: Option<Arc<dyn Authenticator>>,
    #[debug("{:?}", bypass.as_ref().map(|_| "AuthBypass"))]
    bypass: Option<Arc<dyn AuthBypass>>,
}

impl ProxyAuth {
    /// Requires credentials verified by `authenticator`.
    pub fn new(authenticator: impl Authenticator + 'static) -> Self {
        Self {
            authenticator: Some(Arc::new(authenticator)),
            bypass: None,
        }
    }

    /// Exempts matching clients from authentication.
    pub fn bypass(mut self, bypass: impl AuthBypass + 'static) -> Self {
        self.bypass = Some(Arc::new(bypass));
        self
    }

    /// Checks the request's `Proxy-Authorization` credentials.
    ///
    /// Returns `None` if the request may proceed, or the response to send
    /// instead: 407 with a `Basic` challenge when credentials are missing,
    /// 403 when they are rejected. Results are cached under the raw token, so
    /// a cached token is never decoded or verified again.
    pub fn authenticate(&self, request: &HttpRequest, cache: &AuthCache) -> Option<HttpResponse> {
        let bypassed = match (request.remote_addr, &self.bypass) {
            (Some(addr), Some(bypass)) => bypass.skip(addr),
            _ => false,
        };
        let authenticator = self.authenticator.as_ref().filter(|_| !bypassed)?;

        let Some(token) = basic_token(request) else {
            let mut response =
                HttpResponse::for_request(request, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
            response
                .headers
                .insert(header::PROXY_AUTHENTICATE, HeaderValue::from_static("Basic"));
            return Some(response);
        };

        let authenticated = match cache.get(token) {
            Some(authenticated) => authenticated,
            None => {
                let authenticated = decode_basic(token)
                    .is_some_and(|(user, pass)| authenticator.verify(&user, &pass));
                cache.set(token, authenticated);
                authenticated
            }
        };
        if authenticated {
            None
        } else {
            info!(remote_addr = ?request.remote_addr, "proxy authentication failed");
            Some(HttpResponse::for_request(request, StatusCode::FORBIDDEN))
        }
    }
}

/// Returns the token after the exact `Basic ` prefix, if non-empty.
fn basic_token(request: &HttpRequest) -> Option<&str> {
    request
        .headers
        .get(header::PROXY_AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")
        .filter(|token| !token.is_empty())
}

/// Decodes a `Basic` token into user and password, split at the first `:`.
fn decode_basic(token: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(token).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::Method;

    use super::*;

    #[derive(Clone, Default)]
    struct CountingUsers {
        calls: Arc<AtomicUsize>,
    }

    impl Authenticator for CountingUsers {
        fn verify(&self, user: &str, pass: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            user == "alice" && pass == "secret"
        }
    }

    fn request(authorization: Option<&str>) -> HttpRequest {
        let mut req = HttpRequest::new(Method::GET, "http://example.com/".parse().unwrap());
        req.remote_addr = Some("192.0.2.7:40000".parse().unwrap());
        if let Some(value) = authorization {
            req.headers
                .insert(header::PROXY_AUTHORIZATION, value.parse().unwrap());
        }
        req
    }

    fn basic(credentials: &str) -> String {
        format!("Basic {}", STANDARD.encode(credentials))
    }

    fn cache() -> AuthCache {
        AuthCache::new(NonZeroUsize::new(16).unwrap())
    }

    #[test]
    fn no_authenticator_trusts_everyone() {
        let auth = ProxyAuth::default();
        assert!(auth.authenticate(&request(None), &cache()).is_none());
    }

    #[test]
    fn missing_credentials_get_challenge() {
        let auth = ProxyAuth::new(StaticUsers::new().with_user("alice", "secret"));
        for value in [None, Some("Bearer abc"), Some("Basic ")] {
            let response = auth.authenticate(&request(value), &cache()).unwrap();
            assert_eq!(response.status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
            assert_eq!(response.headers[header::PROXY_AUTHENTICATE], "Basic");
        }
    }

    #[test]
    fn wrong_credentials_are_forbidden_and_cached() {
        let auth = ProxyAuth::new(StaticUsers::new().with_user("alice", "secret"));
        let cache = cache();
        let value = basic("alice:wrong");
        let response = auth.authenticate(&request(Some(&value)), &cache).unwrap();
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(cache.get(value.trim_start_matches("Basic ")), Some(false));

        let response = auth
            .authenticate(&request(Some("Basic !!notbase64")), &cache)
            .unwrap();
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(cache.get("!!notbase64"), Some(false));
    }

    #[test]
    fn cached_tokens_skip_verification() {
        let users = CountingUsers::default();
        let auth = ProxyAuth::new(users.clone());
        let cache = cache();
        let value = basic("alice:secret");
        assert!(auth.authenticate(&request(Some(&value)), &cache).is_none());
        assert!(auth.authenticate(&request(Some(&value)), &cache).is_none());
        assert_eq!(users.calls.load(Ordering::SeqCst), 1);

        cache.clear();
        assert!(auth.authenticate(&request(Some(&value)), &cache).is_none());
        assert_eq!(users.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn password_may_contain_colons() {
        let auth = ProxyAuth::new(StaticUsers::new().with_user("bob", "a:b:c"));
        assert!(
            auth.authenticate(&request(Some(&basic("bob:a:b:c"))), &cache())
                .is_none()
        );
    }

    #[test]
    fn bypass_skips_authentication() {
        let auth = ProxyAuth::new(StaticUsers::new())
            .bypass(SkipAuthPrefixes::new().with_prefix("192.0.2.0".parse().unwrap(), 24));
        assert!(auth.authenticate(&request(None), &cache()).is_none());

        let auth = ProxyAuth::new(StaticUsers::new()).bypass(|addr: SocketAddr| addr.port() == 1);
        assert!(auth.authenticate(&request(None), &cache()).is_some());
    }

    #[test]
    fn prefixes_match() {
        let prefixes = SkipAuthPrefixes::new()
            .with_prefix("10.0.0.0".parse().unwrap(), 8)
            .with_prefix("fd00::".parse().unwrap(), 8)
            .with_prefix("127.0.0.1".parse().unwrap(), 32);
        assert!(prefixes.contains("10.200.1.1".parse().unwrap()));
        assert!(prefixes.contains("::ffff:10.0.0.1".parse().unwrap()));
        assert!(prefixes.contains("fd12::1".parse().unwrap()));
        assert!(prefixes.contains("127.0.0.1".parse().unwrap()));
        assert!(!prefixes.contains("127.0.0.2".parse().unwrap()));
        assert!(!prefixes.contains("11.0.0.1".parse().unwrap()));

        let everything = SkipAuthPrefixes::new().with_prefix("0.0.0.0".parse().unwrap(), 0);
        assert!(everything.contains("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let cache = AuthCache::new(NonZeroUsize::new(2).unwrap());
        cache.set("a", true);
        cache.set("b", false);
        assert_eq!(cache.get("a"), Some(true));
        cache.set("c", true);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn static_users_from_iter() {
        let users: StaticUsers = [("alice", "secret")].into_iter().collect();
        assert!(users.verify("alice", "secret"));
        assert!(!users.verify("alice", "Secret"));
        assert!(!users.verify("mallory", "secret"));
    }
}
