//! Rate limit key derivation.

use std::net::SocketAddr;

use http::header::{HeaderMap, HeaderName};
use http::{Extensions, Request};
use serde::Serialize;

/// A key that uniquely identifies the caller being throttled.
///
/// Keys are prefixed with the identity kind (`user:`, `apikey:`, `ip:`) so two
/// kinds never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RateLimitKey(String);

/// Number of API key characters kept in a derived key.
const API_KEY_PREFIX_LEN: usize = 8;

impl RateLimitKey {
    /// Wrap an already-derived key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for an authenticated principal.
    pub fn user(id: &str) -> Self {
        Self(format!("user:{}", id))
    }

    /// Key for a service credential. Only the first eight characters are kept
    /// so the secret itself never reaches the counter store or the logs.
    pub fn api_key(secret: &str) -> Self {
        let prefix: String = secret.chars().take(API_KEY_PREFIX_LEN).collect();
        Self(format!("apikey:{}", prefix))
    }

    /// Key for a client network address.
    pub fn ip(addr: &str) -> Self {
        Self(format!("ip:{}", addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity resolved by an upstream authentication step, stored as a request
/// extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedPrincipal(pub String);

/// Transport-level peer address, stored as a request extension by the server.
///
/// Kept as the raw string the transport reported, port included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr(pub String);

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr(addr.to_string())
    }
}

/// Derives a [`RateLimitKey`] from an inbound request.
///
/// Priority, first match wins: authenticated principal, API key header,
/// forwarded-for header, real-IP header, transport peer address.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    api_key_header: HeaderName,
    forwarded_for_header: HeaderName,
    real_ip_header: HeaderName,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self {
            api_key_header: HeaderName::from_static("x-api-key"),
            forwarded_for_header: HeaderName::from_static("x-forwarded-for"),
            real_ip_header: HeaderName::from_static("x-real-ip"),
        }
    }
}

impl KeyDeriver {
    /// Create a deriver reading identity from the given header names.
    pub fn new(
        api_key_header: HeaderName,
        forwarded_for_header: HeaderName,
        real_ip_header: HeaderName,
    ) -> Self {
        Self {
            api_key_header,
            forwarded_for_header,
            real_ip_header,
        }
    }

    /// Derive the key for a request.
    pub fn derive<B>(&self, request: &Request<B>) -> RateLimitKey {
        self.derive_parts(request.headers(), request.extensions())
    }

    /// Derive the key from request headers and extensions.
    pub fn derive_parts(&self, headers: &HeaderMap, extensions: &Extensions) -> RateLimitKey {
        if let Some(principal) = extensions.get::<AuthenticatedPrincipal>() {
            if !principal.0.is_empty() {
                return RateLimitKey::user(&principal.0);
            }
        }

        if let Some(secret) = header_str(headers, &self.api_key_header) {
            return RateLimitKey::api_key(secret);
        }

        RateLimitKey::ip(&self.client_address(headers, extensions))
    }

    fn client_address(&self, headers: &HeaderMap, extensions: &Extensions) -> String {
        // X-Forwarded-For can contain a chain of addresses; the first is the client
        if let Some(chain) = header_str(headers, &self.forwarded_for_header) {
            if let Some(first) = chain.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return first.to_string();
            }
        }

        if let Some(real_ip) = header_str(headers, &self.real_ip_header) {
            return real_ip.to_string();
        }

        extensions
            .get::<PeerAddr>()
            .map(|peer| strip_port(&peer.0).to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Remove a trailing `:port` and IPv6 brackets from a peer address.
fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    }

    // A bare IPv6 address has several colons and no port to strip
    match addr.rfind(':') {
        Some(idx) if addr[..idx].find(':').is_none() => &addr[..idx],
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> http::request::Builder {
        Request::builder().uri("/jobs")
    }

    #[test]
    fn test_principal_wins() {
        let deriver = KeyDeriver::default();
        let mut req = request()
            .header("x-api-key", "sk_live_abcdefghijkl")
            .header("x-forwarded-for", "203.0.113.9")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(AuthenticatedPrincipal("42".to_string()));

        assert_eq!(deriver.derive(&req).as_str(), "user:42");
    }

    #[test]
    fn test_api_key_uses_prefix_only() {
        let deriver = KeyDeriver::default();
        let req = request()
            .header("x-api-key", "sk_live_abcdefghijkl")
            .header("x-forwarded-for", "203.0.113.9")
            .body(())
            .unwrap();

        let key = deriver.derive(&req);
        assert_eq!(key.as_str(), "apikey:sk_live_");
        assert!(!key.as_str().contains("abcdefghijkl"));
    }

    #[test]
    fn test_short_api_key_used_whole() {
        assert_eq!(RateLimitKey::api_key("abc").as_str(), "apikey:abc");
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let deriver = KeyDeriver::default();
        let mut req = request()
            .header("x-forwarded-for", " 203.0.113.9 , 10.0.0.1, 10.0.0.2")
            .header("x-real-ip", "198.51.100.7")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(PeerAddr("10.0.0.2:55123".to_string()));

        assert_eq!(deriver.derive(&req).as_str(), "ip:203.0.113.9");
    }

    #[test]
    fn test_real_ip_fallback() {
        let deriver = KeyDeriver::default();
        let req = request()
            .header("x-forwarded-for", "")
            .header("x-real-ip", "198.51.100.7")
            .body(())
            .unwrap();

        assert_eq!(deriver.derive(&req).as_str(), "ip:198.51.100.7");
    }

    #[test]
    fn test_peer_address_port_stripped() {
        let deriver = KeyDeriver::default();

        let mut req = request().body(()).unwrap();
        req.extensions_mut()
            .insert(PeerAddr::from("192.0.2.1:8443".parse::<SocketAddr>().unwrap()));
        assert_eq!(deriver.derive(&req).as_str(), "ip:192.0.2.1");

        let mut req = request().body(()).unwrap();
        req.extensions_mut()
            .insert(PeerAddr::from("[2001:db8::1]:443".parse::<SocketAddr>().unwrap()));
        assert_eq!(deriver.derive(&req).as_str(), "ip:2001:db8::1");
    }

    #[test]
    fn test_strip_port_variants() {
        assert_eq!(strip_port("10.1.2.3:80"), "10.1.2.3");
        assert_eq!(strip_port("10.1.2.3"), "10.1.2.3");
        assert_eq!(strip_port("[::1]:9000"), "::1");
        assert_eq!(strip_port("[::1]"), "::1");
        assert_eq!(strip_port("fe80::1"), "fe80::1");
    }

    #[test]
    fn test_no_address_at_all() {
        let deriver = KeyDeriver::default();
        let req = request().body(()).unwrap();
        assert_eq!(deriver.derive(&req).as_str(), "ip:unknown");
    }

    #[test]
    fn test_key_stable_across_unrelated_headers() {
        let deriver = KeyDeriver::default();

        let a = request()
            .header("x-forwarded-for", "203.0.113.9")
            .header("user-agent", "curl/8.0")
            .body(())
            .unwrap();
        let b = request()
            .header("x-forwarded-for", "203.0.113.9")
            .header("user-agent", "Mozilla/5.0")
            .header("accept", "text/html")
            .body(())
            .unwrap();

        assert_eq!(deriver.derive(&a), deriver.derive(&b));
    }

    #[test]
    fn test_custom_header_names() {
        let deriver = KeyDeriver::new(
            HeaderName::from_static("authorization-key"),
            HeaderName::from_static("x-client-chain"),
            HeaderName::from_static("x-client-ip"),
        );
        let req = request()
            .header("x-api-key", "ignored-key")
            .header("x-client-ip", "198.51.100.20")
            .body(())
            .unwrap();

        assert_eq!(deriver.derive(&req).as_str(), "ip:198.51.100.20");
    }
}
