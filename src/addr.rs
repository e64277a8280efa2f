//! Endpoint address parsing and canonicalization
//!
//! Every address the session stores or compares is kept in the IPv6 family.
//! IPv4 peers are represented as IPv4-mapped IPv6 addresses (`::FFFF:a.b.c.d`)
//! so that a single dual-stack socket serves both families and slot lookups
//! never have to compare across families.

use std::net::{IpAddr, SocketAddr, SocketAddrV6};

/// Parses a textual endpoint into the canonical IPv6 representation.
///
/// Accepted forms:
/// - `[host]:port` (IPv6 with explicit port)
/// - `host:port` (IPv4 with explicit port)
/// - `host` alone, combined with `fallback_port`
///
/// When the text already carries a port, `fallback_port` is ignored.
/// Bare IPv4 results are rewritten as IPv4-mapped IPv6.
///
/// # Returns
/// * `Some(addr)` on success
/// * `None` for malformed input, with no side effects
pub fn parse_endpoint(text: &str, fallback_port: u16) -> Option<SocketAddrV6> {
    if let Ok(sa) = text.parse::<SocketAddr>() {
        return Some(canonical_v6(sa));
    }

    if let Ok(ip) = text.parse::<IpAddr>() {
        return Some(canonical_v6(SocketAddr::new(ip, fallback_port)));
    }

    // "[host]" without a port parses as neither of the above
    if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']'))
        && let Ok(ip) = inner.parse::<IpAddr>()
    {
        return Some(canonical_v6(SocketAddr::new(ip, fallback_port)));
    }

    None
}

/// Rewrites any socket address into the uniform IPv6 family.
///
/// IPv4 addresses become IPv4-mapped IPv6 (`::FFFF:a.b.c.d`); IPv6 addresses
/// pass through unchanged. Used on every address that enters the session so
/// that comparisons against stored sentinel endpoints are family-agnostic.
pub fn canonical_v6(addr: SocketAddr) -> SocketAddrV6 {
    match addr {
        SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0),
        SocketAddr::V6(v6) => v6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv6_with_port() {
        let addr = parse_endpoint("[::1]:5000", 0).unwrap();
        assert_eq!(addr.ip().to_string(), "::1");
        assert_eq!(addr.port(), 5000);
    }

    #[test]
    fn parses_ipv6_with_fallback_port() {
        let addr = parse_endpoint("::1", 54545).unwrap();
        assert_eq!(addr.port(), 54545);
    }

    #[test]
    fn maps_bare_ipv4() {
        let addr = parse_endpoint("192.168.1.1", 54545).unwrap();
        assert_eq!(addr.ip().to_string(), "::ffff:192.168.1.1");
        assert_eq!(addr.port(), 54545);
    }

    #[test]
    fn maps_ipv4_with_port() {
        let addr = parse_endpoint("10.0.0.2:7777", 0).unwrap();
        assert_eq!(addr.ip().to_string(), "::ffff:10.0.0.2");
        assert_eq!(addr.port(), 7777);
    }

    #[test]
    fn parses_bracketed_ipv6_without_port() {
        let addr = parse_endpoint("[fe80::1]", 42).unwrap();
        assert_eq!(addr.port(), 42);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_endpoint("not an address", 0).is_none());
        assert!(parse_endpoint("", 0).is_none());
        assert!(parse_endpoint("[::1:5000", 0).is_none());
    }

    #[test]
    fn canonical_roundtrip() {
        let v6: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        assert_eq!(SocketAddr::V6(canonical_v6(v6)), v6);

        let v4: SocketAddr = "1.2.3.4:80".parse().unwrap();
        let mapped = canonical_v6(v4);
        assert_eq!(mapped.ip().to_ipv4_mapped().unwrap().to_string(), "1.2.3.4");
        assert_eq!(mapped.port(), 80);
    }
}
