//! Small helpers shared across modules.

/// Hop-by-hop headers, stripped whenever a request or response crosses the
/// tunnel (RFC 7230 §6.1). Matching is case-insensitive.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Whether a header must not be forwarded end-to-end.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Strip an optional `:port` suffix from a Host header value.
pub fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("TE"));
        assert!(is_hop_by_hop("Upgrade"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("X-Forwarded-Proto"));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("mypi.example.com:443"), "mypi.example.com");
        assert_eq!(strip_port("mypi.example.com"), "mypi.example.com");
        assert_eq!(strip_port("localhost:8080"), "localhost");
    }
}
