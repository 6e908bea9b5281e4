//! Public request proxy: routes `<subdomain>.<base_domain>` traffic through
//! the matching tunnel.
//!
//! Installed as a middleware layer in front of the main-domain router. A
//! request whose Host carries a tunnel subdomain never reaches the inner
//! router; everything else falls through untouched. In `dev_mode` the
//! subdomain may also come from an `X-Burrow-Subdomain` header or a
//! `?subdomain=` query so tunnels can be exercised without wildcard DNS.
//!
//! Proxy-originated statuses: 404 unknown subdomain, 503 device offline,
//! 403 forwarding disabled, 402 monthly quota exhausted (HTML body),
//! 413 request body over 10 MiB, 502 forward failure or timeout.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::server::tunnel::TunnelError;
use crate::store::format_bytes;
use crate::util::{is_hop_by_hop, strip_port};
use crate::AppState;

/// Layer entry point: divert subdomain traffic into the tunnel, pass
/// everything else to the inner router.
pub async fn subdomain_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    // The agent connect endpoint is path-routed, never proxied.
    if request.uri().path() == "/tunnel" {
        return next.run(request).await;
    }

    match resolve_subdomain(&state, &request) {
        Some(subdomain) => proxy_request(state, subdomain, request).await,
        None => next.run(request).await,
    }
}

/// Derive the tunnel subdomain for a request, if it has one.
fn resolve_subdomain(state: &AppState, request: &Request) -> Option<String> {
    if state.config.server.dev_mode {
        if let Some(subdomain) = request
            .headers()
            .get("x-burrow-subdomain")
            .and_then(|v| v.to_str().ok())
        {
            return Some(subdomain.to_string());
        }
        if let Some(subdomain) = query_param(request.uri().query(), "subdomain") {
            return Some(subdomain);
        }
    }

    let host = request.headers().get(header::HOST)?.to_str().ok()?;
    subdomain_from_host(host, &state.config.server.base_domain)
}

/// Strip the base-domain suffix from a Host header value.
pub fn subdomain_from_host(host: &str, base_domain: &str) -> Option<String> {
    let host = strip_port(host);
    let prefix = host.strip_suffix(base_domain)?.strip_suffix('.')?;
    if prefix.is_empty() {
        return None;
    }
    Some(prefix.to_string())
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

async fn proxy_request(state: AppState, subdomain: String, request: Request) -> Response {
    let Some(tunnel) = state.registry.get(&subdomain) else {
        // Device registered but not connected reads differently from an
        // unknown subdomain.
        if state.store.lookup_by_subdomain(&subdomain).is_some() {
            let domain = &state.config.server.base_domain;
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{subdomain}.{domain} is currently offline"),
            )
                .into_response();
        }
        return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
    };

    if !tunnel.device.tunnel_enabled {
        return (StatusCode::FORBIDDEN, "Tunnel forwarding is disabled").into_response();
    }

    let (over, used, limit) = state.store.is_over_limit(&tunnel.device.id);
    if over {
        info!(
            subdomain = %subdomain,
            used = %format_bytes(used),
            limit = %format_bytes(limit),
            "Monthly bandwidth limit exceeded"
        );
        return quota_exceeded_page(used, limit);
    }

    let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
    let method = request.method().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), ToString::to_string);

    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in request.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            headers.entry(canonical_name(name.as_str())).or_insert_with(|| v.to_string());
        }
    }
    if !headers.contains_key("X-Forwarded-For") {
        if let Some(ConnectInfo(addr)) = request
            .extensions()
            .get::<ConnectInfo<std::net::SocketAddr>>()
        {
            headers.insert("X-Forwarded-For".to_string(), addr.ip().to_string());
        }
    }

    let content_length = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let body = match axum::body::to_bytes(request.into_body(), crate::protocol::MAX_BODY_BYTES)
        .await
    {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response()
        }
    };

    info!(subdomain = %subdomain, %method, path = %path_and_query, "Proxying request");

    let reply = match tunnel
        .forward(request_id, method, path_and_query.clone(), headers, &body)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(subdomain = %subdomain, "Forward failed: {e}");
            return (StatusCode::BAD_GATEWAY, format!("Tunnel error: {e}")).into_response();
        }
    };

    // Account request and response bytes to the device's month. The request
    // envelope is approximated as the URL plus 200 bytes of headers.
    let request_size = path_and_query.len() as u64 + 200 + content_length;
    state
        .store
        .add_bandwidth(&tunnel.device.id, request_size, reply.body.len() as u64);

    let mut response = Response::builder()
        .status(StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(response_headers) = response.headers_mut() {
        for (name, value) in &reply.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            let Ok(value) = HeaderValue::try_from(value.as_str()) else {
                continue;
            };
            response_headers.insert(name, value);
        }
    }
    response
        .body(Body::from(reply.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Normalize header capitalization for the wire map (`content-type` →
/// `Content-Type`), matching what local services expect to see.
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

/// The 402 page shown when a device's monthly quota is exhausted.
fn quota_exceeded_page(used: u64, limit: u64) -> Response {
    let used = format_bytes(used);
    let limit = format_bytes(limit);
    let page = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Bandwidth Limit Exceeded</title></head>
<body style="font-family: system-ui; max-width: 500px; margin: 50px auto; text-align: center;">
<h1>Bandwidth Limit Exceeded</h1>
<p>This tunnel has used <strong>{used}</strong> of its <strong>{limit}</strong> monthly limit.</p>
<p>The limit resets on the 1st of each month.</p>
</body>
</html>"#
    );
    (
        StatusCode::PAYMENT_REQUIRED,
        [(header::CONTENT_TYPE, "text/html")],
        page,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdomain_from_host() {
        assert_eq!(
            subdomain_from_host("mypi.example.com", "example.com"),
            Some("mypi".to_string())
        );
        assert_eq!(
            subdomain_from_host("mypi.example.com:443", "example.com"),
            Some("mypi".to_string())
        );
        assert_eq!(subdomain_from_host("example.com", "example.com"), None);
        assert_eq!(subdomain_from_host("other.org", "example.com"), None);
        // suffix must match on a label boundary
        assert_eq!(subdomain_from_host("evilexample.com", "example.com"), None);
        assert_eq!(
            subdomain_from_host("a.b.example.com", "example.com"),
            Some("a.b".to_string())
        );
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("subdomain=mypi&x=1"), "subdomain"),
            Some("mypi".to_string())
        );
        assert_eq!(query_param(Some("x=1"), "subdomain"), None);
        assert_eq!(query_param(None, "subdomain"), None);
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("content-type"), "Content-Type");
        assert_eq!(canonical_name("x-forwarded-proto"), "X-Forwarded-Proto");
        assert_eq!(canonical_name("etag"), "Etag");
    }

    #[tokio::test]
    async fn test_quota_page_renders_sizes() {
        let response = quota_exceeded_page(
            crate::store::FREE_TIER_BANDWIDTH - 1,
            crate::store::FREE_TIER_BANDWIDTH,
        );
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html"
        );
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let page = String::from_utf8_lossy(&body).to_string();
        // Used and limit both render as 1.00 GB at the boundary.
        assert_eq!(page.matches("1.00 GB").count(), 2);
    }

    #[test]
    fn test_request_envelope_accounting() {
        // len(url) + 200 + content_length
        let url = "/ping";
        assert_eq!(url.len() as u64 + 200 + 0, 205);
    }
}
