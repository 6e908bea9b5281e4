//! Local HTTP forwarder: replays `request` frames against the configured
//! local service and answers each with a `response` frame.
//!
//! Failures never terminate the tunnel — an unreachable or slow local service
//! is reported to the public caller as a 502 with a short plain-text
//! explanation. Redirects are not followed; the upstream status passes
//! through. Response bodies are truncated at the 10 MiB cap with the status
//! preserved.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{info, warn};

use crate::protocol::{self, Frame, MAX_BODY_BYTES};
use crate::util::is_hop_by_hop;

/// Deadline for one local HTTP call, connect included.
const LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Forwarder {
    target: String,
    client: reqwest::Client,
}

impl Forwarder {
    /// Build a forwarder for `http://<host>:<port>`.
    pub fn new(local_host: &str, local_port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LOCAL_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client builds");
        Self {
            target: format!("{local_host}:{local_port}"),
            client,
        }
    }

    /// Replay one proxied request locally. Always produces a `response`
    /// frame for `request_id`; errors become a 502.
    pub async fn forward(
        &self,
        request_id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body_base64: Option<String>,
    ) -> Frame {
        info!("← {method} {path}");

        let body = match protocol::decode_body(body_base64.as_deref()) {
            Ok(body) => body,
            Err(e) => {
                return error_response(request_id, &format!("Invalid request body: {e}"));
            }
        };

        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return error_response(request_id, &format!("Invalid method: {method}")),
        };

        let url = format!("http://{}{path}", self.target);
        let request = self
            .client
            .request(method, &url)
            .headers(forward_headers(&headers))
            .body(body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Local service error: {e}");
                return error_response(request_id, &format!("Failed to reach local service: {e}"));
            }
        };

        let status = response.status().as_u16();
        let mut response_headers = HashMap::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(v) = value.to_str() {
                response_headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| v.to_string());
            }
        }

        let body = match read_body_capped(response, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                return error_response(request_id, &format!("Failed to read response body: {e}"));
            }
        };

        info!("→ {status} {path}");

        Frame::Response {
            request_id,
            status_code: status,
            headers: response_headers,
            body_base64: protocol::encode_body(&body),
        }
    }
}

/// Read a response body, truncating at `cap` without failing the request.
async fn read_body_capped(
    mut response: reqwest::Response,
    cap: usize,
) -> Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() >= cap {
            break;
        }
        let take = chunk.len().min(cap - body.len());
        body.extend_from_slice(&chunk[..take]);
    }
    Ok(body)
}

/// Copy request headers minus hop-by-hop, then stamp the forwarding headers.
fn forward_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        let Ok(value) = HeaderValue::try_from(value.as_str()) else {
            continue;
        };
        map.insert(name, value);
    }
    map.insert("x-forwarded-proto", HeaderValue::from_static("https"));
    map.insert("x-burrow-tunnel", HeaderValue::from_static("1"));
    map
}

fn error_response(request_id: String, message: &str) -> Frame {
    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "text/plain".to_string());
    Frame::Response {
        request_id,
        status_code: 502,
        headers,
        body_base64: protocol::encode_body(message.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_headers_strip_hop_by_hop() {
        let mut headers = HashMap::new();
        headers.insert("Connection".to_string(), "keep-alive".to_string());
        headers.insert("Transfer-Encoding".to_string(), "chunked".to_string());
        headers.insert("Accept".to_string(), "*/*".to_string());

        let map = forward_headers(&headers);
        assert!(map.get("connection").is_none());
        assert!(map.get("transfer-encoding").is_none());
        assert_eq!(map.get("accept").unwrap(), "*/*");
        assert_eq!(map.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(map.get("x-burrow-tunnel").unwrap(), "1");
    }

    #[test]
    fn test_error_response_shape() {
        let frame = error_response("req_1".to_string(), "Failed to reach local service");
        let Frame::Response {
            request_id,
            status_code,
            headers,
            body_base64,
        } = frame
        else {
            panic!("expected response frame");
        };
        assert_eq!(request_id, "req_1");
        assert_eq!(status_code, 502);
        assert_eq!(headers.get("Content-Type").unwrap(), "text/plain");
        let body = protocol::decode_body(body_base64.as_deref()).unwrap();
        assert_eq!(body, b"Failed to reach local service");
    }

    #[tokio::test]
    async fn test_unreachable_service_yields_502_frame() {
        // Nothing listens on this port.
        let forwarder = Forwarder::new("127.0.0.1", 1);
        let frame = forwarder
            .forward(
                "req_1".to_string(),
                "GET".to_string(),
                "/ping".to_string(),
                HashMap::new(),
                None,
            )
            .await;
        assert!(
            matches!(frame, Frame::Response { status_code: 502, .. }),
            "expected 502 response frame"
        );
    }
}
