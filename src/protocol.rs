//! Framed control messages exchanged over the tunnel connection.
//!
//! Frames are JSON objects discriminated by a `type` field with `snake_case`
//! keys. Binary payloads (HTTP bodies, terminal I/O) travel base64-encoded in
//! dedicated fields. Unknown fields are ignored; unknown `type` values decode
//! to [`DecodeError::UnknownType`] so callers can log and drop them without
//! tearing down the connection.
//!
//! ## Client → Server
//!
//! | type             | fields                                              |
//! |------------------|-----------------------------------------------------|
//! | `auth`           | `token`, `client_version`                           |
//! | `ping`           | —                                                   |
//! | `response`       | `request_id`, `status_code`, `headers`, `body_base64?` |
//! | `metrics`        | `cpu_temp`, `mem_total`, `mem_free`, `disk_total`, `disk_free`, `uptime`, `load_avg` |
//! | `command_result` | `command_id`, `exit_code`, `output`, `error?`       |
//! | `terminal_data`  | `session_id`, `data_base64`                         |
//! | `terminal_close` | `session_id`                                        |
//!
//! ## Server → Client
//!
//! | type              | fields                                             |
//! |-------------------|----------------------------------------------------|
//! | `auth_result`     | `success`, `subdomain?`, `message?`                |
//! | `pong`            | —                                                  |
//! | `error`           | `code`, `message`                                  |
//! | `request`         | `request_id`, `method`, `path`, `headers`, `body_base64?` |
//! | `command`         | `command_id`, `command`, `shell?`, `dry_run?`      |
//! | `terminal_open`   | `session_id`, `rows`, `cols`                       |
//! | `terminal_resize` | `session_id`, `rows`, `cols`                       |
//! | `terminal_close`  | `session_id`                                       |

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Maximum accepted size of a single inbound frame (12 MiB). Headroom above
/// the 10 MiB body cap to absorb base64 and header overhead.
pub const MAX_FRAME_BYTES: usize = 12 * 1024 * 1024;

/// Maximum HTTP body size carried through a tunnel, in either direction.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// One message on the control connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from the agent; must arrive within 10 s of connecting.
    Auth {
        token: String,
        client_version: String,
    },
    /// Server's single reply to `auth`.
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Agent heartbeat.
    Ping,
    /// Server reply to `ping`.
    Pong,
    /// Fatal or advisory error.
    Error { code: String, message: String },
    /// A public HTTP request for the agent to forward locally.
    Request {
        request_id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_base64: Option<String>,
    },
    /// The agent's reply to a `request`, correlated by `request_id`.
    Response {
        request_id: String,
        status_code: u16,
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_base64: Option<String>,
    },
    /// Periodic system metrics, sent alongside `ping`.
    Metrics(MetricsReport),
    /// A command for the agent: `reboot` or `exec`.
    Command {
        command_id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dry_run: Option<bool>,
    },
    /// The agent's reply to an `exec` command, correlated by `command_id`.
    CommandResult {
        command_id: String,
        exit_code: i32,
        /// Combined stdout+stderr, base64-encoded.
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Open a PTY session on the agent.
    TerminalOpen {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    /// Terminal I/O, bidirectional.
    TerminalData {
        session_id: String,
        data_base64: String,
    },
    /// Resize the PTY window.
    TerminalResize {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    /// End a terminal session, bidirectional.
    TerminalClose { session_id: String },
}

impl Frame {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "auth",
            Frame::AuthResult { .. } => "auth_result",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::Error { .. } => "error",
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::Metrics(_) => "metrics",
            Frame::Command { .. } => "command",
            Frame::CommandResult { .. } => "command_result",
            Frame::TerminalOpen { .. } => "terminal_open",
            Frame::TerminalData { .. } => "terminal_data",
            Frame::TerminalResize { .. } => "terminal_resize",
            Frame::TerminalClose { .. } => "terminal_close",
        }
    }
}

/// System metrics reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    /// CPU temperature in °C, or -1 when unavailable.
    pub cpu_temp: f64,
    /// Total memory in bytes.
    pub mem_total: u64,
    /// Available memory in bytes.
    pub mem_free: u64,
    /// Root filesystem size in bytes.
    pub disk_total: u64,
    /// Root filesystem free bytes.
    pub disk_free: u64,
    /// System uptime in seconds.
    pub uptime: i64,
    /// 1-minute load average, or -1 when unavailable.
    pub load_avg: f64,
}

/// Why a frame failed to decode.
#[derive(Debug)]
pub enum DecodeError {
    /// Frame exceeds [`MAX_FRAME_BYTES`]. Connection-fatal.
    Oversized(usize),
    /// Not a JSON object with the expected shape. Connection-fatal.
    Malformed(serde_json::Error),
    /// Well-formed JSON with a `type` we don't know. Log and drop.
    UnknownType(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Oversized(n) => {
                write!(f, "frame of {n} bytes exceeds {MAX_FRAME_BYTES} byte limit")
            }
            DecodeError::Malformed(e) => write!(f, "malformed frame: {e}"),
            DecodeError::UnknownType(t) => write!(f, "unknown frame type {t:?}"),
        }
    }
}

impl std::error::Error for DecodeError {}

const KNOWN_TYPES: &[&str] = &[
    "auth",
    "auth_result",
    "ping",
    "pong",
    "error",
    "request",
    "response",
    "metrics",
    "command",
    "command_result",
    "terminal_open",
    "terminal_resize",
    "terminal_data",
    "terminal_close",
];

/// Decode one frame from its wire text.
///
/// The `type` tag is peeked first so an unknown tag is distinguishable from a
/// malformed known frame: the former is droppable, the latter is a protocol
/// violation.
pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::Oversized(text.len()));
    }

    #[derive(Deserialize)]
    struct Tag {
        #[serde(rename = "type")]
        kind: String,
    }

    let tag: Tag = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
    if !KNOWN_TYPES.contains(&tag.kind.as_str()) {
        return Err(DecodeError::UnknownType(tag.kind));
    }

    serde_json::from_str(text).map_err(DecodeError::Malformed)
}

/// Encode a frame to its wire text.
pub fn encode(frame: &Frame) -> String {
    serde_json::to_string(frame).expect("frame serializes")
}

/// Base64-encode a binary payload; empty payloads become an absent field.
pub fn encode_body(data: &[u8]) -> Option<String> {
    if data.is_empty() {
        None
    } else {
        Some(BASE64.encode(data))
    }
}

/// Decode an optional base64 payload field. Absent fields decode to empty.
pub fn decode_body(body: Option<&str>) -> Result<Vec<u8>, base64::DecodeError> {
    match body {
        Some(b) if !b.is_empty() => BASE64.decode(b),
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let text = encode(&frame);
        let decoded = decode(&text).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_roundtrip_all_frame_types() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());

        roundtrip(Frame::Auth {
            token: "bw_abc".to_string(),
            client_version: "0.1.0".to_string(),
        });
        roundtrip(Frame::AuthResult {
            success: true,
            subdomain: Some("mypi".to_string()),
            message: None,
        });
        roundtrip(Frame::Ping);
        roundtrip(Frame::Pong);
        roundtrip(Frame::Error {
            code: "invalid_token".to_string(),
            message: "Token not recognized".to_string(),
        });
        roundtrip(Frame::Request {
            request_id: "req_1".to_string(),
            method: "GET".to_string(),
            path: "/ping".to_string(),
            headers: headers.clone(),
            body_base64: None,
        });
        roundtrip(Frame::Response {
            request_id: "req_1".to_string(),
            status_code: 200,
            headers,
            body_base64: encode_body(b"pong"),
        });
        roundtrip(Frame::Metrics(MetricsReport {
            cpu_temp: 48.2,
            mem_total: 8 * 1024 * 1024 * 1024,
            mem_free: 1024,
            disk_total: 64_000_000_000,
            disk_free: 1_000_000,
            uptime: 86400,
            load_avg: 0.25,
        }));
        roundtrip(Frame::Command {
            command_id: "cmd_1".to_string(),
            command: "exec".to_string(),
            shell: Some("uname -a".to_string()),
            dry_run: Some(true),
        });
        roundtrip(Frame::CommandResult {
            command_id: "cmd_1".to_string(),
            exit_code: 0,
            output: BASE64.encode(b"Linux"),
            error: None,
        });
        roundtrip(Frame::TerminalOpen {
            session_id: "term_1".to_string(),
            rows: 30,
            cols: 120,
        });
        roundtrip(Frame::TerminalData {
            session_id: "term_1".to_string(),
            data_base64: BASE64.encode(b"echo hi\n"),
        });
        roundtrip(Frame::TerminalResize {
            session_id: "term_1".to_string(),
            rows: 24,
            cols: 80,
        });
        roundtrip(Frame::TerminalClose {
            session_id: "term_1".to_string(),
        });
    }

    #[test]
    fn test_snake_case_tags_on_wire() {
        let text = encode(&Frame::AuthResult {
            success: false,
            subdomain: None,
            message: Some("nope".to_string()),
        });
        assert!(text.contains(r#""type":"auth_result""#));
        // absent optionals are omitted entirely
        assert!(!text.contains("subdomain"));
    }

    #[test]
    fn test_unknown_type_is_distinguished() {
        match decode(r#"{"type":"file_transfer","path":"/etc/passwd"}"#) {
            Err(DecodeError::UnknownType(t)) => assert_eq!(t, "file_transfer"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let frame = decode(r#"{"type":"ping","extra":"ignored","n":42}"#).unwrap();
        assert_eq!(frame, Frame::Ping);
    }

    #[test]
    fn test_missing_optionals_tolerated() {
        let frame =
            decode(r#"{"type":"command","command_id":"c1","command":"reboot"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Command {
                command_id: "c1".to_string(),
                command: "reboot".to_string(),
                shell: None,
                dry_run: None,
            }
        );
    }

    #[test]
    fn test_malformed_frame_rejected() {
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"no_type":true}"#),
            Err(DecodeError::Malformed(_))
        ));
        // known tag, missing required field
        assert!(matches!(
            decode(r#"{"type":"response","request_id":"r1"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let padding = "x".repeat(MAX_FRAME_BYTES);
        let text = format!(r#"{{"type":"ping","pad":"{padding}"}}"#);
        assert!(matches!(decode(&text), Err(DecodeError::Oversized(_))));
    }

    #[test]
    fn test_body_helpers() {
        assert_eq!(encode_body(b""), None);
        let encoded = encode_body(b"hello").unwrap();
        assert_eq!(decode_body(Some(&encoded)).unwrap(), b"hello");
        assert_eq!(decode_body(None).unwrap(), Vec::<u8>::new());
        assert!(decode_body(Some("!!not-base64!!")).is_err());
    }
}
