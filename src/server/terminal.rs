//! Browser terminal bridge.
//!
//! `GET /api/devices/{id}/terminal?token=<device token>` upgrades an
//! authenticated browser to a WebSocket and relays shell traffic with the
//! device's tunnel. The bridge never interprets terminal bytes: browser
//! input becomes `terminal_data` frames, and agent `terminal_data` /
//! `terminal_close` frames are forwarded to the browser verbatim.
//!
//! The first browser message carries the initial window size
//! (`{"rows":30,"cols":120}`, defaults 24×80). After that, messages with
//! `"type":"resize"` translate to `terminal_resize`; every other message is
//! parsed as `{"data":"..."}` and becomes the payload of a `terminal_data`
//! frame.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::{self, Frame};
use crate::server::tunnel::Tunnel;
use crate::AppState;

/// Query parameters for the terminal upgrade (browsers can't set an
/// `Authorization` header on a WebSocket handshake).
#[derive(Deserialize)]
pub struct TerminalQuery {
    pub token: String,
}

/// `GET /api/devices/{id}/terminal?token=<key>` — browser terminal upgrade.
pub async fn terminal_upgrade(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // The device token is the session principal: it must resolve to the
    // device named in the path.
    let Some(device) = state.store.lookup_by_token(&query.token) else {
        return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
    };
    if device.id != device_id {
        return (StatusCode::NOT_FOUND, "Device not found").into_response();
    }

    let Some(tunnel) = state.registry.get(&device.subdomain) else {
        return (StatusCode::CONFLICT, "Device is offline").into_response();
    };

    ws.on_upgrade(move |socket| handle_terminal(socket, tunnel))
}

async fn handle_terminal(socket: WebSocket, tunnel: Arc<Tunnel>) {
    let (mut browser_sink, mut browser_stream) = socket.split();
    let session_id = format!("term_{}", uuid::Uuid::new_v4().simple());
    let subdomain = tunnel.device.subdomain.clone();

    // First browser message: initial window size.
    let (rows, cols) = match browser_stream.next().await {
        Some(Ok(Message::Text(text))) => parse_init_size(&text),
        _ => {
            info!(session_id, "Browser left before sending initial size");
            return;
        }
    };

    if tunnel
        .send(Frame::TerminalOpen {
            session_id: session_id.clone(),
            rows,
            cols,
        })
        .await
        .is_err()
    {
        let _ = browser_sink
            .send(close_message(1011, "tunnel closed"))
            .await;
        return;
    }

    info!(subdomain = %subdomain, session_id, rows, cols, "Terminal session opened");

    // Register the browser sink before any output can arrive.
    let (sink_tx, mut sink_rx) = mpsc::channel::<Frame>(256);
    tunnel.register_terminal(&session_id, sink_tx);

    // Agent → browser: forward terminal frames verbatim until the session or
    // the tunnel ends.
    let mut tunnel_closed = tunnel.closed();
    let forward_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tunnel_closed.changed() => {
                    let _ = browser_sink
                        .send(close_message(1001, "tunnel disconnected"))
                        .await;
                    break;
                }
                frame = sink_rx.recv() => {
                    match frame {
                        Some(Frame::TerminalClose { .. }) | None => {
                            let _ = browser_sink
                                .send(close_message(1000, "session closed"))
                                .await;
                            break;
                        }
                        Some(frame) => {
                            let text = protocol::encode(&frame);
                            if browser_sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    });

    // Browser → agent: translate control messages, pipe everything else.
    while let Some(Ok(msg)) = browser_stream.next().await {
        match msg {
            Message::Text(text) => {
                let frame = match parse_browser_message(&session_id, &text) {
                    Some(frame) => frame,
                    None => continue,
                };
                if tunnel.send(frame).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Browser gone: release the session and tell the agent to reap the PTY.
    tunnel.unregister_terminal(&session_id);
    let _ = tunnel
        .send(Frame::TerminalClose {
            session_id: session_id.clone(),
        })
        .await;
    forward_task.abort();
    info!(subdomain = %subdomain, session_id, "Terminal session closed");
}

/// Initial size message: `{"rows":30,"cols":120}`. Defaults 24×80.
fn parse_init_size(text: &str) -> (u16, u16) {
    #[derive(Deserialize)]
    struct Init {
        rows: Option<u16>,
        cols: Option<u16>,
    }
    match serde_json::from_str::<Init>(text) {
        Ok(init) => (
            init.rows.filter(|r| *r > 0).unwrap_or(24),
            init.cols.filter(|c| *c > 0).unwrap_or(80),
        ),
        Err(_) => (24, 80),
    }
}

/// Translate one browser message into a tunnel frame. Resize controls become
/// `terminal_resize`; anything with a `data` field becomes `terminal_data`
/// with the bytes base64-encoded. Unrecognized messages are dropped.
fn parse_browser_message(session_id: &str, text: &str) -> Option<Frame> {
    #[derive(Deserialize)]
    struct Control {
        #[serde(rename = "type")]
        kind: Option<String>,
        rows: Option<u16>,
        cols: Option<u16>,
        data: Option<String>,
    }

    let msg: Control = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(session_id, "Unparseable browser message: {e}");
            return None;
        }
    };

    if msg.kind.as_deref() == Some("resize") {
        return Some(Frame::TerminalResize {
            session_id: session_id.to_string(),
            rows: msg.rows.filter(|r| *r > 0)?,
            cols: msg.cols.filter(|c| *c > 0)?,
        });
    }

    let data = msg.data.filter(|d| !d.is_empty())?;
    Some(Frame::TerminalData {
        session_id: session_id.to_string(),
        data_base64: protocol::encode_body(data.as_bytes())?,
    })
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_size_defaults() {
        assert_eq!(parse_init_size(r#"{"rows":30,"cols":120}"#), (30, 120));
        assert_eq!(parse_init_size(r#"{}"#), (24, 80));
        assert_eq!(parse_init_size("garbage"), (24, 80));
        assert_eq!(parse_init_size(r#"{"rows":0,"cols":0}"#), (24, 80));
    }

    #[test]
    fn test_resize_control_translated() {
        let frame =
            parse_browser_message("term_1", r#"{"type":"resize","rows":40,"cols":100}"#).unwrap();
        assert_eq!(
            frame,
            Frame::TerminalResize {
                session_id: "term_1".to_string(),
                rows: 40,
                cols: 100,
            }
        );
    }

    #[test]
    fn test_input_becomes_terminal_data() {
        let frame = parse_browser_message("term_1", r#"{"data":"echo hi\n"}"#).unwrap();
        let Frame::TerminalData {
            session_id,
            data_base64,
        } = frame
        else {
            panic!("expected terminal_data");
        };
        assert_eq!(session_id, "term_1");
        assert_eq!(
            protocol::decode_body(Some(&data_base64)).unwrap(),
            b"echo hi\n"
        );
    }

    #[test]
    fn test_junk_messages_dropped() {
        assert!(parse_browser_message("term_1", "not json").is_none());
        assert!(parse_browser_message("term_1", r#"{"other":1}"#).is_none());
        assert!(parse_browser_message("term_1", r#"{"data":""}"#).is_none());
    }
}
