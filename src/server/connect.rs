//! Agent connection endpoint: `GET /tunnel` WebSocket upgrade.
//!
//! ## Connection lifecycle
//!
//! 1. The agent's first frame must be `auth` and arrive within 10 s.
//! 2. The token resolves to a device via the store; failure answers an
//!    `error` frame (or `auth_result{success:false}`) and closes.
//! 3. On success exactly one `auth_result{success:true}` is sent, the
//!    [`Tunnel`] is built and registered (evicting any previous connection
//!    for the subdomain), and two tasks run until disconnect:
//!    - a writer task that owns the sink, drains the tunnel's outbound
//!      channel (single writer, 10 s deadline per write) and emits a
//!      WebSocket ping every 30 s;
//!    - the read loop, bounded by a 90 s idle deadline refreshed by any
//!      inbound message.
//! 4. On any exit the tunnel is closed, which drains all pending correlators
//!    and terminal sessions, and the registry entry is removed.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::{self, DecodeError, Frame};
use crate::server::tunnel::Tunnel;
use crate::AppState;

/// Deadline for the agent's `auth` frame after the transport opens.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);
/// Idle read deadline; any inbound message refreshes it.
const READ_DEADLINE: Duration = Duration::from_secs(90);
/// Per-write deadline on the sink.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// WebSocket ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// `GET /tunnel` — agent WebSocket registration.
pub async fn tunnel_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(protocol::MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_agent(socket, state))
}

type WsSink = SplitSink<WebSocket, Message>;

async fn handle_agent(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Auth handshake: first frame, bounded deadline.
    let first = match tokio::time::timeout(AUTH_DEADLINE, ws_stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_)) | None) | Err(_) => {
            warn!("Agent disconnected or sent no auth frame in time");
            let _ = send_frame(
                &mut ws_sink,
                &Frame::Error {
                    code: "auth_timeout".to_string(),
                    message: "Expected auth frame within 10s".to_string(),
                },
            )
            .await;
            return;
        }
        Ok(Some(Err(e))) => {
            warn!("Agent transport error before auth: {e}");
            return;
        }
    };

    let (token, client_version) = match protocol::decode(&first) {
        Ok(Frame::Auth {
            token,
            client_version,
        }) => (token, client_version),
        Ok(other) => {
            warn!(kind = other.kind(), "Expected auth frame, got another type");
            let _ = send_frame(
                &mut ws_sink,
                &Frame::Error {
                    code: "invalid_message".to_string(),
                    message: "Expected auth message".to_string(),
                },
            )
            .await;
            return;
        }
        Err(e) => {
            warn!("Malformed auth frame: {e}");
            let _ = send_frame(
                &mut ws_sink,
                &Frame::Error {
                    code: "invalid_message".to_string(),
                    message: "Expected auth message".to_string(),
                },
            )
            .await;
            return;
        }
    };

    let Some(device) = state.store.lookup_by_token(&token) else {
        let _ = send_frame(
            &mut ws_sink,
            &Frame::AuthResult {
                success: false,
                subdomain: None,
                message: Some("Token not recognized".to_string()),
            },
        )
        .await;
        return;
    };

    let base_domain = &state.config.server.base_domain;
    if send_frame(
        &mut ws_sink,
        &Frame::AuthResult {
            success: true,
            subdomain: Some(device.subdomain.clone()),
            message: Some(format!(
                "Connected as {}.{base_domain}",
                device.subdomain
            )),
        },
    )
    .await
    .is_err()
    {
        return;
    }

    let subdomain = device.subdomain.clone();
    info!(subdomain = %subdomain, client_version = %client_version, "Agent authenticated");

    let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(256);
    let tunnel = Arc::new(Tunnel::new(device, outbound_tx));
    state.registry.register(Arc::clone(&tunnel));

    let writer_task = tokio::spawn(writer_loop(ws_sink, outbound_rx, tunnel.closed()));

    // Read loop: dispatch frames until disconnect, idle timeout, protocol
    // error, or eviction by a replacement connection.
    let mut closed = tunnel.closed();
    loop {
        let msg = tokio::select! {
            _ = closed.changed() => {
                info!(subdomain = %subdomain, "Tunnel closed, ending read loop");
                break;
            }
            msg = tokio::time::timeout(READ_DEADLINE, ws_stream.next()) => msg,
        };

        let msg = match msg {
            Err(_) => {
                warn!(subdomain = %subdomain, "Agent idle past read deadline");
                break;
            }
            Ok(None) => {
                info!(subdomain = %subdomain, "Agent disconnected");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(subdomain = %subdomain, "Agent read error: {e}");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => match protocol::decode(&text) {
                Ok(frame) => {
                    if let Some(reply) = tunnel.handle_frame(frame) {
                        if tunnel.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Err(DecodeError::UnknownType(t)) => {
                    warn!(subdomain = %subdomain, frame_type = %t, "Unknown frame type, dropping");
                }
                Err(e) => {
                    warn!(subdomain = %subdomain, "Protocol error, closing tunnel: {e}");
                    break;
                }
            },
            Message::Close(_) => {
                info!(subdomain = %subdomain, "Agent sent close");
                break;
            }
            // Pongs (and axum's auto-answered pings) refresh the read
            // deadline by completing the read.
            _ => {}
        }
    }

    tunnel.close();
    state.registry.unregister(&tunnel);
    writer_task.abort();
}

/// Single writer for the connection: drains the tunnel's outbound channel and
/// emits protocol pings. Frames are serialized here and nowhere else.
async fn writer_loop(
    mut ws_sink: WsSink,
    mut outbound_rx: mpsc::Receiver<Frame>,
    mut closed: tokio::sync::watch::Receiver<bool>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = closed.changed() => break,
            _ = ping.tick() => {
                let write = ws_sink.send(Message::Ping(Vec::new().into()));
                match tokio::time::timeout(WRITE_DEADLINE, write).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                let text = protocol::encode(&frame);
                let write = ws_sink.send(Message::Text(text.into()));
                match tokio::time::timeout(WRITE_DEADLINE, write).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
}

async fn send_frame(ws_sink: &mut WsSink, frame: &Frame) -> Result<(), axum::Error> {
    ws_sink
        .send(Message::Text(protocol::encode(frame).into()))
        .await
}
