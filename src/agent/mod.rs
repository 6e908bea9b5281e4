//! Edge agent: one persistent outbound connection to the gateway.
//!
//! The client walks INIT → CONNECTING → CONNECTED → BACKOFF → CONNECTING …
//! for the life of the process. A connection attempt covers the transport
//! dial plus the auth handshake (10 s deadline); any failure enters BACKOFF.
//! The backoff delay starts at 1 s, doubles per consecutive failure, caps at
//! 60 s, carries ±20 % jitter, and resets to 1 s after a connection that
//! held for at least five minutes.
//!
//! While connected the client reads frames continuously and dispatches them:
//! `request` to the local HTTP forwarder, `command` to the shell executor,
//! `terminal_*` to the PTY manager. Every 30 s it emits a `ping` and a
//! `metrics` frame; three unanswered pings tear the connection down. All
//! outbound frames funnel through a single writer task that owns the socket
//! sink.

pub mod exec;
pub mod forwarder;
pub mod metrics;
pub mod pty;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::protocol::{self, DecodeError, Frame};
use forwarder::Forwarder;
use pty::PtyManager;

/// First reconnect delay.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// A connection that held this long resets the backoff schedule.
const STABLE_CONNECTION: Duration = Duration::from_secs(300);
/// Deadline for the server's `auth_result`.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);
/// Ping + metrics cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Per-write deadline on the sink.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Unanswered pings tolerated before reconnecting.
const MAX_PONG_MISSES: u32 = 3;

/// Connection state, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Init,
    Connecting,
    Connected,
    Backoff,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelState::Init => "INIT",
            TunnelState::Connecting => "CONNECTING",
            TunnelState::Connected => "CONNECTED",
            TunnelState::Backoff => "BACKOFF",
        };
        write!(f, "{s}")
    }
}

/// Run the agent until the shutdown signal flips. No retries after a local
/// stop.
pub async fn run(config: AgentConfig, mut shutdown: watch::Receiver<bool>) {
    let forwarder = Arc::new(Forwarder::new(&config.local_host, config.local_port));
    let mut delay = INITIAL_BACKOFF;

    info!(state = %TunnelState::Init, "Agent starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        info!(state = %TunnelState::Connecting, server = %config.server, "Connecting");
        let connected_for = match connect_and_run(&config, &forwarder, &mut shutdown).await {
            Ok(connected_for) => Some(connected_for),
            Err(e) => {
                warn!("Connection failed: {e}");
                None
            }
        };

        if *shutdown.borrow() {
            break;
        }

        delay = delay_after_session(delay, connected_for);
        let sleep = jittered(delay);
        info!(state = %TunnelState::Backoff, "Reconnecting in {:.1}s", sleep.as_secs_f64());
        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(sleep) => {}
        }
        delay = next_delay(delay);
    }

    info!("Agent stopped");
}

/// One connection attempt: dial, authenticate, run the steady-state loop.
/// Returns how long the connection stayed authenticated.
async fn connect_and_run(
    config: &AgentConfig,
    forwarder: &Arc<Forwarder>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(config.server.as_str()).await?;
    let (ws_sink, mut ws_stream) = ws_stream.split();

    let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(256);
    let writer_task = tokio::spawn(writer_loop(ws_sink, outbound_rx));

    // Auth handshake: first frame out, single auth_result back within 10 s.
    outbound_tx
        .send(Frame::Auth {
            token: config.token.clone(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .await?;

    let auth_reply = match tokio::time::timeout(AUTH_DEADLINE, ws_stream.next()).await {
        Err(_) => {
            writer_task.abort();
            return Err("timed out waiting for auth result".into());
        }
        Ok(None) => {
            writer_task.abort();
            return Err("connection closed during auth".into());
        }
        Ok(Some(Err(e))) => {
            writer_task.abort();
            return Err(e.into());
        }
        Ok(Some(Ok(Message::Text(text)))) => protocol::decode(&text),
        Ok(Some(Ok(_))) => {
            writer_task.abort();
            return Err("unexpected first frame from server".into());
        }
    };

    match auth_reply {
        Ok(Frame::AuthResult {
            success: true,
            message,
            ..
        }) => {
            info!(
                state = %TunnelState::Connected,
                "{}",
                message.unwrap_or_else(|| "Connected".to_string())
            );
        }
        Ok(Frame::AuthResult {
            success: false,
            message,
            ..
        }) => {
            writer_task.abort();
            return Err(format!(
                "auth rejected: {}",
                message.unwrap_or_else(|| "no reason given".to_string())
            )
            .into());
        }
        Ok(Frame::Error { code, message }) => {
            writer_task.abort();
            return Err(format!("server error: {code} - {message}").into());
        }
        Ok(other) => {
            writer_task.abort();
            return Err(format!("unexpected first frame: {}", other.kind()).into());
        }
        Err(e) => {
            writer_task.abort();
            return Err(format!("bad auth result: {e}").into());
        }
    }

    let connected_at = Instant::now();
    let terminals = PtyManager::new(outbound_tx.clone());
    let pong_misses = Arc::new(AtomicU32::new(0));
    let mut heartbeat_task = tokio::spawn(heartbeat_loop(
        outbound_tx.clone(),
        Arc::clone(&pong_misses),
    ));

    // Steady state: read and dispatch until something ends the connection.
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Stop requested, closing tunnel");
                break;
            }
            reason = &mut heartbeat_task => {
                warn!("Heartbeat ended: {}", reason.unwrap_or("task failed"));
                break;
            }
            msg = ws_stream.next() => {
                match msg {
                    None => {
                        info!("Server closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Connection lost: {e}");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => match protocol::decode(&text) {
                        Ok(frame) => {
                            dispatch(frame, forwarder, &terminals, &outbound_tx, &pong_misses)
                                .await;
                        }
                        Err(DecodeError::UnknownType(t)) => {
                            warn!(frame_type = %t, "Unknown frame type, dropping");
                        }
                        Err(e) => {
                            warn!("Protocol error: {e}");
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) => {
                        info!("Server sent close");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    terminals.close_all().await;
    heartbeat_task.abort();
    writer_task.abort();
    Ok(connected_at.elapsed())
}

/// Route one inbound frame. Request and command handling is spawned so slow
/// local calls never stall the read loop.
async fn dispatch(
    frame: Frame,
    forwarder: &Arc<Forwarder>,
    terminals: &PtyManager,
    outbound: &mpsc::Sender<Frame>,
    pong_misses: &Arc<AtomicU32>,
) {
    match frame {
        Frame::Request {
            request_id,
            method,
            path,
            headers,
            body_base64,
        } => {
            let forwarder = Arc::clone(forwarder);
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let response = forwarder
                    .forward(request_id, method, path, headers, body_base64)
                    .await;
                let _ = outbound.send(response).await;
            });
        }
        Frame::Command {
            command_id,
            command,
            shell,
            dry_run,
        } => {
            let outbound = outbound.clone();
            tokio::spawn(exec::handle_command(
                command_id,
                command,
                shell,
                dry_run.unwrap_or(false),
                outbound,
            ));
        }
        Frame::TerminalOpen {
            session_id,
            rows,
            cols,
        } => {
            terminals.handle_open(session_id, rows, cols).await;
        }
        Frame::TerminalData {
            session_id,
            data_base64,
        } => {
            terminals.handle_data(&session_id, &data_base64).await;
        }
        Frame::TerminalResize {
            session_id,
            rows,
            cols,
        } => {
            terminals.handle_resize(&session_id, rows, cols).await;
        }
        Frame::TerminalClose { session_id } => {
            terminals.handle_close(&session_id).await;
        }
        Frame::Pong => {
            pong_misses.store(0, Ordering::SeqCst);
        }
        Frame::Error { code, message } => {
            warn!("Server error: {code} - {message}");
        }
        other => {
            warn!(kind = other.kind(), "Unexpected frame from server");
        }
    }
}

/// Single writer for the connection; every outbound frame passes through
/// here, bounded by a 10 s deadline per write.
async fn writer_loop(
    mut ws_sink: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    mut outbound_rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let text = protocol::encode(&frame);
        let write = ws_sink.send(Message::Text(text.into()));
        match tokio::time::timeout(WRITE_DEADLINE, write).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }
}

/// Emit ping + metrics every 30 s; returns when the connection looks dead.
async fn heartbeat_loop(outbound: mpsc::Sender<Frame>, pong_misses: Arc<AtomicU32>) -> &'static str {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.tick().await; // the first tick is immediate
    loop {
        interval.tick().await;
        if pong_misses.load(Ordering::SeqCst) >= MAX_PONG_MISSES {
            return "missed pongs";
        }
        if outbound.send(Frame::Ping).await.is_err() {
            return "write channel closed";
        }
        if outbound
            .send(Frame::Metrics(metrics::collect()))
            .await
            .is_err()
        {
            return "write channel closed";
        }
        pong_misses.fetch_add(1, Ordering::SeqCst);
    }
}

/// Backoff delay carried into the next BACKOFF entry: a connection that held
/// ≥ 5 minutes resets the schedule.
fn delay_after_session(delay: Duration, connected_for: Option<Duration>) -> Duration {
    match connected_for {
        Some(d) if d >= STABLE_CONNECTION => INITIAL_BACKOFF,
        _ => delay,
    }
}

/// Double the delay, capped at 60 s.
fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(MAX_BACKOFF)
}

/// Uniform ±20 % jitter.
fn jittered(delay: Duration) -> Duration {
    with_jitter(delay, rand::thread_rng().gen::<f64>())
}

fn with_jitter(delay: Duration, unit: f64) -> Duration {
    let factor = 0.8 + 0.4 * unit;
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = INITIAL_BACKOFF;
        let expected = [2, 4, 8, 16, 32, 60, 60, 60];
        for secs in expected {
            delay = next_delay(delay);
            assert_eq!(delay, Duration::from_secs(secs));
        }
    }

    #[test]
    fn test_kth_failure_delay_window() {
        // The k-th consecutive failure sleeps in
        // [min(2^(k-1), 60) * 0.8, min(2^(k-1), 60) * 1.2].
        let mut delay = INITIAL_BACKOFF;
        for k in 1u32..=10 {
            let base = 2u64.pow(k - 1).min(60);
            let low = Duration::from_secs(base).mul_f64(0.8);
            let high = Duration::from_secs(base).mul_f64(1.2);
            for unit in [0.0, 0.25, 0.5, 0.75, 0.999_999] {
                let sleep = with_jitter(delay, unit);
                assert!(sleep >= low, "k={k} unit={unit}: {sleep:?} < {low:?}");
                assert!(sleep <= high, "k={k} unit={unit}: {sleep:?} > {high:?}");
            }
            delay = next_delay(delay);
        }
    }

    #[test]
    fn test_stable_connection_resets_delay() {
        let ramped = Duration::from_secs(32);
        assert_eq!(
            delay_after_session(ramped, Some(Duration::from_secs(600))),
            INITIAL_BACKOFF
        );
        assert_eq!(
            delay_after_session(ramped, Some(STABLE_CONNECTION)),
            INITIAL_BACKOFF
        );
        // A short-lived connection keeps ramping.
        assert_eq!(
            delay_after_session(ramped, Some(Duration::from_secs(10))),
            ramped
        );
        // So does a failed dial.
        assert_eq!(delay_after_session(ramped, None), ramped);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TunnelState::Init.to_string(), "INIT");
        assert_eq!(TunnelState::Connecting.to_string(), "CONNECTING");
        assert_eq!(TunnelState::Connected.to_string(), "CONNECTED");
        assert_eq!(TunnelState::Backoff.to_string(), "BACKOFF");
    }
}
