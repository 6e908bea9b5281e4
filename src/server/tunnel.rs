//! Per-agent connection state and frame demultiplexer.
//!
//! One [`Tunnel`] exists per connected agent. It owns the outbound half of the
//! connection (a channel drained by a single writer task, so frames are never
//! interleaved), the correlator maps for in-flight requests and commands, the
//! browser sinks for terminal sessions, and the last metrics snapshot.
//!
//! Correlators are single-use: each waiter holds a `oneshot` receiver and the
//! read loop fills the matching sender exactly once. A reply with no waiting
//! correlator (already timed out, or spurious) is logged and dropped. Closing
//! the tunnel drains every correlator and terminal sink, which unblocks all
//! waiting callers with [`TunnelError::Closed`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::protocol::{self, Frame, MetricsReport};
use crate::store::Device;

/// How long a proxied HTTP request may wait for its response frame.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
/// How long an exec command may wait for its result frame.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(90);

/// Why a tunnel call failed.
#[derive(Debug, PartialEq, Eq)]
pub enum TunnelError {
    /// The tunnel shut down before a reply arrived.
    Closed,
    /// No reply within the deadline.
    Timeout,
    /// The agent's reply could not be decoded.
    BadReply(String),
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::Closed => write!(f, "tunnel closed"),
            TunnelError::Timeout => write!(f, "request timeout"),
            TunnelError::BadReply(e) => write!(f, "bad reply from agent: {e}"),
        }
    }
}

impl std::error::Error for TunnelError {}

/// A decoded `response` frame, returned by [`Tunnel::forward`].
#[derive(Debug)]
pub struct ForwardReply {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// A decoded `command_result` frame, returned by [`Tunnel::exec`].
#[derive(Debug)]
pub struct ExecReply {
    pub exit_code: i32,
    pub output: Vec<u8>,
    pub error: Option<String>,
}

/// Server-side half of one agent connection.
pub struct Tunnel {
    /// Device snapshot taken at authentication time.
    pub device: Device,
    outbound: mpsc::Sender<Frame>,
    pending_requests: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    pending_commands: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    terminal_sessions: Mutex<HashMap<String, mpsc::Sender<Frame>>>,
    metrics: Mutex<Option<(MetricsReport, Instant)>>,
    closed_tx: watch::Sender<bool>,
}

impl Tunnel {
    /// Build a tunnel around an authenticated device and its outbound frame
    /// channel. The receiver side must be drained by exactly one writer task.
    pub fn new(device: Device, outbound: mpsc::Sender<Frame>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            device,
            outbound,
            pending_requests: Mutex::new(HashMap::new()),
            pending_commands: Mutex::new(HashMap::new()),
            terminal_sessions: Mutex::new(HashMap::new()),
            metrics: Mutex::new(None),
            closed_tx,
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// A receiver that resolves when the tunnel closes.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Queue a frame for the writer task.
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Send a `request` frame and wait up to 30 s for the correlated
    /// `response`. The correlator is removed on every exit path, so a late
    /// response frame is dropped silently.
    pub async fn forward(
        &self,
        request_id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: &[u8],
    ) -> Result<ForwardReply, TunnelError> {
        let (tx, rx) = oneshot::channel();
        insert_pending(&self.pending_requests, &request_id, tx);
        let _guard = PendingGuard {
            map: &self.pending_requests,
            id: &request_id,
        };

        let frame = Frame::Request {
            request_id: request_id.clone(),
            method,
            path,
            headers,
            body_base64: protocol::encode_body(body),
        };
        self.send(frame).await?;

        let reply = await_reply(rx, FORWARD_TIMEOUT).await?;
        match reply {
            Frame::Response {
                status_code,
                headers,
                body_base64,
                ..
            } => {
                let body = protocol::decode_body(body_base64.as_deref())
                    .map_err(|e| TunnelError::BadReply(e.to_string()))?;
                Ok(ForwardReply {
                    status_code,
                    headers,
                    body,
                })
            }
            other => Err(TunnelError::BadReply(format!(
                "expected response frame, got {}",
                other.kind()
            ))),
        }
    }

    /// Send an `exec` command and wait up to 90 s for its result.
    pub async fn exec(&self, shell: String, dry_run: bool) -> Result<ExecReply, TunnelError> {
        let command_id = format!("cmd_{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        insert_pending(&self.pending_commands, &command_id, tx);
        let _guard = PendingGuard {
            map: &self.pending_commands,
            id: &command_id,
        };

        self.send(Frame::Command {
            command_id: command_id.clone(),
            command: "exec".to_string(),
            shell: Some(shell),
            dry_run: Some(dry_run),
        })
        .await?;

        let reply = await_reply(rx, EXEC_TIMEOUT).await?;
        match reply {
            Frame::CommandResult {
                exit_code,
                output,
                error,
                ..
            } => {
                let output = protocol::decode_body(Some(&output))
                    .map_err(|e| TunnelError::BadReply(e.to_string()))?;
                Ok(ExecReply {
                    exit_code,
                    output,
                    error,
                })
            }
            other => Err(TunnelError::BadReply(format!(
                "expected command_result frame, got {}",
                other.kind()
            ))),
        }
    }

    /// Fire a `reboot` command. No result correlation.
    pub async fn reboot(&self) -> Result<(), TunnelError> {
        self.send(Frame::Command {
            command_id: format!("cmd_{}", uuid::Uuid::new_v4().simple()),
            command: "reboot".to_string(),
            shell: None,
            dry_run: None,
        })
        .await
    }

    /// Latest metrics report and its age, if the agent has sent one.
    pub fn metrics(&self) -> Option<(MetricsReport, Instant)> {
        *self.metrics.lock().expect("metrics lock poisoned")
    }

    /// Attach a browser sink for a terminal session.
    pub fn register_terminal(&self, session_id: &str, sink: mpsc::Sender<Frame>) {
        self.terminal_sessions
            .lock()
            .expect("terminal lock poisoned")
            .insert(session_id.to_string(), sink);
    }

    /// Detach a browser sink. Idempotent.
    pub fn unregister_terminal(&self, session_id: &str) {
        self.terminal_sessions
            .lock()
            .expect("terminal lock poisoned")
            .remove(session_id);
    }

    /// Dispatch one inbound frame from the agent. Returns an immediate reply
    /// frame when one is due (`ping` → `pong`).
    pub fn handle_frame(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Ping => return Some(Frame::Pong),
            Frame::Response { ref request_id, .. } => {
                let sender = self
                    .pending_requests
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(request_id);
                match sender {
                    Some(tx) => {
                        // Receiver may have been dropped by a disconnected
                        // public caller; the late response is dropped here.
                        let _ = tx.send(frame);
                    }
                    None => {
                        debug!(
                            subdomain = %self.device.subdomain,
                            request_id, "Response with no waiting request"
                        );
                    }
                }
            }
            Frame::CommandResult { ref command_id, .. } => {
                let sender = self
                    .pending_commands
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(command_id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => {
                        debug!(
                            subdomain = %self.device.subdomain,
                            command_id, "Command result with no waiting command"
                        );
                    }
                }
            }
            Frame::Metrics(report) => {
                *self.metrics.lock().expect("metrics lock poisoned") =
                    Some((report, Instant::now()));
            }
            Frame::TerminalData { ref session_id, .. } => {
                self.route_terminal(session_id, frame.clone(), false);
            }
            Frame::TerminalClose { ref session_id } => {
                self.route_terminal(session_id, frame.clone(), true);
            }
            other => {
                warn!(
                    subdomain = %self.device.subdomain,
                    kind = other.kind(),
                    "Unexpected frame from agent"
                );
            }
        }
        None
    }

    /// Forward a terminal frame to its browser sink, removing the session
    /// when the agent closed it. Unknown sessions are dropped.
    fn route_terminal(&self, session_id: &str, frame: Frame, remove: bool) {
        let sink = {
            let mut sessions = self
                .terminal_sessions
                .lock()
                .expect("terminal lock poisoned");
            if remove {
                sessions.remove(session_id)
            } else {
                sessions.get(session_id).cloned()
            }
        };
        let Some(sink) = sink else {
            debug!(session_id, "Terminal frame for unknown session");
            return;
        };
        if sink.try_send(frame).is_err() {
            warn!(
                subdomain = %self.device.subdomain,
                session_id, "Dropped terminal frame (browser backpressure)"
            );
        }
    }

    /// Shut the tunnel down: unblock every waiting forward/exec with
    /// [`TunnelError::Closed`], release every terminal browser sink, and stop
    /// the writer and read loops. Idempotent.
    pub fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return; // already closed
        }

        let drained_requests = {
            let mut pending = self
                .pending_requests
                .lock()
                .expect("pending lock poisoned");
            pending.drain().count()
        };
        let drained_commands = {
            let mut pending = self
                .pending_commands
                .lock()
                .expect("pending lock poisoned");
            pending.drain().count()
        };
        self.terminal_sessions
            .lock()
            .expect("terminal lock poisoned")
            .clear();

        if drained_requests + drained_commands > 0 {
            info!(
                subdomain = %self.device.subdomain,
                requests = drained_requests,
                commands = drained_commands,
                "Drained pending calls on tunnel close"
            );
        }
    }
}

fn insert_pending(
    map: &Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    id: &str,
    tx: oneshot::Sender<Frame>,
) {
    map.lock()
        .expect("pending lock poisoned")
        .insert(id.to_string(), tx);
}

/// Wait on a correlator with a deadline. A dropped sender means the tunnel
/// drained it on close.
async fn await_reply(
    rx: oneshot::Receiver<Frame>,
    deadline: Duration,
) -> Result<Frame, TunnelError> {
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(frame)) => Ok(frame),
        Ok(Err(_)) => Err(TunnelError::Closed),
        Err(_) => Err(TunnelError::Timeout),
    }
}

/// Removes a correlator entry on every exit path (reply, timeout,
/// cancellation of the caller). Removal after delivery is a no-op.
struct PendingGuard<'a> {
    map: &'a Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.map.lock().expect("pending lock poisoned").remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, Tier};
    use std::time::SystemTime;

    fn test_device(subdomain: &str) -> Device {
        Device {
            id: format!("dev-{subdomain}"),
            subdomain: subdomain.to_string(),
            tier: Tier::Free,
            tunnel_enabled: true,
            created_at: SystemTime::now(),
            last_seen_at: None,
            online: false,
        }
    }

    fn test_tunnel() -> (Tunnel, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        (Tunnel::new(test_device("mypi"), tx), rx)
    }

    #[tokio::test]
    async fn test_forward_delivers_correlated_response() {
        let (tunnel, mut rx) = test_tunnel();

        let forward = tunnel.forward(
            "req_1".to_string(),
            "GET".to_string(),
            "/ping".to_string(),
            HashMap::new(),
            b"",
        );

        let deliver = async {
            // The request frame goes out first.
            let sent = rx.recv().await.unwrap();
            assert!(matches!(&sent, Frame::Request { request_id, .. } if request_id == "req_1"));
            tunnel.handle_frame(Frame::Response {
                request_id: "req_1".to_string(),
                status_code: 200,
                headers: HashMap::new(),
                body_base64: protocol::encode_body(b"pong"),
            });
        };

        let (reply, ()) = tokio::join!(forward, deliver);
        let reply = reply.unwrap();
        assert_eq!(reply.status_code, 200);
        assert_eq!(reply.body, b"pong");
    }

    #[tokio::test]
    async fn test_spurious_response_is_dropped() {
        let (tunnel, _rx) = test_tunnel();
        // No waiting correlator: must not panic or leak.
        tunnel.handle_frame(Frame::Response {
            request_id: "req_unknown".to_string(),
            status_code: 200,
            headers: HashMap::new(),
            body_base64: None,
        });
        assert!(tunnel.pending_requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_timeout_removes_correlator() {
        let (tunnel, mut rx) = test_tunnel();

        let result = tunnel
            .forward(
                "req_slow".to_string(),
                "GET".to_string(),
                "/".to_string(),
                HashMap::new(),
                b"",
            )
            .await;
        assert_eq!(result.unwrap_err(), TunnelError::Timeout);
        assert!(tunnel.pending_requests.lock().unwrap().is_empty());

        // A late response after the timeout is a no-op.
        let _ = rx.try_recv();
        tunnel.handle_frame(Frame::Response {
            request_id: "req_slow".to_string(),
            status_code: 200,
            headers: HashMap::new(),
            body_base64: None,
        });
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_forward() {
        let (tunnel, mut rx) = test_tunnel();

        let forward = tunnel.forward(
            "req_1".to_string(),
            "GET".to_string(),
            "/".to_string(),
            HashMap::new(),
            b"",
        );

        let close = async {
            let _ = rx.recv().await; // wait until the request frame is queued
            tunnel.close();
        };

        let (result, ()) = tokio::join!(forward, close);
        assert_eq!(result.unwrap_err(), TunnelError::Closed);
        assert!(tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (tunnel, rx) = test_tunnel();
        drop(rx); // writer gone
        assert_eq!(tunnel.send(Frame::Pong).await, Err(TunnelError::Closed));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (tunnel, _rx) = test_tunnel();
        assert_eq!(tunnel.handle_frame(Frame::Ping), Some(Frame::Pong));
    }

    #[tokio::test]
    async fn test_metrics_snapshot_replaced() {
        let (tunnel, _rx) = test_tunnel();
        assert!(tunnel.metrics().is_none());

        let report = MetricsReport {
            cpu_temp: 51.0,
            mem_total: 1024,
            mem_free: 512,
            disk_total: 2048,
            disk_free: 1024,
            uptime: 60,
            load_avg: 0.5,
        };
        tunnel.handle_frame(Frame::Metrics(report));
        let (stored, _) = tunnel.metrics().unwrap();
        assert_eq!(stored, report);
    }

    #[tokio::test]
    async fn test_terminal_routing_and_unknown_session() {
        let (tunnel, _rx) = test_tunnel();
        let (sink, mut browser_rx) = mpsc::channel(8);
        tunnel.register_terminal("term_1", sink);

        tunnel.handle_frame(Frame::TerminalData {
            session_id: "term_1".to_string(),
            data_base64: "aGk=".to_string(),
        });
        assert!(matches!(
            browser_rx.recv().await,
            Some(Frame::TerminalData { .. })
        ));

        // Unknown session: dropped without effect.
        tunnel.handle_frame(Frame::TerminalData {
            session_id: "term_ghost".to_string(),
            data_base64: "aGk=".to_string(),
        });

        // Close from the agent removes the registration and notifies the sink.
        tunnel.handle_frame(Frame::TerminalClose {
            session_id: "term_1".to_string(),
        });
        assert!(matches!(
            browser_rx.recv().await,
            Some(Frame::TerminalClose { .. })
        ));
        assert!(tunnel.terminal_sessions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exec_round_trip() {
        let (tunnel, mut rx) = test_tunnel();

        let exec = tunnel.exec("uname -a".to_string(), false);
        let deliver = async {
            let sent = rx.recv().await.unwrap();
            let Frame::Command {
                command_id,
                command,
                shell,
                dry_run,
            } = sent
            else {
                panic!("expected command frame");
            };
            assert_eq!(command, "exec");
            assert_eq!(shell.as_deref(), Some("uname -a"));
            assert_eq!(dry_run, Some(false));
            tunnel.handle_frame(Frame::CommandResult {
                command_id,
                exit_code: 0,
                output: protocol::encode_body(b"Linux").unwrap(),
                error: None,
            });
        };

        let (reply, ()) = tokio::join!(exec, deliver);
        let reply = reply.unwrap();
        assert_eq!(reply.exit_code, 0);
        assert_eq!(reply.output, b"Linux");
    }

    #[test]
    fn test_store_reflects_tunnel_presence() {
        // Registry-level invariant is covered in registry.rs; here only the
        // snapshot fields the proxy relies on.
        let store = Store::new();
        let (device, _) = store.create_device("mypi").unwrap();
        assert!(!device.online);
        store.set_online(&device.id, true);
        assert!(store.lookup_by_id(&device.id).unwrap().online);
    }
}
