//! Interactive terminal sessions: PTY allocation, shell spawning, and the
//! frame relay for each session.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The PTY master fd is kept for the
//! session lifetime so input, output, and resize all operate on it; it is
//! dup'd into separate tokio file handles for the read and write sides.
//!
//! Session lifecycle: `terminal_open` spawns the user's shell under a PTY
//! sized rows×cols and starts an output reader that emits `terminal_data`
//! frames in ≤ 4 KiB chunks. The session ends on shell exit (emits
//! `terminal_close`), on `terminal_close` from the server, or on agent
//! shutdown ([`PtyManager::close_all`]).

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::protocol::{self, Frame};

/// Terminal output is chunked into frames of at most this many bytes.
const READ_CHUNK: usize = 4096;

/// An allocated PTY pair (master + slave).
struct PtyPair {
    master: OwnedFd,
    slave: OwnedFd,
}

/// Owns all live terminal sessions for one connection.
#[derive(Clone)]
pub struct PtyManager {
    sessions: Arc<Mutex<HashMap<String, PtySession>>>,
    outbound: mpsc::Sender<Frame>,
}

struct PtySession {
    pid: i32,
    /// Kept open for resize ioctls.
    master: OwnedFd,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl PtyManager {
    pub fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            outbound,
        }
    }

    /// `terminal_open`: spawn a shell under a fresh PTY. An existing session
    /// with the same id is closed first. Spawn failure answers
    /// `terminal_close` and is not fatal.
    pub async fn handle_open(&self, session_id: String, rows: u16, cols: u16) {
        if let Some(old) = self.sessions.lock().await.remove(&session_id) {
            warn!(session_id, "Session id reused, closing previous session");
            old.kill();
        }

        let pty = match allocate_pty(rows, cols) {
            Ok(pty) => pty,
            Err(e) => {
                warn!(session_id, "PTY allocation failed: {e}");
                self.send_close(&session_id).await;
                return;
            }
        };

        let shell = login_shell();
        let mut child = match spawn_shell(&pty, &shell) {
            Ok(child) => child,
            Err(e) => {
                warn!(session_id, %shell, "Failed to start shell: {e}");
                self.send_close(&session_id).await;
                return;
            }
        };
        // The child owns the slave side now; only the master stays with us.
        drop(pty.slave);

        #[allow(clippy::cast_possible_wrap)]
        let pid = child.id().map_or(-1, |p| p as i32);
        info!(session_id, %shell, rows, cols, pid, "PTY started");

        let (reader, writer) = match (dup_fd(pty.master.as_raw_fd()), dup_fd(pty.master.as_raw_fd()))
        {
            (Ok(r), Ok(w)) => (r, w),
            _ => {
                warn!(session_id, "Failed to dup PTY master");
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                self.send_close(&session_id).await;
                return;
            }
        };
        let mut master_read = tokio::fs::File::from_std(std::fs::File::from(reader));
        let mut master_write = tokio::fs::File::from_std(std::fs::File::from(writer));

        // Output reader: PTY master → terminal_data frames.
        let out_tx = self.outbound.clone();
        let sid_out = session_id.clone();
        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match master_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = Frame::TerminalData {
                            session_id: sid_out.clone(),
                            data_base64: protocol::encode_body(&buf[..n])
                                .unwrap_or_default(),
                        };
                        if out_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Input writer: stdin channel → PTY master.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let write_task = tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if master_write.write_all(&data).await.is_err() {
                    break;
                }
                if master_write.flush().await.is_err() {
                    break;
                }
            }
        });

        // Exit watcher: reap the shell, emit terminal_close if the session
        // was still live (i.e. not torn down by a close from the server).
        let sessions = Arc::clone(&self.sessions);
        let out_tx = self.outbound.clone();
        // The exit watcher reaps the child after a kill, so it is detached
        // rather than aborted with the I/O tasks.
        let sid_exit = session_id.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            info!(session_id = %sid_exit, ?status, "Shell exited");
            let was_live = {
                let mut sessions = sessions.lock().await;
                sessions.remove(&sid_exit).is_some()
            };
            if was_live {
                let _ = out_tx
                    .send(Frame::TerminalClose {
                        session_id: sid_exit,
                    })
                    .await;
            }
        });

        self.sessions.lock().await.insert(
            session_id,
            PtySession {
                pid,
                master: pty.master,
                stdin_tx,
                tasks: vec![read_task, write_task],
            },
        );
    }

    /// `terminal_data`: write the decoded payload to the PTY input.
    pub async fn handle_data(&self, session_id: &str, data_base64: &str) {
        let stdin_tx = {
            let sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(session_id) else {
                return;
            };
            session.stdin_tx.clone()
        };

        let data = match protocol::decode_body(Some(data_base64)) {
            Ok(data) => data,
            Err(e) => {
                warn!(session_id, "Terminal input decode error: {e}");
                return;
            }
        };
        let _ = stdin_tx.send(data).await;
    }

    /// `terminal_resize`: adjust the PTY window.
    pub async fn handle_resize(&self, session_id: &str, rows: u16, cols: u16) {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(session_id) else {
            return;
        };
        if let Err(e) = resize_pty(&session.master, rows, cols) {
            warn!(session_id, "Resize failed: {e}");
        }
    }

    /// `terminal_close` from the server: kill the shell and release the PTY.
    pub async fn handle_close(&self, session_id: &str) {
        let session = self.sessions.lock().await.remove(session_id);
        if let Some(session) = session {
            session.kill();
            info!(session_id, "Session closed by server");
        }
    }

    /// Close every session and tell the server, used on shutdown and
    /// disconnect.
    pub async fn close_all(&self) {
        let sessions: Vec<(String, PtySession)> =
            self.sessions.lock().await.drain().collect();
        for (session_id, session) in sessions {
            session.kill();
            self.send_close(&session_id).await;
        }
    }

    async fn send_close(&self, session_id: &str) {
        let _ = self
            .outbound
            .send(Frame::TerminalClose {
                session_id: session_id.to_string(),
            })
            .await;
    }
}

impl PtySession {
    /// Kill the shell and stop the session's I/O tasks. The PTY master fd is
    /// released when the session drops.
    fn kill(&self) {
        if self.pid > 0 {
            let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Allocate a PTY pair sized rows×cols.
fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let OpenptyResult { master, slave } = openpty(&winsize, None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn a shell on the slave side of the PTY.
///
/// The child becomes a session leader with the PTY slave as its controlling
/// terminal; stdin/stdout/stderr are all connected to the slave fd.
fn spawn_shell(pty: &PtyPair, shell: &str) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(shell);
    cmd.env("TERM", "xterm-256color").kill_on_drop(true);

    // The child's stdio is wired up in pre_exec (dup2 to the PTY slave), so
    // tokio must not set up pipes.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: all syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(winsize),
        )
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

fn dup_fd(fd: RawFd) -> std::io::Result<OwnedFd> {
    // SAFETY: dup returns a fresh fd we immediately take ownership of.
    let new_fd = unsafe { libc::dup(fd) };
    if new_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

/// The user's shell: `$SHELL`, else `/bin/bash` when present, else `/bin/sh`.
fn login_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    for sh in ["/bin/bash", "/bin/sh"] {
        if Path::new(sh).exists() {
            return sh.to_string();
        }
    }
    "/bin/sh".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_shell_never_empty() {
        assert!(!login_shell().is_empty());
    }

    #[test]
    fn test_allocate_and_resize_pty() {
        let pty = allocate_pty(24, 80).unwrap();
        resize_pty(&pty.master, 40, 120).unwrap();
    }

    #[tokio::test]
    async fn test_data_for_unknown_session_is_dropped() {
        let (tx, _rx) = mpsc::channel(8);
        let manager = PtyManager::new(tx);
        manager.handle_data("term_ghost", "aGk=").await;
        manager.handle_resize("term_ghost", 24, 80).await;
        manager.handle_close("term_ghost").await;
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (tx, mut rx) = mpsc::channel(256);
        let manager = PtyManager::new(tx);
        manager.handle_open("term_1".to_string(), 24, 80).await;

        // Feed a command and watch for its echo in the output stream.
        let input = protocol::encode_body(b"echo tunnel-ok\n").unwrap();
        manager.handle_data("term_1", &input).await;

        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            let frame = tokio::select! {
                frame = rx.recv() => frame,
                () = tokio::time::sleep_until(deadline) => break,
            };
            match frame {
                Some(Frame::TerminalData { data_base64, .. }) => {
                    let bytes = protocol::decode_body(Some(&data_base64)).unwrap();
                    seen.push_str(&String::from_utf8_lossy(&bytes));
                    if seen.contains("tunnel-ok") {
                        break;
                    }
                }
                Some(_) | None => break,
            }
        }
        assert!(seen.contains("tunnel-ok"), "no echo in output: {seen:?}");

        manager.close_all().await;
        assert!(manager.sessions.lock().await.is_empty());
    }
}
