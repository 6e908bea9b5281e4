//! Remote command execution: `reboot` and `exec` dispatch.
//!
//! `exec` runs `sh -c <shell>` with stdout and stderr drained concurrently
//! (closing a pipe early while the child is still writing to the other one
//! deadlocks, so both streams are read past the cap and the excess
//! discarded). Combined output is truncated at 64 KiB and travels
//! base64-encoded in the `command_result` frame. A command that outlives its
//! 60 s deadline is killed and reported as exit -1.
//!
//! Dry runs of `apt-get` / `apt` commands are rewritten with the simulate
//! flag and actually executed; any other dry run is answered without
//! executing anything.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::{self, Frame};

/// Output cap for combined stdout+stderr.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;
/// Hard deadline for one `exec` command.
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Handle one `command` frame from the server.
pub async fn handle_command(
    command_id: String,
    command: String,
    shell: Option<String>,
    dry_run: bool,
    outbound: mpsc::Sender<Frame>,
) {
    match command.as_str() {
        "reboot" => {
            info!("Reboot command received, rebooting system...");
            match Command::new("sudo").arg("reboot").status().await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("Reboot command exited with {status}"),
                Err(e) => warn!("Reboot failed: {e}"),
            }
        }
        "exec" => {
            let result = exec_command(&command_id, shell.as_deref(), dry_run).await;
            if outbound.send(result).await.is_err() {
                warn!(command_id, "Connection gone before command result could be sent");
            }
        }
        other => {
            warn!(command = other, "Unknown command");
        }
    }
}

async fn exec_command(command_id: &str, shell: Option<&str>, dry_run: bool) -> Frame {
    let Some(shell) = shell.filter(|s| !s.is_empty()) else {
        return result_frame(command_id, -1, b"", Some("no shell command provided"));
    };

    let shell = if dry_run {
        if is_apt_command(shell) {
            insert_apt_simulate(shell)
        } else {
            let output = format!("[dry run] would execute: {shell}");
            return result_frame(command_id, 0, output.as_bytes(), None);
        }
    } else {
        shell.to_string()
    };

    info!(%shell, dry_run, "Executing shell command");

    match run_shell(&shell, EXEC_TIMEOUT).await {
        Ok((exit_code, output)) => result_frame(command_id, exit_code, &output, None),
        Err(RunError::Timeout) => {
            result_frame(command_id, -1, b"", Some("command timed out after 60s"))
        }
        Err(RunError::Spawn(e)) => result_frame(command_id, -1, b"", Some(&e)),
    }
}

fn result_frame(command_id: &str, exit_code: i32, output: &[u8], error: Option<&str>) -> Frame {
    Frame::CommandResult {
        command_id: command_id.to_string(),
        exit_code,
        output: protocol::encode_body(output).unwrap_or_default(),
        error: error.map(ToString::to_string),
    }
}

#[derive(Debug)]
enum RunError {
    /// Deadline exceeded; the child is killed on drop.
    Timeout,
    Spawn(String),
}

/// Run `sh -c <shell>`, returning the exit code and combined output
/// (stdout first, stderr appended), truncated at [`MAX_OUTPUT_BYTES`].
async fn run_shell(shell: &str, deadline: Duration) -> Result<(i32, Vec<u8>), RunError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(shell)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RunError::Spawn(format!("failed to spawn: {e}")))?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let run = async {
        let (out, err) = tokio::join!(
            read_capped(&mut stdout, MAX_OUTPUT_BYTES),
            read_capped(&mut stderr, MAX_OUTPUT_BYTES),
        );
        let status = child.wait().await;
        (out, err, status)
    };

    match tokio::time::timeout(deadline, run).await {
        Ok((out, err, status)) => {
            let exit_code = match status {
                Ok(s) => s.code().unwrap_or(-1),
                Err(_) => -1,
            };
            Ok((exit_code, combine_output(out, err)))
        }
        Err(_) => Err(RunError::Timeout),
    }
}

/// Append stderr after stdout, keeping the total under the cap.
fn combine_output(mut stdout: Vec<u8>, stderr: Vec<u8>) -> Vec<u8> {
    let remaining = MAX_OUTPUT_BYTES.saturating_sub(stdout.len());
    stdout.extend_from_slice(&stderr[..stderr.len().min(remaining)]);
    stdout
}

/// Read a stream to EOF, keeping the first `max_bytes` and draining the rest
/// so the child never blocks on a full pipe.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    buf
}

/// Whether a shell string starts with an apt program token.
fn is_apt_command(cmd: &str) -> bool {
    cmd.starts_with("apt-get ") || cmd.starts_with("apt ")
}

/// Insert the simulate flag after the apt program token.
fn insert_apt_simulate(cmd: &str) -> String {
    if let Some(rest) = cmd.strip_prefix("apt-get ") {
        return format!("apt-get -s {rest}");
    }
    if let Some(rest) = cmd.strip_prefix("apt ") {
        return format!("apt -s {rest}");
    }
    cmd.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apt_detection_is_token_bounded() {
        assert!(is_apt_command("apt-get upgrade -y"));
        assert!(is_apt_command("apt install curl"));
        assert!(!is_apt_command("aptitude install curl"));
        assert!(!is_apt_command("apt-getx"));
        assert!(!is_apt_command("echo apt-get update"));
    }

    #[test]
    fn test_apt_simulate_rewrite() {
        assert_eq!(
            insert_apt_simulate("apt-get upgrade -y"),
            "apt-get -s upgrade -y"
        );
        assert_eq!(insert_apt_simulate("apt install curl"), "apt -s install curl");
        assert_eq!(insert_apt_simulate("uname -a"), "uname -a");
    }

    #[tokio::test]
    async fn test_exec_captures_output_and_exit_code() {
        let (exit_code, output) = run_shell("echo out; echo err >&2; exit 3", EXEC_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(exit_code, 3);
        let text = String::from_utf8_lossy(&output).to_string();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[tokio::test]
    async fn test_exec_timeout_reports_minus_one() {
        let result = run_shell("sleep 5", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(RunError::Timeout)));
    }

    #[tokio::test]
    async fn test_output_truncated_at_cap() {
        // 128 KiB of zeros on stdout, truncated to the 64 KiB cap.
        let (exit_code, output) =
            run_shell("head -c 131072 /dev/zero", EXEC_TIMEOUT).await.unwrap();
        assert_eq!(exit_code, 0);
        assert_eq!(output.len(), MAX_OUTPUT_BYTES);
    }

    #[tokio::test]
    async fn test_dry_run_non_apt_is_synthesized() {
        let frame = exec_command("cmd_1", Some("rm -rf /tmp/x"), true).await;
        let Frame::CommandResult {
            exit_code, output, ..
        } = frame
        else {
            panic!("expected command_result");
        };
        assert_eq!(exit_code, 0);
        let decoded = crate::protocol::decode_body(Some(&output)).unwrap();
        assert_eq!(
            String::from_utf8_lossy(&decoded),
            "[dry run] would execute: rm -rf /tmp/x"
        );
    }

    #[tokio::test]
    async fn test_missing_shell_is_an_error() {
        let frame = exec_command("cmd_1", None, false).await;
        let Frame::CommandResult {
            exit_code, error, ..
        } = frame
        else {
            panic!("expected command_result");
        };
        assert_eq!(exit_code, -1);
        assert_eq!(error.as_deref(), Some("no shell command provided"));
    }
}
