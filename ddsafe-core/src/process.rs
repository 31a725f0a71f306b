//! Short-lived helper subprocesses (`lsblk`, `umount`) run with a deadline.
//!
//! These tools are expected to answer in well under a second. When one
//! hangs (a wedged USB bridge can stall `lsblk` indefinitely), it is killed
//! and the caller gets [`Error::CatalogUnavailable`] instead of a frozen UI.
use crate::error::{Error, Result};
use std::io::{ErrorKind, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of a helper invocation.
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `command` to completion, killing it if it outlives `timeout`.
pub fn run_bounded(mut command: Command, timeout: Duration) -> Result<Captured> {
    let program = command.get_program().to_string_lossy().into_owned();

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::CatalogUnavailable(format!("{program} is not installed")),
            _ => Error::CatalogUnavailable(format!("failed to start {program}: {e}")),
        })?;

    // Drain both pipes on their own threads so a chatty tool never blocks on
    // a full pipe while we wait for it.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!(program = %program, ?timeout, "helper timed out, killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::CatalogUnavailable(format!(
                "{program} did not answer within {}s",
                timeout.as_secs_f32()
            )));
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout.map(join).unwrap_or_default();
    let stderr = stderr.map(join).unwrap_or_default();
    debug!(program = %program, %status, "helper finished");

    Ok(Captured {
        status,
        stdout,
        stderr,
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_output_of_a_quick_command() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let captured = run_bounded(cmd, Duration::from_secs(5)).unwrap();
        assert!(captured.status.success());
        assert_eq!(captured.stdout.trim(), "out");
        assert_eq!(captured.stderr.trim(), "err");
    }

    #[test]
    fn missing_tool_is_catalog_unavailable() {
        let cmd = Command::new("ddsafe-no-such-tool");
        let err = run_bounded(cmd, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::CatalogUnavailable(msg) if msg.contains("not installed")));
    }

    #[test]
    fn hung_tool_is_killed_at_the_deadline() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = Instant::now();
        let err = run_bounded(cmd, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, Error::CatalogUnavailable(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
