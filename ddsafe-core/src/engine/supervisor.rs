//! Ownership of the executor child process and the threads attached to it.
use super::progress::ProgressParser;
use crossbeam_channel::Sender;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdin, Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const REAP_POLL: Duration = Duration::from_millis(20);
const DIAGNOSTIC_LINES: usize = 20;
const FEED_BUFFER: usize = 1024 * 1024;

/// Owns a running executor.
///
/// The child is started in its own process group. Dropping the guard kills
/// the whole group and reaps the child, so no exit path can leave an orphaned
/// `dd` writing to a device.
pub(crate) struct ChildGuard {
    child: Child,
    grace: Duration,
    reaped: bool,
}

impl ChildGuard {
    pub(crate) fn spawn(mut command: Command, grace: Duration) -> io::Result<Self> {
        // A terminal Ctrl+C must reach us, not the executor; we decide how it stops.
        command.process_group(0);
        let child = command.spawn()?;
        Ok(Self {
            child,
            grace,
            reaped: false,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.child.id()
    }

    pub(crate) fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub(crate) fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub(crate) fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    fn signal_group(&self, signal: Signal) {
        let pgid = Pid::from_raw(self.child.id() as i32);
        if let Err(errno) = killpg(pgid, signal) {
            debug!(pid = self.child.id(), %errno, ?signal, "signal not delivered");
        }
    }

    /// Kills anything left in the child's process group after it exited.
    pub(crate) fn kill_stragglers(&self) {
        self.signal_group(Signal::SIGKILL);
    }

    /// Asks the executor to stop, escalating to SIGKILL after the grace period,
    /// and waits for it to exit.
    pub(crate) fn terminate(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            self.kill_stragglers();
            return Ok(status);
        }

        self.signal_group(Signal::SIGTERM);
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if let Some(status) = self.try_wait()? {
                self.kill_stragglers();
                return Ok(status);
            }
            thread::sleep(REAP_POLL);
        }

        warn!(pid = self.child.id(), "executor ignored SIGTERM, killing it");
        self.signal_group(Signal::SIGKILL);
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        self.signal_group(Signal::SIGKILL);
        let _ = self.child.wait();
    }
}

/// What the poller saw once the executor's stderr closed.
#[derive(Debug, Default)]
pub(crate) struct PollerReport {
    /// Last byte count the executor reported.
    pub(crate) last_bytes: Option<u64>,
    /// Trailing non-progress lines, used to classify failures.
    pub(crate) diagnostics: String,
}

/// Reads the executor's stderr until it closes.
///
/// Byte counts go to `tx`. The channel is bounded and sends never block: a
/// sample the supervisor has not picked up yet is simply dropped, so a slow
/// observer can never back up the pipe and stall the copy.
pub(crate) fn spawn_poller(
    stderr: ChildStderr,
    mut parser: Box<dyn ProgressParser>,
    tx: Sender<u64>,
) -> JoinHandle<PollerReport> {
    thread::spawn(move || {
        let mut report = PollerReport::default();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_LINES);
        let mut line = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut reader = stderr;

        let mut handle_line = |line: &[u8], report: &mut PollerReport| {
            let text = String::from_utf8_lossy(line);
            let text = text.trim();
            if text.is_empty() {
                return;
            }
            match parser.parse_line(text) {
                Some(bytes) => {
                    report.last_bytes = Some(bytes);
                    // Full: the previous sample is still pending, drop this one.
                    let _ = tx.try_send(bytes);
                }
                None => {
                    if tail.len() == DIAGNOSTIC_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(text.to_string());
                }
            }
        };

        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            // dd redraws its progress line with '\r', the summary uses '\n'.
            for &b in &chunk[..n] {
                if b == b'\r' || b == b'\n' {
                    handle_line(&line, &mut report);
                    line.clear();
                } else {
                    line.push(b);
                }
            }
        }
        if !line.is_empty() {
            handle_line(&line, &mut report);
        }
        drop(handle_line);

        report.diagnostics = tail.into_iter().collect::<Vec<_>>().join("\n");
        report
    })
}

/// Streams `reader` into the executor's stdin, stopping early on cancellation.
///
/// Returns the number of bytes fed. A decode error surfaces here; the
/// executor only sees its stdin close, so the engine must check this result
/// even when the executor exits cleanly.
pub(crate) fn spawn_feeder(
    mut reader: Box<dyn Read + Send>,
    mut stdin: ChildStdin,
    running: Arc<AtomicBool>,
) -> JoinHandle<io::Result<u64>> {
    thread::spawn(move || {
        let mut buffer = vec![0u8; FEED_BUFFER];
        let mut fed: u64 = 0;
        loop {
            if !running.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
            }
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            stdin.write_all(&buffer[..n])?;
            fed += n as u64;
        }
        stdin.flush()?;
        Ok(fed)
    })
}
