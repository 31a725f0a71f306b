//! Launches and supervises the external copy/erase executor.
//!
//! A transfer runs as two concurrent activities. The supervisor (the thread
//! calling [`TransferEngine::execute`]) owns the child process: it alone
//! waits on it, terminates it on cancellation and decides the outcome. A
//! poller thread owns the child's stderr, parses interim byte counts and
//! hands them to the supervisor over a one-slot channel. Progress samples
//! are delivered to the observer on a fixed cadence from the supervisor.
mod executor;
mod progress;
mod supervisor;

pub use executor::{CopyJob, DdExecutor, Executor, Input, classify_diagnostics};
pub use progress::{DdStatusParser, ProgressParser, TransferProgress};

use crate::error::{Error, Result, Violation};
use crate::logging::LogThrottle;
use crate::outcome::{Integrity, OperationOutcome, OperationStatus};
use crate::request::{OperationKind, OperationRequest, Source, Target};
use chrono::Local;
use crossbeam_channel::{never, select, tick};
use progress::ProgressMonitor;
use std::io::Read;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use supervisor::{ChildGuard, spawn_feeder, spawn_poller};
use tracing::{debug, error, info, info_span, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle of a single transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Idle, Running) | (Running, Succeeded) | (Running, Failed) | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Succeeded | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Runs exactly one [`OperationRequest`] through an [`Executor`].
///
/// An engine is single-use: once it leaves `Idle` it never runs again. A
/// retry is a new request on a new engine.
pub struct TransferEngine<E = DdExecutor> {
    executor: E,
    progress_interval: Duration,
    kill_grace: Duration,
    state: TransferState,
}

impl<E: Executor> TransferEngine<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            progress_interval: Duration::from_secs(1),
            kill_grace: Duration::from_secs(3),
            state: TransferState::Idle,
        }
    }

    /// How often the observer receives a progress sample.
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// How long a cancelled executor gets to exit after SIGTERM before SIGKILL.
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    fn transition(&mut self, next: TransferState) {
        if self.state.can_transition_to(next) {
            debug!(from = ?self.state, to = ?next, "transfer state");
            self.state = next;
        } else {
            error!(from = ?self.state, to = ?next, "invalid transfer state transition ignored");
        }
    }

    /// Executes `request`, invoking `on_progress` roughly once per
    /// progress interval while the executor runs.
    ///
    /// Clearing `running` cancels the transfer: the executor is stopped and
    /// reaped before this returns. Failures are never retried; a destructive
    /// transfer that fails leaves the destination as the executor left it,
    /// reported as [`Integrity::Unknown`].
    pub fn execute<F>(
        &mut self,
        request: OperationRequest,
        running: Arc<AtomicBool>,
        mut on_progress: F,
    ) -> OperationOutcome
    where
        F: FnMut(&TransferProgress),
    {
        if self.state != TransferState::Idle {
            return OperationOutcome::not_started(
                request,
                OperationStatus::Failed,
                Error::InvalidRequest("transfer engine has already been used".into()),
            );
        }

        if request.kind().is_destructive() && !request.is_confirmed() {
            warn!(kind = %request.kind(), "refusing unconfirmed destructive request");
            return OperationOutcome::not_started(
                request,
                OperationStatus::Failed,
                Error::violation(Violation::NotConfirmed),
            );
        }

        let span = info_span!(
            "transfer",
            kind = %request.kind(),
            source = %request.source(),
            destination = %request.target()
        );
        let _entered = span.enter();

        self.transition(TransferState::Running);
        let mut monitor = ProgressMonitor::new(request.expected_bytes(), request.passes());
        let result = self.run_passes(&request, &running, &mut monitor, &mut on_progress);

        let (state, status, error) = match result {
            Ok(()) => {
                monitor.settle_total();
                (TransferState::Succeeded, OperationStatus::Succeeded, None)
            }
            Err(Error::Cancelled) => (
                TransferState::Cancelled,
                OperationStatus::Aborted,
                Some(Error::Cancelled),
            ),
            Err(e) => (TransferState::Failed, OperationStatus::Failed, Some(e)),
        };
        self.transition(state);

        let progress = monitor.snapshot();
        if state == TransferState::Succeeded {
            on_progress(&progress);
        }

        let integrity = match (state, request.target()) {
            (TransferState::Succeeded, _) => Integrity::Unverified,
            (_, Target::Image(path)) => discard_partial_image(path),
            (_, Target::Device(_)) => Integrity::Unknown,
        };

        match &error {
            None => info!(bytes = progress.bytes_copied, "transfer complete"),
            Some(e) => warn!(bytes = progress.bytes_copied, error = %e, "transfer stopped"),
        }

        OperationOutcome {
            request,
            status,
            error,
            progress: Some(progress),
            verification: None,
            integrity,
            finished_at: Local::now(),
        }
    }

    fn run_passes<F>(
        &self,
        request: &OperationRequest,
        running: &Arc<AtomicBool>,
        monitor: &mut ProgressMonitor,
        on_progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&TransferProgress),
    {
        let passes = request.passes();
        let per_pass = request.expected_bytes().map(|total| total / u64::from(passes));

        for pass in 1..=passes {
            if !running.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if passes > 1 {
                info!(pass, passes, "starting pass");
            }

            let (job, feed) = plan(request)?;
            let moved = self.run_job(&job, feed, running, monitor, on_progress)?;

            let moved = match (moved, per_pass) {
                (Some(moved), Some(expected)) if moved < expected => {
                    return Err(Error::IoFailure(format!(
                        "short copy: executor stopped after {moved} of {expected} bytes"
                    )));
                }
                (Some(moved), _) => moved,
                // Executor reported nothing; a clean exit means it copied it all.
                (None, Some(expected)) => expected,
                (None, None) => monitor.copied(),
            };
            monitor.complete_pass(moved);
        }
        Ok(())
    }

    /// Runs one executor invocation to completion.
    ///
    /// Returns the byte count the executor (or the stdin feeder) reported.
    fn run_job<F>(
        &self,
        job: &CopyJob,
        feed: Option<Box<dyn Read + Send>>,
        running: &Arc<AtomicBool>,
        monitor: &mut ProgressMonitor,
        on_progress: &mut F,
    ) -> Result<Option<u64>>
    where
        F: FnMut(&TransferProgress),
    {
        let mut command = self.executor.command(job);
        command
            .stdin(if feed.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = ChildGuard::spawn(command, self.kill_grace)
            .map_err(|e| Error::IoFailure(format!("failed to start executor: {e}")))?;
        info!(pid = child.id(), output = %job.output.display(), "executor started");

        let stderr = child
            .take_stderr()
            .ok_or_else(|| Error::IoFailure("executor stderr unavailable".into()))?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        let poller = spawn_poller(stderr, self.executor.progress_parser(), tx);

        let feeder = match feed {
            Some(reader) => {
                let stdin = child
                    .take_stdin()
                    .ok_or_else(|| Error::IoFailure("executor stdin unavailable".into()))?;
                Some(spawn_feeder(reader, stdin, running.clone()))
            }
            None => None,
        };

        let ticker = tick(self.progress_interval);
        let throttle = LogThrottle::new(Duration::from_secs(5));
        let closed = never();
        let mut stderr_open = true;

        let status = loop {
            let samples = if stderr_open { &rx } else { &closed };
            select! {
                recv(samples) -> msg => match msg {
                    Ok(bytes) => monitor.observe(bytes),
                    Err(_) => stderr_open = false,
                },
                recv(ticker) -> _ => {
                    let sample = monitor.snapshot();
                    if throttle.should_log() {
                        debug!(bytes = sample.bytes_copied, rate = sample.throughput, "progress");
                    }
                    on_progress(&sample);
                },
                default(POLL_INTERVAL) => {},
            }

            if !running.load(Ordering::SeqCst) {
                warn!(pid = child.id(), "cancellation requested, stopping executor");
                let status = child.terminate()?;
                debug!(%status, "executor stopped");
                // Both threads end once the child's pipes close.
                let _ = poller.join();
                if let Some(feeder) = feeder {
                    let _ = feeder.join();
                }
                return Err(Error::Cancelled);
            }

            if let Some(status) = child.try_wait()? {
                break status;
            }
        };
        child.kill_stragglers();

        let report = poller.join().unwrap_or_default();
        if let Some(bytes) = report.last_bytes {
            monitor.observe(bytes);
        }
        let fed = match feeder {
            Some(handle) => Some(
                handle
                    .join()
                    .map_err(|_| Error::IoFailure("image feeder panicked".into()))?,
            ),
            None => None,
        };

        debug!(%status, bytes = ?report.last_bytes, "executor exited");
        if !status.success() {
            let err = self.executor.classify_failure(status, &report.diagnostics);
            error!(error = %err, "executor failed");
            return Err(err);
        }

        match fed {
            Some(Err(e)) => Err(Error::IoFailure(format!("reading image failed: {e}"))),
            Some(Ok(fed)) => Ok(Some(report.last_bytes.unwrap_or(fed))),
            None => Ok(report.last_bytes),
        }
    }
}

/// Builds the executor invocation for one pass of `request`.
fn plan(request: &OperationRequest) -> Result<(CopyJob, Option<Box<dyn Read + Send>>)> {
    let block_size = request.block_size();
    let output = request.target().path().to_path_buf();
    let truncate = matches!(request.target(), Target::Image(_));

    let job = |input, count| CopyJob {
        input,
        output: output.clone(),
        block_size,
        count,
        truncate,
    };

    let planned = match (request.kind(), request.source(), request.target()) {
        (_, Source::Device(device), _) => (
            job(Input::Path(device.path.clone()), Some(device.size_bytes)),
            None,
        ),
        (_, Source::Image(image), _) if image.is_compressed() => {
            (job(Input::Stdin, None), Some(image.reader()?))
        }
        (_, Source::Image(image), _) => (
            job(Input::Path(image.path().to_path_buf()), image.decoded_len()),
            None,
        ),
        (OperationKind::Wipe, Source::Fill(fill), Target::Device(device)) => (
            job(Input::Path(fill.pattern.device().to_path_buf()), Some(device.size_bytes)),
            None,
        ),
        (kind, source, target) => {
            return Err(Error::InvalidRequest(format!(
                "{kind} cannot copy from {source} to {target}"
            )));
        }
    };
    Ok(planned)
}

fn discard_partial_image(path: &std::path::Path) -> Integrity {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_file() => {}
        Ok(_) => {
            warn!(image = %path.display(), "not a regular file, leaving it in place");
            return Integrity::Unknown;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Integrity::Untouched,
        Err(e) => {
            warn!(image = %path.display(), error = %e, "could not inspect partial image");
            return Integrity::Unknown;
        }
    }
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(image = %path.display(), "removed partial image");
            Integrity::Discarded
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Integrity::Untouched,
        Err(e) => {
            warn!(image = %path.display(), error = %e, "could not remove partial image");
            Integrity::Unknown
        }
    }
}
