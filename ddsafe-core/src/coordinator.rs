//! Drives one operation from request to outcome.
//!
//! The order is fixed: preflight, confirm, validate, unmount (only when
//! asked), refresh and re-validate, transfer, verify, record. Nothing
//! reaches the Transfer Engine without passing validation and an explicit
//! confirmation.
use crate::catalog::DeviceCatalog;
use crate::config::Settings;
use crate::device::Device;
use crate::engine::{DdExecutor, Executor, TransferEngine, TransferProgress};
use crate::error::{Error, Result};
use crate::gate::{ConfirmationSummary, Confirmer, SafetyGate, ValidationResult};
use crate::journal::Journal;
use crate::outcome::{Integrity, OperationOutcome, OperationStatus};
use crate::request::{ChecksumAlgorithm, OperationRequest};
use crate::verify;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Receives live updates while an operation runs. Every method defaults to
/// doing nothing.
pub trait ProgressObserver {
    /// The executor is about to start. `total` is `None` for streamed input.
    fn transfer_started(&mut self, _total: Option<u64>) {}

    fn transfer_progress(&mut self, _progress: &TransferProgress) {}

    /// Digesting both sides, `total` bytes in all.
    fn verification_started(&mut self, _total: Option<u64>) {}

    fn verification_progress(&mut self, _bytes: u64) {}
}

impl ProgressObserver for () {}

pub struct Coordinator<C, E = DdExecutor> {
    catalog: C,
    executor: E,
    gate: SafetyGate,
    progress_interval: Duration,
    kill_grace: Duration,
    journal: Option<Journal>,
}

impl<C: DeviceCatalog, E: Executor + Clone> Coordinator<C, E> {
    pub fn new(catalog: C, executor: E) -> Self {
        Self {
            catalog,
            executor,
            gate: SafetyGate::new(),
            progress_interval: Duration::from_secs(1),
            kill_grace: Duration::from_secs(3),
            journal: None,
        }
    }

    /// Applies the gate, cadence and journal parts of `settings`.
    pub fn with_settings(self, settings: &Settings) -> Self {
        Self {
            gate: SafetyGate::new().allow_system_disk(settings.allow_system_disk),
            progress_interval: settings.progress_interval(),
            kill_grace: settings.kill_grace(),
            journal: settings.journal.clone().map(Journal::new),
            ..self
        }
    }

    pub fn gate(mut self, gate: SafetyGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn journal(mut self, journal: Option<Journal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        self.catalog.list_devices()
    }

    /// Checks a request without asking for confirmation. Front-ends use this
    /// to re-prompt for a field before the operator gets to the final prompt.
    pub fn preflight(&self, request: &OperationRequest) -> ValidationResult {
        self.gate.preflight(request)
    }

    /// Runs `request` to completion.
    ///
    /// `Err` means the request never got as far as the transfer: a
    /// validation failure, an unusable catalog or a failed unmount. The
    /// operator can fix the request and try again. Everything from the
    /// confirmation prompt onwards ends in an [`OperationOutcome`], declined
    /// prompts included.
    pub fn run(
        &self,
        request: OperationRequest,
        confirmer: &mut dyn Confirmer,
        running: Arc<AtomicBool>,
        observer: &mut dyn ProgressObserver,
    ) -> Result<OperationOutcome> {
        self.gate.preflight(&request).into_result()?;

        let summary = ConfirmationSummary::new(&request);
        if !confirmer.confirm(&summary)? {
            info!(kind = %request.kind(), "operator declined");
            return Ok(self.record(OperationOutcome::not_started(
                request,
                OperationStatus::Aborted,
                Error::Cancelled,
            )));
        }
        let request = request.confirm();
        self.gate.validate(&request).into_result()?;

        if request.force_unmount() {
            if let Some(target) = request.target().device().filter(|d| d.is_mounted()) {
                info!(device = %target.path.display(), "unmounting destination");
                self.catalog.unmount(target)?;
            }
        }

        let fresh_source = request
            .source()
            .device()
            .map(|d| self.catalog.refresh(&d.path))
            .transpose()?;
        let fresh_target = request
            .target()
            .device()
            .map(|d| self.catalog.refresh(&d.path))
            .transpose()?;
        self.gate
            .revalidate(&request, fresh_source.as_ref(), fresh_target.as_ref())
            .into_result()?;

        if !running.load(Ordering::SeqCst) {
            return Ok(self.record(OperationOutcome::not_started(
                request,
                OperationStatus::Aborted,
                Error::Cancelled,
            )));
        }

        observer.transfer_started(request.expected_bytes());
        let mut engine = TransferEngine::new(self.executor.clone())
            .progress_interval(self.progress_interval)
            .kill_grace(self.kill_grace);
        let mut outcome = engine.execute(request, running.clone(), |progress| {
            observer.transfer_progress(progress)
        });

        if outcome.succeeded() && outcome.request.checksum() != ChecksumAlgorithm::None {
            self.verify(&mut outcome, &running, observer);
        }

        Ok(self.record(outcome))
    }

    fn verify(
        &self,
        outcome: &mut OperationOutcome,
        running: &AtomicBool,
        observer: &mut dyn ProgressObserver,
    ) {
        let per_pass = outcome
            .progress
            .as_ref()
            .and_then(|p| p.total_bytes.map(|total| total / u64::from(p.passes.max(1))));
        observer.verification_started(per_pass.map(|bytes| bytes.saturating_mul(2)));

        let request = &outcome.request;
        let result = verify::compare(
            request.checksum(),
            request.source(),
            request.target(),
            running,
            |bytes| observer.verification_progress(bytes),
        );

        match result {
            Ok(Some(verification)) => {
                outcome.integrity = if verification.matched {
                    Integrity::Verified
                } else {
                    Integrity::Mismatch
                };
                outcome.verification = Some(verification);
            }
            Ok(None) => {}
            Err(Error::Cancelled) => {
                outcome.status = OperationStatus::Aborted;
                outcome.error = Some(Error::Cancelled);
            }
            // The copy finished; a destination we cannot read back stays unverified.
            Err(e) => {
                warn!(error = %e, "verification could not run");
                outcome.error = Some(e);
            }
        }
    }

    fn record(&self, outcome: OperationOutcome) -> OperationOutcome {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&outcome) {
                warn!(journal = %journal.path().display(), error = %e, "could not write journal");
            }
        }
        outcome
    }
}
