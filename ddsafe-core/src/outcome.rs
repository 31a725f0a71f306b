use crate::engine::TransferProgress;
use crate::error::Error;
use crate::request::OperationRequest;
use crate::verify::VerificationResult;
use chrono::{DateTime, Local};
use std::fmt;

/// Terminal status of one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    Succeeded,
    Failed,
    /// Stopped by the operator, either at the prompt or mid-transfer.
    Aborted,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Succeeded => f.write_str("succeeded"),
            OperationStatus::Failed => f.write_str("failed"),
            OperationStatus::Aborted => f.write_str("aborted"),
        }
    }
}

/// What is known about the destination after the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Integrity {
    /// Nothing was written.
    Untouched,
    /// Digests matched.
    Verified,
    /// Digests differ.
    Mismatch,
    /// The copy finished but no digest was compared.
    Unverified,
    /// The executor stopped part-way; the destination holds whatever it
    /// managed to write.
    Unknown,
    /// A partial image file was deleted.
    Discarded,
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Integrity::Untouched => "untouched",
            Integrity::Verified => "verified",
            Integrity::Mismatch => "MISMATCH",
            Integrity::Unverified => "unverified",
            Integrity::Unknown => "unknown (partial write)",
            Integrity::Discarded => "partial image removed",
        };
        f.write_str(text)
    }
}

/// Terminal record of an operation.
#[derive(Debug)]
pub struct OperationOutcome {
    pub request: OperationRequest,
    pub status: OperationStatus,
    pub error: Option<Error>,
    /// Last progress sample. `None` when the executor never started.
    pub progress: Option<TransferProgress>,
    pub verification: Option<VerificationResult>,
    pub integrity: Integrity,
    pub finished_at: DateTime<Local>,
}

impl OperationOutcome {
    /// An operation that ended before anything was spawned.
    pub fn not_started(request: OperationRequest, status: OperationStatus, error: Error) -> Self {
        Self {
            request,
            status,
            error: Some(error),
            progress: None,
            verification: None,
            integrity: Integrity::Untouched,
            finished_at: Local::now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == OperationStatus::Succeeded
    }

    /// The mismatch warning, if verification ran and failed.
    pub fn verification_warning(&self) -> Option<Error> {
        self.verification.as_ref().and_then(VerificationResult::mismatch)
    }
}
