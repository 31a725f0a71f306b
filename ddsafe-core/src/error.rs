//! Error types shared by every stage of an operation.
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A reason the Safety Gate refused a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Source and destination resolve to the same device.
    #[error("source and destination are the same device ({0})")]
    SameDevice(PathBuf),

    /// Image destination already exists and is not a regular file.
    #[error("{0} exists and is not a regular file")]
    ImageNotAFile(PathBuf),

    /// Destination is the disk the running system lives on.
    #[error("{0} holds the running system")]
    SystemDisk(PathBuf),

    /// Destination (or one of its partitions) is mounted.
    #[error("{path} is mounted at {}", mount_points.join(", "))]
    DestinationMounted {
        path: PathBuf,
        mount_points: Vec<String>,
    },

    /// Destination cannot hold the full source extent.
    #[error("destination holds {available} bytes but the source needs {required}")]
    DestinationTooSmall { required: u64, available: u64 },

    /// Destructive request without operator acknowledgment.
    #[error("destructive operation has not been confirmed")]
    NotConfirmed,

    /// A device no longer matches the snapshot the operator confirmed.
    #[error("{0} changed since it was selected")]
    DeviceChanged(PathBuf),
}

/// Wrapper so a list of violations renders on one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violations(pub Vec<Violation>);

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

/// Main error type for ddsafe-core.
#[derive(Error, Debug)]
pub enum Error {
    /// The enumeration tool is missing, timed out, or printed garbage.
    #[error("device catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("device not found: {0}")]
    NotFound(PathBuf),

    #[error("request rejected: {0}")]
    Validation(Violations),

    /// Target vanished or was grabbed by someone else mid-transfer.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("operation cancelled by user")]
    Cancelled,

    #[error("{algorithm} mismatch: source {source_digest}, destination {destination_digest}")]
    VerificationMismatch {
        algorithm: String,
        source_digest: String,
        destination_digest: String,
    },

    /// A request could not be assembled from the supplied fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl Error {
    /// Shorthand for a rejection carrying a single violation.
    pub fn violation(violation: Violation) -> Self {
        Error::Validation(Violations(vec![violation]))
    }

    /// True for the failures raised while the executor was running.
    pub fn is_transfer_failure(&self) -> bool {
        matches!(
            self,
            Error::DeviceBusy(_) | Error::IoFailure(_) | Error::InsufficientSpace(_)
        )
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
