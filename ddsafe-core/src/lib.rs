//! The core, UI-agnostic library for the `ddsafe` block device utility.
//!
//! `ddsafe-core` turns raw `dd` invocations into gated, supervised operations.
//! It can be driven by any front-end: the `ddsafe` command-line tool, a test
//! harness, or something else entirely.
//!
//! The library is structured around five components:
//! - [`catalog`]: the [`DeviceCatalog`] trait, backed on Linux by `lsblk`
//!   ([`platform::LsblkCatalog`]).
//! - [`gate`]: the [`SafetyGate`] checks and the [`Confirmer`] protocol.
//! - [`engine`]: the [`TransferEngine`], which spawns and supervises the
//!   external executor and streams [`TransferProgress`].
//! - [`verify`]: streaming MD5/SHA-256 digests and source/destination comparison.
//! - [`coordinator`]: the [`Coordinator`] tying them together for the four
//!   operation kinds (backup, restore, clone, wipe).
//!
//! Requests are assembled with a [`RequestBuilder`]. The only way to get a
//! confirmed request onto the engine is through [`Coordinator::run`].
//!
//! ## Example: Cloning a Disk
//!
//! ```rust,no_run
//! use ddsafe_core::{
//!     ConfirmationSummary, Confirmer, Coordinator, DdExecutor, OperationKind, RequestBuilder,
//!     Result, catalog::DeviceCatalog, platform::LsblkCatalog,
//! };
//! use std::path::Path;
//! use std::sync::{Arc, atomic::AtomicBool};
//! use std::time::Duration;
//!
//! struct AlwaysYes;
//!
//! impl Confirmer for AlwaysYes {
//!     fn confirm(&mut self, summary: &ConfirmationSummary) -> Result<bool> {
//!         println!("{summary}");
//!         Ok(true)
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let catalog = LsblkCatalog::new(Duration::from_secs(10));
//!     let source = catalog.refresh(Path::new("/dev/sda"))?;
//!     let destination = catalog.refresh(Path::new("/dev/sdb"))?;
//!
//!     let request = RequestBuilder::new(OperationKind::Clone)
//!         .source_device(source)
//!         .target_device(destination)
//!         .build()?;
//!
//!     // Cleared from a signal handler to cancel the transfer.
//!     let running = Arc::new(AtomicBool::new(true));
//!
//!     let coordinator = Coordinator::new(catalog, DdExecutor::default());
//!     let outcome = coordinator.run(request, &mut AlwaysYes, running, &mut ())?;
//!
//!     println!("{}: {}", outcome.status, outcome.integrity);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod engine;
pub mod error;
pub mod gate;
pub mod image;
pub mod journal;
pub mod logging;
pub mod outcome;
pub mod platform;
pub mod process;
pub mod request;
pub mod verify;

pub use catalog::DeviceCatalog;
pub use config::Settings;
pub use coordinator::{Coordinator, ProgressObserver};
pub use device::{Device, DeviceKind};
pub use engine::{DdExecutor, Executor, TransferEngine, TransferProgress, TransferState};
pub use error::{Error, Result, Violation};
pub use gate::{ConfirmationSummary, Confirmer, SafetyGate, ValidationResult};
pub use outcome::{Integrity, OperationOutcome, OperationStatus};
pub use request::{
    BlockSize, ChecksumAlgorithm, FillPattern, OperationKind, OperationRequest, RequestBuilder,
};
pub use verify::VerificationResult;
