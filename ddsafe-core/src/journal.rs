//! Optional append-only, human-readable operation log.
use crate::error::Result;
use crate::outcome::OperationOutcome;
use chrono::SecondsFormat;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One line per finished operation, appended to a plain-text file.
#[derive(Clone, Debug)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, outcome: &OperationOutcome) -> Result<()> {
        let line = format_entry(outcome);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        debug!(journal = %self.path.display(), "operation recorded");
        Ok(())
    }
}

/// `<rfc3339> <kind> <source> -> <destination> <status> bytes=<n> verify=<..> [error=<..>]`
pub fn format_entry(outcome: &OperationOutcome) -> String {
    let request = &outcome.request;
    let bytes = outcome.progress.as_ref().map_or(0, |p| p.bytes_copied);
    let verify = match &outcome.verification {
        Some(v) if v.matched => format!("{}:match", v.algorithm),
        Some(v) => format!("{}:MISMATCH", v.algorithm),
        None => "none".to_string(),
    };

    let mut line = format!(
        "{} {} {} -> {} {} bytes={} verify={} integrity={}",
        outcome.finished_at.to_rfc3339_opts(SecondsFormat::Secs, false),
        request.kind(),
        request.source(),
        request.target(),
        outcome.status,
        bytes,
        verify,
        outcome.integrity,
    );
    if let Some(error) = &outcome.error {
        line.push_str(&format!(" error=\"{error}\""));
    }
    line
}
