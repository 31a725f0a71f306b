//! Post-transfer integrity verification.
//!
//! Digests are computed in-process by streaming the full extent through the
//! hash in fixed-size chunks, so a multi-terabyte device never needs more than
//! one buffer of memory. A mismatch is reported in the [`VerificationResult`],
//! not raised as an error: the copy itself completed, and the operator decides
//! what to do with a destination that does not match.
use crate::error::{Error, Result};
use crate::platform;
use crate::request::{ChecksumAlgorithm, FillPattern, Source, Target};
use md5::Md5;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

// Use a 1 MiB buffer for hashing.
const BUFFER_SIZE: usize = 1024 * 1024;

/// Outcome of comparing source and destination digests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub algorithm: ChecksumAlgorithm,
    pub source_digest: String,
    pub destination_digest: String,
    pub matched: bool,
    /// Number of bytes digested on each side.
    pub bytes: u64,
}

impl VerificationResult {
    /// Converts a mismatch into the corresponding warning error.
    pub fn mismatch(&self) -> Option<Error> {
        (!self.matched).then(|| Error::VerificationMismatch {
            algorithm: self.algorithm.to_string(),
            source_digest: self.source_digest.clone(),
            destination_digest: self.destination_digest.clone(),
        })
    }
}

enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Option<Self> {
        match algorithm {
            ChecksumAlgorithm::None => None,
            ChecksumAlgorithm::Md5 => Some(Hasher::Md5(Md5::new())),
            ChecksumAlgorithm::Sha256 => Some(Hasher::Sha256(Sha256::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Streams `reader` through `algorithm`, stopping after `limit` bytes if given.
///
/// Returns the hex digest and the number of bytes consumed. `on_progress`
/// receives the running byte count after every chunk.
pub fn digest_reader<R, F>(
    reader: R,
    algorithm: ChecksumAlgorithm,
    limit: Option<u64>,
    running: &AtomicBool,
    mut on_progress: F,
) -> Result<(String, u64)>
where
    R: Read,
    F: FnMut(u64),
{
    let mut hasher = Hasher::new(algorithm)
        .ok_or_else(|| Error::InvalidRequest("no checksum algorithm selected".into()))?;

    let mut reader: Box<dyn Read> = match limit {
        Some(limit) => Box::new(reader.take(limit)),
        None => Box::new(reader),
    };

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total: u64 = 0;
    loop {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::IoFailure(format!("read failed while hashing: {e}"))),
        };
        hasher.update(&buffer[..n]);
        total += n as u64;
        on_progress(total);
    }

    Ok((hasher.finalize_hex(), total))
}

/// Digests the full byte extent of a device or file, bypassing cached pages.
pub fn verify(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let extent = platform::extent_of(path)?;
    let file = platform::open_uncached(path)?;
    let running = AtomicBool::new(true);
    let (digest, _) = digest_reader(file, algorithm, Some(extent), &running, |_| {})?;
    Ok(digest)
}

/// Digests the source and the destination of a finished transfer and compares them.
///
/// The destination is read over the source's extent only, since a device is
/// usually larger than the image restored onto it. Returns `Ok(None)` when
/// verification was not requested or cannot be performed (random wipes).
pub fn compare<F>(
    algorithm: ChecksumAlgorithm,
    source: &Source,
    target: &Target,
    running: &AtomicBool,
    mut on_progress: F,
) -> Result<Option<VerificationResult>>
where
    F: FnMut(u64),
{
    if algorithm == ChecksumAlgorithm::None {
        return Ok(None);
    }

    info!(%algorithm, source = %source, destination = %target, "starting verification");

    let (source_digest, extent) = match source {
        Source::Device(device) => {
            let file = File::open(&device.path)?;
            digest_reader(file, algorithm, Some(device.size_bytes), running, &mut on_progress)?
        }
        Source::Image(image) => {
            digest_reader(image.reader()?, algorithm, None, running, &mut on_progress)?
        }
        Source::Fill(fill) if fill.pattern == FillPattern::Zero => {
            let size = target.device().map(|d| d.size_bytes).unwrap_or(0);
            digest_reader(io::repeat(0), algorithm, Some(size), running, |_| {})?
        }
        Source::Fill(_) => {
            warn!("random fill has no reproducible digest, skipping verification");
            return Ok(None);
        }
    };
    debug!(digest = %source_digest, bytes = extent, "source digested");

    let offset = extent;
    let destination = platform::open_uncached(target.path())?;
    let (destination_digest, read) = digest_reader(
        destination,
        algorithm,
        Some(extent),
        running,
        |n| on_progress(offset + n),
    )?;
    debug!(digest = %destination_digest, bytes = read, "destination digested");

    let matched = read == extent && source_digest == destination_digest;
    if matched {
        info!(%algorithm, digest = %source_digest, "verification passed");
    } else {
        warn!(
            %algorithm,
            source = %source_digest,
            destination = %destination_digest,
            "verification mismatch"
        );
    }

    Ok(Some(VerificationResult {
        algorithm,
        source_digest,
        destination_digest,
        matched,
        bytes: extent,
    }))
}
