//! Live progress of a running transfer.
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

/// A point-in-time view of a running transfer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransferProgress {
    /// Bytes written so far, summed over completed passes.
    pub bytes_copied: u64,
    /// Total bytes expected across all passes, when known.
    pub total_bytes: Option<u64>,
    pub elapsed: Duration,
    /// Bytes per second since the previous sample.
    pub throughput: f64,
    /// 1-based pass currently running.
    pub pass: u32,
    pub passes: u32,
}

impl TransferProgress {
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes
            .filter(|&total| total > 0)
            .map(|total| (self.bytes_copied as f64 / total as f64).min(1.0))
    }

    /// Remaining time at the average rate so far.
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_bytes?;
        let secs = self.elapsed.as_secs_f64();
        if self.bytes_copied == 0 || secs < 1.0 {
            return None;
        }
        let rate = self.bytes_copied as f64 / secs;
        let remaining = total.saturating_sub(self.bytes_copied) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }
}

/// Extracts byte counts from an executor's interim output.
///
/// Swapping the external copy tool means supplying a different parser; the
/// engine only ever sees the byte counts.
pub trait ProgressParser: Send {
    /// Byte count carried by one line of output, if any.
    fn parse_line(&mut self, line: &str) -> Option<u64>;
}

// GNU dd under LC_ALL=C: "1048576 bytes (1.0 MB, 1.0 MiB) copied, 0.5 s, 2.1 MB/s"
static DD_BYTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+) bytes").expect("static regex"));

/// Parser for GNU `dd status=progress` output.
#[derive(Default)]
pub struct DdStatusParser;

impl ProgressParser for DdStatusParser {
    fn parse_line(&mut self, line: &str) -> Option<u64> {
        DD_BYTES
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// Single-writer accumulator that turns per-pass byte counts into
/// monotonic [`TransferProgress`] samples.
pub(crate) struct ProgressMonitor {
    started: Instant,
    total: Option<u64>,
    passes: u32,
    pass: u32,
    base: u64,
    copied: u64,
    last_sample: (Instant, u64),
    throughput: f64,
}

impl ProgressMonitor {
    pub(crate) fn new(total: Option<u64>, passes: u32) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            total,
            passes: passes.max(1),
            pass: 1,
            base: 0,
            copied: 0,
            last_sample: (now, 0),
            throughput: 0.0,
        }
    }

    /// Records a byte count reported for the current pass.
    pub(crate) fn observe(&mut self, pass_bytes: u64) {
        let mut candidate = self.base.saturating_add(pass_bytes);
        if let Some(total) = self.total {
            candidate = candidate.min(total);
        }
        self.copied = self.copied.max(candidate);
    }

    /// Closes the current pass after it moved `pass_bytes` in total.
    pub(crate) fn complete_pass(&mut self, pass_bytes: u64) {
        self.observe(pass_bytes);
        self.base = self.base.saturating_add(pass_bytes);
        self.copied = self.copied.max(self.base);
        if self.pass < self.passes {
            self.pass += 1;
        }
    }

    pub(crate) fn copied(&self) -> u64 {
        self.copied
    }

    /// Pins the total to what was actually moved, for transfers whose size
    /// was not known up front.
    pub(crate) fn settle_total(&mut self) {
        if self.total.is_none() {
            self.total = Some(self.copied);
        }
    }

    pub(crate) fn snapshot(&mut self) -> TransferProgress {
        let now = Instant::now();
        let (last_at, last_bytes) = self.last_sample;
        let dt = now.duration_since(last_at).as_secs_f64();
        if dt >= 0.05 {
            self.throughput = (self.copied - last_bytes) as f64 / dt;
            self.last_sample = (now, self.copied);
        }

        TransferProgress {
            bytes_copied: self.copied,
            total_bytes: self.total,
            elapsed: now.duration_since(self.started),
            throughput: self.throughput,
            pass: self.pass,
            passes: self.passes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dd_progress_lines() {
        let mut parser = DdStatusParser;
        assert_eq!(
            parser.parse_line("1048576 bytes (1.0 MB, 1.0 MiB) copied, 0.5 s, 2.1 MB/s"),
            Some(1_048_576)
        );
        assert_eq!(
            parser.parse_line("8000000000 bytes (8.0 GB, 7.5 GiB) copied, 40 s, 200 MB/s"),
            Some(8_000_000_000)
        );
        assert_eq!(parser.parse_line("2+0 records in"), None);
        assert_eq!(parser.parse_line("dd: error writing '/dev/sdb': No space left on device"), None);
    }

    #[test]
    fn monitor_never_goes_backwards() {
        let mut monitor = ProgressMonitor::new(Some(1000), 1);
        monitor.observe(400);
        monitor.observe(300);
        assert_eq!(monitor.copied(), 400);
        monitor.observe(5000);
        assert_eq!(monitor.copied(), 1000);
    }

    #[test]
    fn monitor_accumulates_passes() {
        let mut monitor = ProgressMonitor::new(Some(300), 3);
        monitor.observe(60);
        monitor.complete_pass(100);
        assert_eq!(monitor.copied(), 100);
        assert_eq!(monitor.snapshot().pass, 2);

        monitor.observe(50);
        assert_eq!(monitor.copied(), 150);
        monitor.complete_pass(100);
        monitor.complete_pass(100);
        let sample = monitor.snapshot();
        assert_eq!(sample.bytes_copied, 300);
        assert_eq!(sample.pass, 3);
        assert_eq!(sample.fraction(), Some(1.0));
    }

    #[test]
    fn unknown_total_settles_to_bytes_moved() {
        let mut monitor = ProgressMonitor::new(None, 1);
        monitor.complete_pass(4096);
        assert_eq!(monitor.snapshot().total_bytes, None);
        monitor.settle_total();
        assert_eq!(monitor.snapshot().total_bytes, Some(4096));
    }

    #[test]
    fn eta_uses_average_rate() {
        let progress = TransferProgress {
            bytes_copied: 100,
            total_bytes: Some(300),
            elapsed: Duration::from_secs(10),
            throughput: 0.0,
            pass: 1,
            passes: 1,
        };
        assert_eq!(progress.eta(), Some(Duration::from_secs(20)));

        let unknown = TransferProgress {
            total_bytes: None,
            ..progress
        };
        assert_eq!(unknown.eta(), None);
    }
}
