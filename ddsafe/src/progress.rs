//! indicatif rendering of transfer and verification progress.
use console::style;
use ddsafe_core::{OperationKind, OperationOutcome, OperationStatus, ProgressObserver, TransferProgress};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

const BAR_TEMPLATE: &str = "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}";
const VERIFY_TEMPLATE: &str = "{prefix:12} [{elapsed_precise}] [{bar:40.magenta/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = "{prefix:12} [{elapsed_precise}] [{spinner:.blue}] {bytes} ({bytes_per_sec}) {msg}";

fn style_for(template: &str, fallback: fn() -> ProgressStyle) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| fallback())
}

fn stdout_bar() -> ProgressBar {
    ProgressBar::with_draw_target(None, ProgressDrawTarget::stdout())
}

/// Draws one bar for the transfer and one for verification.
pub struct Bars {
    prefix: &'static str,
    transfer: ProgressBar,
    verify: ProgressBar,
    verifying: bool,
}

impl Bars {
    pub fn new(kind: OperationKind) -> Self {
        let prefix = match kind {
            OperationKind::Backup => "Reading",
            OperationKind::Restore | OperationKind::Clone => "Writing",
            OperationKind::Wipe => "Wiping",
        };
        Self {
            prefix,
            transfer: ProgressBar::hidden(),
            verify: ProgressBar::hidden(),
            verifying: false,
        }
    }

    /// Leaves the bars in a final state matching `outcome`.
    pub fn finish(&self, outcome: &OperationOutcome) {
        let active = if self.verifying { &self.verify } else { &self.transfer };
        match outcome.status {
            OperationStatus::Succeeded if outcome.verification_warning().is_some() => {
                active.abandon_with_message(style("digest mismatch").red().to_string())
            }
            OperationStatus::Succeeded => active.finish_with_message("done"),
            OperationStatus::Failed => active.abandon_with_message(style("failed").red().to_string()),
            OperationStatus::Aborted => active.abandon_with_message(style("cancelled").yellow().to_string()),
        }
    }
}

impl ProgressObserver for Bars {
    fn transfer_started(&mut self, total: Option<u64>) {
        let bar = stdout_bar();
        match total {
            Some(total) => {
                bar.set_length(total);
                bar.set_style(style_for(BAR_TEMPLATE, ProgressStyle::default_bar).progress_chars("■ "));
            }
            None => {
                bar.set_style(style_for(SPINNER_TEMPLATE, ProgressStyle::default_spinner));
                bar.enable_steady_tick(Duration::from_millis(100));
            }
        }
        bar.set_prefix(self.prefix);
        self.transfer = bar;
    }

    fn transfer_progress(&mut self, progress: &TransferProgress) {
        if let Some(total) = progress.total_bytes {
            if self.transfer.length() != Some(total) {
                self.transfer.disable_steady_tick();
                self.transfer
                    .set_style(style_for(BAR_TEMPLATE, ProgressStyle::default_bar).progress_chars("■ "));
                self.transfer.set_length(total);
            }
        }
        if progress.passes > 1 {
            self.transfer.set_message(format!("pass {}/{}", progress.pass, progress.passes));
        }
        self.transfer.set_position(progress.bytes_copied);
    }

    fn verification_started(&mut self, total: Option<u64>) {
        self.transfer.finish_with_message("done");
        let bar = stdout_bar();
        bar.set_length(total.unwrap_or(0));
        bar.set_style(style_for(VERIFY_TEMPLATE, ProgressStyle::default_bar).progress_chars("■ "));
        bar.set_prefix("Verifying");
        self.verify = bar;
        self.verifying = true;
    }

    fn verification_progress(&mut self, bytes: u64) {
        if self.verify.length().is_some_and(|len| bytes > len) {
            self.verify.set_length(bytes);
        }
        self.verify.set_position(bytes);
    }
}
