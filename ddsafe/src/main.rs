mod interactive;
mod logging;
mod progress;
mod prompt;
mod term;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use ddsafe_core::platform::LsblkCatalog;
use ddsafe_core::{
    BlockSize, ChecksumAlgorithm, Coordinator, DdExecutor, Device, DeviceCatalog, Error,
    FillPattern, Integrity, OperationKind, OperationOutcome, OperationRequest, OperationStatus,
    RequestBuilder, Settings,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const EXIT_INTERNAL: u8 = 1;
pub const EXIT_VALIDATION: u8 = 2;
pub const EXIT_TRANSFER: u8 = 3;
pub const EXIT_CANCELLED: u8 = 4;

#[derive(Parser)]
#[command(name = "ddsafe")]
#[command(about = "Guarded, interactive disk imaging, cloning and wiping", version)]
#[command(long_about = "Guarded, interactive disk imaging, cloning and wiping.\n\n\
    Run without a subcommand for the interactive menu.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    log_json: bool,

    /// Append a line per operation to this file
    #[arg(long, global = true, value_name = "PATH")]
    journal: Option<PathBuf>,

    /// Run dd, lsblk and umount through `sudo -n`
    #[arg(long, global = true)]
    sudo: bool,

    /// Offer loop devices as sources and destinations
    #[arg(long, global = true)]
    include_loop: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a device into an image file
    Backup {
        /// Output image file
        image: PathBuf,
        /// Source device (prompted for when omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Write an image file (optionally .gz, .xz or .zst) to a device
    Restore {
        /// Image file to restore
        image: PathBuf,
        /// Destination device (prompted for when omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Copy one device onto another
    Clone {
        /// Source device (prompted for when omitted)
        #[arg(short, long)]
        source: Option<PathBuf>,
        /// Destination device (prompted for when omitted)
        #[arg(short = 't', long)]
        destination: Option<PathBuf>,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Overwrite a device with zeros or random data
    Wipe {
        /// Device to wipe (prompted for when omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,
        /// Fill pattern: zero or random
        #[arg(long, default_value = "zero", value_parser = parse_fill)]
        fill: FillPattern,
        /// Number of overwrite passes
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        passes: u32,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// List block devices
    List {
        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct TransferArgs {
    /// Block size, e.g. 512, 64K, 4M
    #[arg(short, long, value_parser = parse_block_size)]
    block_size: Option<BlockSize>,

    /// Verification checksum: none, md5 or sha256
    #[arg(short, long, value_parser = parse_checksum)]
    checksum: Option<ChecksumAlgorithm>,

    /// Unmount a mounted destination before writing
    #[arg(long)]
    force_unmount: bool,
}

fn parse_block_size(s: &str) -> std::result::Result<BlockSize, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_checksum(s: &str) -> std::result::Result<ChecksumAlgorithm, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_fill(s: &str) -> std::result::Result<FillPattern, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "zero" | "zeros" => Ok(FillPattern::Zero),
        "random" | "urandom" => Ok(FillPattern::Random),
        other => Err(format!("unknown fill '{other}' (expected zero or random)")),
    }
}

/// Command-line values that take precedence over the file and environment.
#[derive(Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    journal: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_loop_devices: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    executor: Option<ExecutorOverrides>,
}

#[derive(Serialize)]
struct ExecutorOverrides {
    use_sudo: bool,
}

impl Overrides {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            journal: cli.journal.clone(),
            include_loop_devices: cli.include_loop.then_some(true),
            executor: cli.sudo.then_some(ExecutorOverrides { use_sudo: true }),
        }
    }
}

/// Everything a run needs, shared by the subcommands and the menu.
pub struct App {
    pub settings: Settings,
    pub coordinator: Coordinator<LsblkCatalog, DdExecutor>,
    pub running: Arc<AtomicBool>,
}

impl App {
    fn new(settings: Settings, running: Arc<AtomicBool>) -> Self {
        let catalog = LsblkCatalog::new(settings.catalog_timeout())
            .include_loop(settings.include_loop_devices)
            .use_sudo(settings.executor.use_sudo);
        let executor =
            DdExecutor::new(&settings.executor.program).use_sudo(settings.executor.use_sudo);
        let coordinator = Coordinator::new(catalog, executor).with_settings(&settings);
        Self {
            settings,
            coordinator,
            running,
        }
    }

    /// Confirms and runs `request` with progress bars on stdout.
    pub fn execute(&self, request: OperationRequest) -> ddsafe_core::Result<OperationOutcome> {
        let mut confirmer = prompt::PhraseConfirmer::new(&self.settings.confirm_phrase);
        let mut bars = progress::Bars::new(request.kind());
        let outcome =
            self.coordinator
                .run(request, &mut confirmer, self.running.clone(), &mut bars)?;
        bars.finish(&outcome);
        Ok(outcome)
    }

    fn device(&self, path: Option<PathBuf>, prompt_text: &str) -> Result<Device> {
        match path {
            Some(path) => Ok(self.coordinator.catalog().refresh(&path)?),
            None => prompt::select_device(&self.coordinator.list_devices()?, prompt_text),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(logging::LogConfig {
        json: cli.log_json,
        verbose: cli.verbose,
    });

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            let code = e
                .downcast_ref::<Error>()
                .map_or(EXIT_INTERNAL, exit_code_for_error);
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    // Dropped when run() returns, restoring the terminal.
    let _term_restorer = term::TermRestorer::new();

    // Cleared by Ctrl+C; the engine stops the executor when it sees it.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let settings = Settings::load(cli.config.as_deref(), Overrides::from_cli(&cli))
        .context("Failed to load configuration")?;
    tracing::debug!(?settings, "configuration loaded");
    let app = App::new(settings, running);

    let Some(command) = cli.command else {
        return interactive::run(&app);
    };

    let builder = match command {
        Commands::List { json } => {
            let devices = app.coordinator.list_devices()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                print_devices(&devices);
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Backup {
            image,
            device,
            transfer,
        } => {
            let source = app.device(device, "Select the source device to READ from")?;
            transfer.apply(
                RequestBuilder::new(OperationKind::Backup)
                    .source_device(source)
                    .target_image(image),
                &app.settings,
            )
        }
        Commands::Restore {
            image,
            device,
            transfer,
        } => {
            let builder = RequestBuilder::new(OperationKind::Restore).source_image(&image)?;
            let target = app.device(device, "Select the target device to WRITE to")?;
            transfer.apply(builder.target_device(target), &app.settings)
        }
        Commands::Clone {
            source,
            destination,
            transfer,
        } => {
            let source = app.device(source, "Select the SOURCE device")?;
            let target = app.device(destination, "Select the DESTINATION device")?;
            transfer.apply(
                RequestBuilder::new(OperationKind::Clone)
                    .source_device(source)
                    .target_device(target),
                &app.settings,
            )
        }
        Commands::Wipe {
            device,
            fill,
            passes,
            transfer,
        } => {
            let target = app.device(device, "Select the device to WIPE")?;
            transfer.apply(
                RequestBuilder::new(OperationKind::Wipe)
                    .fill(fill, passes)
                    .target_device(target),
                &app.settings,
            )
        }
    };

    let outcome = app.execute(builder.build()?)?;
    Ok(report(&outcome))
}

impl TransferArgs {
    /// Fills the tuning fields, falling back to the configured block size.
    fn apply(self, builder: RequestBuilder, settings: &Settings) -> RequestBuilder {
        let mut builder = builder
            .force_unmount(self.force_unmount)
            .block_size(self.block_size.unwrap_or(settings.block_size));
        if let Some(checksum) = self.checksum {
            builder = builder.checksum(checksum);
        }
        builder
    }
}

pub fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("No block devices found.");
        return;
    }

    println!("Found {} block devices:", devices.len());
    println!(
        "\n  {:<16} {:<5} {:<22} {:>10}  {}",
        "DEVICE", "TYPE", "MODEL", "SIZE", "MOUNTED AT"
    );
    println!("  {:-<16} {:-<5} {:-<22} {:-<10}  {:-<20}", "", "", "", "", "");
    for device in devices {
        let location = if device.is_mounted() {
            device.mount_points.join(", ")
        } else {
            "(Not mounted)".to_string()
        };
        let mut flags = String::new();
        if device.removable {
            flags.push_str(" [removable]");
        }
        if device.system {
            flags.push_str(" [system]");
        }
        println!(
            "  {:<16} {:<5} {:<22} {:>7.1} GiB  {}{}",
            device.path.display(),
            device.kind,
            device.model.as_deref().unwrap_or("-"),
            device.size_gib(),
            location,
            flags
        );
    }
}

/// Prints the outcome and picks the process exit status.
pub fn report(outcome: &OperationOutcome) -> ExitCode {
    let request = &outcome.request;
    println!();

    if let Some(progress) = &outcome.progress {
        println!(
            "  Copied:    {} bytes in {:.1}s",
            progress.bytes_copied,
            progress.elapsed.as_secs_f64()
        );
    }
    if let Some(verification) = &outcome.verification {
        println!("  {}:    {}", verification.algorithm, verification.source_digest);
    }
    println!("  Integrity: {}", outcome.integrity);

    match outcome.status {
        OperationStatus::Succeeded => {
            if let Some(warning) = outcome.verification_warning() {
                println!("\n{} {warning}", style("WARNING:").red().bold());
            } else if let Some(error) = &outcome.error {
                println!("\n{} {error}", style("WARNING:").yellow().bold());
            }
            println!(
                "\n✨ {} of {} to {} complete.",
                request.kind(),
                style(request.source()).cyan(),
                style(request.target()).cyan()
            );
            ExitCode::SUCCESS
        }
        OperationStatus::Aborted => {
            println!("\n{} operation cancelled.", style(request.kind()).yellow());
            ExitCode::from(EXIT_CANCELLED)
        }
        OperationStatus::Failed => {
            let error = outcome
                .error
                .as_ref()
                .map_or_else(|| "unknown failure".to_string(), ToString::to_string);
            println!("\n❌ {} failed: {error}", request.kind());
            if outcome.integrity == Integrity::Unknown {
                println!(
                    "   {} may hold a partial copy; treat its contents as corrupt.",
                    style(request.target()).cyan()
                );
            }
            ExitCode::from(
                outcome
                    .error
                    .as_ref()
                    .map_or(EXIT_TRANSFER, exit_code_for_error),
            )
        }
    }
}

fn exit_code_for_error(error: &Error) -> u8 {
    match error {
        Error::Validation(_)
        | Error::NotFound(_)
        | Error::InvalidRequest(_)
        | Error::CatalogUnavailable(_) => EXIT_VALIDATION,
        Error::Cancelled => EXIT_CANCELLED,
        e if e.is_transfer_failure() => EXIT_TRANSFER,
        _ => EXIT_INTERNAL,
    }
}
