//! The sequential menu used when `ddsafe` runs without a subcommand.
//!
//! Each prompt fills one field of a [`RequestBuilder`]. Catalog and
//! validation failures send the operator back to the start of the menu
//! instead of ending the process.
use crate::App;
use crate::prompt;
use anyhow::Result;
use console::style;
use ddsafe_core::{
    BlockSize, ChecksumAlgorithm, Device, Error, FillPattern, OperationKind, RequestBuilder,
};
use dialoguer::Confirm;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

enum MenuItem {
    Operation(OperationKind),
    List,
    Quit,
}

impl std::fmt::Display for MenuItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MenuItem::Operation(OperationKind::Backup) => f.write_str("Backup a device to an image file"),
            MenuItem::Operation(OperationKind::Restore) => f.write_str("Restore an image file to a device"),
            MenuItem::Operation(OperationKind::Clone) => f.write_str("Clone a device to another device"),
            MenuItem::Operation(OperationKind::Wipe) => f.write_str("Securely wipe a device"),
            MenuItem::List => f.write_str("List block devices"),
            MenuItem::Quit => f.write_str("Quit"),
        }
    }
}

pub fn run(app: &App) -> Result<ExitCode> {
    let menu: Vec<MenuItem> = OperationKind::ALL
        .into_iter()
        .map(MenuItem::Operation)
        .chain([MenuItem::List, MenuItem::Quit])
        .collect();

    loop {
        if !app.running.load(Ordering::SeqCst) {
            return Ok(crate::EXIT_CANCELLED.into());
        }
        println!();
        let choice = prompt::select("What would you like to do?", &menu, 0)?;
        let kind = match &menu[choice] {
            MenuItem::Operation(kind) => *kind,
            MenuItem::List => {
                match app.coordinator.list_devices() {
                    Ok(devices) => crate::print_devices(&devices),
                    Err(e) => report_and_retry(&e),
                }
                continue;
            }
            MenuItem::Quit => return Ok(ExitCode::SUCCESS),
        };

        let devices = match app.coordinator.list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                report_and_retry(&e);
                continue;
            }
        };

        let builder = match build(app, kind, &devices) {
            Ok(builder) => builder,
            Err(e) => {
                println!("{} {e:#}", style("Error:").red().bold());
                continue;
            }
        };
        let request = match builder.build() {
            Ok(request) => request,
            Err(e) => {
                report_and_retry(&e);
                continue;
            }
        };

        let preflight = app.coordinator.preflight(&request);
        if !preflight.is_ok() {
            for violation in preflight.violations() {
                println!("{} {violation}", style("Rejected:").red().bold());
            }
            println!("Let's try again.");
            continue;
        }

        match app.execute(request) {
            Ok(outcome) => return Ok(crate::report(&outcome)),
            Err(e @ (Error::Validation(_) | Error::CatalogUnavailable(_) | Error::NotFound(_))) => {
                report_and_retry(&e);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn report_and_retry(error: &Error) {
    println!("{} {error}", style("Error:").red().bold());
    println!("Let's try again.");
}

/// Walks the operator through every field of a request for `kind`.
fn build(app: &App, kind: OperationKind, devices: &[Device]) -> Result<RequestBuilder> {
    let mut builder = RequestBuilder::new(kind);

    builder = match kind {
        OperationKind::Backup | OperationKind::Clone => {
            builder.source_device(prompt::select_device(devices, "Select the SOURCE device")?)
        }
        OperationKind::Restore => builder.source_image(prompt::image_path("Image file to restore")?)?,
        OperationKind::Wipe => {
            let patterns = [FillPattern::Zero, FillPattern::Random];
            let pattern = patterns[prompt::select("Fill with", &patterns, 0)?];
            let passes: u32 = prompt::parsed("Number of passes", "1".to_string())?;
            builder.fill(pattern, passes)
        }
    };

    builder = match kind {
        OperationKind::Backup => builder.target_image(prompt::image_path("Output image file")?),
        _ => {
            let target = prompt::select_device(devices, "Select the DESTINATION device")?;
            let force = target.is_mounted() && unmount_prompt(&target)?;
            builder.target_device(target).force_unmount(force)
        }
    };

    let block_size: BlockSize =
        prompt::parsed("Block size", app.settings.block_size.to_string())?;
    let default_checksum = kind.default_checksum();
    let default_index = ChecksumAlgorithm::ALL
        .iter()
        .position(|&a| a == default_checksum)
        .unwrap_or(0);
    let checksum = ChecksumAlgorithm::ALL
        [prompt::select("Verify with checksum", &ChecksumAlgorithm::ALL, default_index)?];

    Ok(builder.block_size(block_size).checksum(checksum))
}

fn unmount_prompt(device: &Device) -> Result<bool> {
    println!(
        "{} {} is mounted at {}.",
        style("NOTE:").yellow().bold(),
        style(device.path.display()).cyan(),
        device.mount_points.join(", ")
    );
    Ok(Confirm::with_theme(&prompt::theme())
        .with_prompt("Unmount it before continuing?")
        .default(false)
        .interact()?)
}
