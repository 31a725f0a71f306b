//! Pre-transfer validation and the confirmation protocol.
//!
//! Checks run in a fixed order and stop at the first violation:
//! same device, image destination that is not a regular file, system disk,
//! mounted destination, destination too small, missing confirmation. [`SafetyGate::preflight`] stops short of the last
//! check so the operator is only asked to confirm a request that could run.
use crate::device::Device;
use crate::error::{Error, Result, Violation, Violations};
use crate::platform::{self, get_parent_device_path};
use crate::request::{OperationKind, OperationRequest, Source, Target};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// Outcome of a validation pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    Ok,
    Rejected(Vec<Violation>),
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ValidationResult::Ok)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            ValidationResult::Ok => &[],
            ValidationResult::Rejected(v) => v,
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            ValidationResult::Ok => Ok(()),
            ValidationResult::Rejected(v) => Err(Error::Validation(Violations(v))),
        }
    }
}

impl From<Option<Violation>> for ValidationResult {
    fn from(first: Option<Violation>) -> Self {
        match first {
            None => ValidationResult::Ok,
            Some(v) => ValidationResult::Rejected(vec![v]),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SafetyGate {
    allow_system_disk: bool,
}

impl SafetyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permit destructive operations on the disk backing `/`.
    pub fn allow_system_disk(mut self, allow: bool) -> Self {
        self.allow_system_disk = allow;
        self
    }

    /// Every check except the confirmation token.
    pub fn preflight(&self, request: &OperationRequest) -> ValidationResult {
        let result = ValidationResult::from(self.first_violation(request));
        debug!(kind = %request.kind(), ok = result.is_ok(), "preflight");
        result
    }

    /// Every check, including the confirmation token for destructive kinds.
    pub fn validate(&self, request: &OperationRequest) -> ValidationResult {
        let first = self.first_violation(request).or_else(|| {
            (request.kind().is_destructive() && !request.is_confirmed())
                .then_some(Violation::NotConfirmed)
        });
        let result = ValidationResult::from(first);
        debug!(kind = %request.kind(), ok = result.is_ok(), "validate");
        result
    }

    /// Compares freshly queried devices against the snapshots in `request`.
    ///
    /// Runs after confirmation (and any unmount), immediately before the
    /// transfer starts. A destination that is still mounted is rejected even
    /// when the request asked for a forced unmount.
    pub fn revalidate(
        &self,
        request: &OperationRequest,
        source: Option<&Device>,
        destination: Option<&Device>,
    ) -> ValidationResult {
        let pairs = [
            (request.source().device(), source),
            (request.target().device(), destination),
        ];
        for (snapshot, fresh) in pairs {
            if let (Some(snapshot), Some(fresh)) = (snapshot, fresh) {
                if snapshot.path != fresh.path || snapshot.size_bytes != fresh.size_bytes {
                    warn!(device = %snapshot.path.display(), "device changed after confirmation");
                    return Some(Violation::DeviceChanged(snapshot.path.clone())).into();
                }
            }
        }

        if let Some(fresh) = destination {
            if request.kind().is_destructive() && fresh.is_mounted() {
                return Some(Violation::DestinationMounted {
                    path: fresh.path.clone(),
                    mount_points: fresh.mount_points.clone(),
                })
                .into();
            }
            if request.kind().is_destructive() && fresh.system && !self.allow_system_disk {
                return Some(Violation::SystemDisk(fresh.path.clone())).into();
            }
        }
        ValidationResult::Ok
    }

    fn first_violation(&self, request: &OperationRequest) -> Option<Violation> {
        let kind = request.kind();
        let source = request.source().device();
        let target = request.target().device();

        if let (Some(source), Some(target)) = (source, target) {
            if overlaps(&source.path, &target.path) {
                return Some(Violation::SameDevice(target.path.clone()));
            }
        }

        if let Target::Image(image) = request.target() {
            if let Some(source) = source {
                if same_node(&source.path, image) {
                    return Some(Violation::SameDevice(image.clone()));
                }
            }
            // Follows symlinks: a link to a device node is still a device.
            match std::fs::metadata(image) {
                Ok(meta) if !meta.is_file() => {
                    return Some(Violation::ImageNotAFile(image.clone()));
                }
                _ => {}
            }
        }

        if let Some(target) = target {
            if kind.is_destructive() {
                if target.system && !self.allow_system_disk {
                    return Some(Violation::SystemDisk(target.path.clone()));
                }
                if target.is_mounted() && !request.force_unmount() {
                    return Some(Violation::DestinationMounted {
                        path: target.path.clone(),
                        mount_points: target.mount_points.clone(),
                    });
                }
            }
        }

        let (required, available) = capacity(request)?;
        (available < required).then_some(Violation::DestinationTooSmall {
            required,
            available,
        })
    }
}

/// Two device paths refer to overlapping storage: the same node, or a disk
/// and one of its partitions.
fn overlaps(a: &Path, b: &Path) -> bool {
    a == b || get_parent_device_path(a) == b || get_parent_device_path(b) == a
}

/// An image path that names the source itself, directly or through a link.
fn same_node(device: &Path, image: &Path) -> bool {
    if device == image {
        return true;
    }
    match (std::fs::canonicalize(device), std::fs::canonicalize(image)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Bytes the transfer needs and bytes the destination offers, when both are
/// known.
fn capacity(request: &OperationRequest) -> Option<(u64, u64)> {
    match (request.kind(), request.source(), request.target()) {
        (OperationKind::Backup, Source::Device(device), Target::Image(path)) => {
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            let free = match platform::available_space(dir) {
                Ok(free) => free,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "cannot determine free space");
                    return None;
                }
            };
            // An existing image is overwritten, so its blocks count as free.
            let existing = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            Some((device.size_bytes, free.saturating_add(existing)))
        }
        (OperationKind::Clone | OperationKind::Restore, source, Target::Device(target)) => {
            source.extent().map(|needed| (needed, target.size_bytes))
        }
        _ => None,
    }
}

/// What the operator is asked to acknowledge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmationSummary {
    pub kind: OperationKind,
    pub source: String,
    pub destination: String,
    /// Bytes of existing data that will be overwritten, when known.
    pub data_at_risk: Option<u64>,
    /// Where the destination is currently mounted.
    pub mount_points: Vec<String>,
}

impl ConfirmationSummary {
    pub fn new(request: &OperationRequest) -> Self {
        let target = request.target();
        let (data_at_risk, mount_points) = match target {
            Target::Device(device) => (Some(device.size_bytes), device.mount_points.clone()),
            Target::Image(path) => (std::fs::metadata(path).ok().map(|m| m.len()), Vec::new()),
        };
        Self {
            kind: request.kind(),
            source: request.source().to_string(),
            destination: target.to_string(),
            data_at_risk,
            mount_points,
        }
    }

    /// Human-readable estimate of the data that will be lost.
    pub fn data_loss(&self) -> String {
        match (self.kind, self.data_at_risk) {
            (OperationKind::Backup, None) => "none (new image file)".to_string(),
            (OperationKind::Backup, Some(bytes)) => {
                format!("existing image file ({}) will be replaced", human_bytes(bytes))
            }
            (_, Some(bytes)) => format!("ALL data on {} ({})", self.destination, human_bytes(bytes)),
            (_, None) => format!("ALL data on {}", self.destination),
        }
    }
}

impl fmt::Display for ConfirmationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Operation:   {}", self.kind)?;
        writeln!(f, "Source:      {}", self.source)?;
        writeln!(f, "Destination: {}", self.destination)?;
        if !self.mount_points.is_empty() {
            writeln!(f, "Mounted at:  {} (will be unmounted)", self.mount_points.join(", "))?;
        }
        write!(f, "Data loss:   {}", self.data_loss())
    }
}

/// Asks the operator to acknowledge a request.
///
/// Implementations must return `true` only on an explicit affirmative
/// answer; an empty or unexpected answer declines.
pub trait Confirmer {
    fn confirm(&mut self, summary: &ConfirmationSummary) -> Result<bool>;
}

/// Exact, case-sensitive match of the operator's answer against `phrase`,
/// ignoring surrounding whitespace.
pub fn is_affirmative(answer: &str, phrase: &str) -> bool {
    let phrase = phrase.trim();
    !phrase.is_empty() && answer.trim() == phrase
}

pub(crate) fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use crate::request::RequestBuilder;
    use std::path::PathBuf;

    const GB: u64 = 1_000_000_000;

    fn disk(path: &str, size_bytes: u64) -> Device {
        Device {
            path: PathBuf::from(path),
            name: path.trim_start_matches("/dev/").to_string(),
            size_bytes,
            kind: DeviceKind::Disk,
            mount_points: Vec::new(),
            removable: true,
            model: None,
            system: false,
        }
    }

    fn mounted(mut device: Device) -> Device {
        device.mount_points = vec!["/media/usb".to_string()];
        device
    }

    fn clone_request(source: Device, target: Device) -> OperationRequest {
        RequestBuilder::new(OperationKind::Clone)
            .source_device(source)
            .target_device(target)
            .build()
            .unwrap()
    }

    #[test]
    fn equal_sizes_pass_preflight_but_need_confirmation() {
        let gate = SafetyGate::new();
        let req = clone_request(disk("/dev/sda", 8 * GB), disk("/dev/sdb", 8 * GB));
        assert_eq!(gate.preflight(&req), ValidationResult::Ok);
        assert_eq!(
            gate.validate(&req),
            ValidationResult::Rejected(vec![Violation::NotConfirmed])
        );
        assert_eq!(gate.validate(&req.confirm()), ValidationResult::Ok);
    }

    #[test]
    fn smaller_destination_is_rejected() {
        let gate = SafetyGate::new();
        let req = clone_request(disk("/dev/sda", 8 * GB), disk("/dev/sdb", 4 * GB)).confirm();
        assert_eq!(
            gate.validate(&req),
            ValidationResult::Rejected(vec![Violation::DestinationTooSmall {
                required: 8 * GB,
                available: 4 * GB,
            }])
        );
    }

    #[test]
    fn same_device_and_partition_overlap() {
        let gate = SafetyGate::new();
        let req = clone_request(disk("/dev/sda", GB), disk("/dev/sda", GB));
        assert!(matches!(
            gate.preflight(&req).violations(),
            [Violation::SameDevice(_)]
        ));

        let req = clone_request(disk("/dev/nvme0n1p2", GB), disk("/dev/nvme0n1", 2 * GB));
        assert!(matches!(
            gate.preflight(&req).violations(),
            [Violation::SameDevice(_)]
        ));
    }

    #[test]
    fn same_device_wins_over_later_checks() {
        let gate = SafetyGate::new();
        let req = clone_request(disk("/dev/sdb", 8 * GB), mounted(disk("/dev/sdb", 4 * GB)));
        assert_eq!(gate.validate(&req).violations().len(), 1);
        assert!(matches!(
            gate.validate(&req).violations(),
            [Violation::SameDevice(_)]
        ));
    }

    #[test]
    fn mounted_destination_needs_force_unmount() {
        let gate = SafetyGate::new();
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();

        let req = RequestBuilder::new(OperationKind::Restore)
            .source_image(&image)
            .unwrap()
            .target_device(mounted(disk("/dev/sdb", GB)))
            .build()
            .unwrap()
            .confirm();
        assert!(matches!(
            gate.validate(&req).violations(),
            [Violation::DestinationMounted { .. }]
        ));

        let forced = RequestBuilder::new(OperationKind::Restore)
            .source_image(&image)
            .unwrap()
            .target_device(mounted(disk("/dev/sdb", GB)))
            .force_unmount(true)
            .build()
            .unwrap()
            .confirm();
        assert_eq!(gate.validate(&forced), ValidationResult::Ok);
    }

    #[test]
    fn backup_ignores_mounted_source() {
        let gate = SafetyGate::new();
        let dir = tempfile::tempdir().unwrap();
        let req = RequestBuilder::new(OperationKind::Backup)
            .source_device(mounted(disk("/dev/sda", 4096)))
            .target_image(dir.path().join("sda.img"))
            .build()
            .unwrap();
        assert_eq!(gate.validate(&req), ValidationResult::Ok);
    }

    #[test]
    fn backup_onto_its_own_source_is_same_device() {
        let gate = SafetyGate::new();
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("disk");
        std::fs::write(&source, vec![1u8; 4096]).unwrap();
        let link = dir.path().join("disk.img");
        std::os::unix::fs::symlink(&source, &link).unwrap();

        for image in [&source, &link] {
            let req = RequestBuilder::new(OperationKind::Backup)
                .source_device(disk(source.to_str().unwrap(), 4096))
                .target_image(image)
                .build()
                .unwrap()
                .confirm();
            assert!(matches!(
                gate.validate(&req).violations(),
                [Violation::SameDevice(_)]
            ));
        }
    }

    #[test]
    fn backup_image_must_be_a_regular_file() {
        let gate = SafetyGate::new();
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("null.img");
        std::os::unix::fs::symlink("/dev/null", &link).unwrap();

        for image in [Path::new("/dev/null"), dir.path(), link.as_path()] {
            let req = RequestBuilder::new(OperationKind::Backup)
                .source_device(disk("/dev/sda", 4096))
                .target_image(image)
                .build()
                .unwrap()
                .confirm();
            assert!(
                matches!(gate.validate(&req).violations(), [Violation::ImageNotAFile(_)]),
                "{}",
                image.display()
            );
        }
    }

    #[test]
    fn system_disk_is_protected_unless_allowed() {
        let mut system = disk("/dev/nvme0n1", GB);
        system.system = true;
        let req = RequestBuilder::new(OperationKind::Wipe)
            .target_device(system)
            .build()
            .unwrap();
        assert!(matches!(
            SafetyGate::new().preflight(&req).violations(),
            [Violation::SystemDisk(_)]
        ));
        assert!(
            SafetyGate::new()
                .allow_system_disk(true)
                .preflight(&req)
                .is_ok()
        );
    }

    #[test]
    fn revalidation_detects_changes() {
        let gate = SafetyGate::new();
        let req = clone_request(disk("/dev/sda", 8 * GB), disk("/dev/sdb", 8 * GB)).confirm();

        let same = disk("/dev/sdb", 8 * GB);
        assert!(gate.revalidate(&req, None, Some(&same)).is_ok());

        let resized = disk("/dev/sdb", 16 * GB);
        assert!(matches!(
            gate.revalidate(&req, None, Some(&resized)).violations(),
            [Violation::DeviceChanged(_)]
        ));

        let still_mounted = mounted(disk("/dev/sdb", 8 * GB));
        assert!(matches!(
            gate.revalidate(&req, None, Some(&still_mounted)).violations(),
            [Violation::DestinationMounted { .. }]
        ));
    }

    #[test]
    fn confirmation_requires_exact_phrase() {
        assert!(is_affirmative("yes\n", "yes"));
        assert!(!is_affirmative("y", "yes"));
        assert!(!is_affirmative("YES", "yes"));
        assert!(!is_affirmative("", "yes"));
        assert!(!is_affirmative("", ""));
    }

    #[test]
    fn summary_describes_data_loss() {
        let req = clone_request(disk("/dev/sda", GB), mounted(disk("/dev/sdb", 2 * 1024 * 1024 * 1024)));
        let summary = ConfirmationSummary::new(&req);
        assert_eq!(summary.data_loss(), "ALL data on /dev/sdb (2.00 GiB)");
        let text = summary.to_string();
        assert!(text.contains("Operation:   clone"));
        assert!(text.contains("/media/usb"));
    }

    #[test]
    fn formats_byte_counts() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.50 KiB");
        assert_eq!(human_bytes(4 * 1024 * 1024), "4.00 MiB");
    }
}
