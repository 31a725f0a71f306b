use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Whether a block device is a whole disk or a slice of one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Partition,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Disk => f.write_str("disk"),
            DeviceKind::Partition => f.write_str("part"),
        }
    }
}

/// Represents a block device discovered on the system.
///
/// This is a snapshot taken when the catalog was queried. Size and mount
/// state may be stale by the time the device is used, so anything
/// destructive re-queries it through
/// [`DeviceCatalog::refresh`](crate::catalog::DeviceCatalog::refresh) first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// The total size of the device in bytes.
    pub size_bytes: u64,
    pub kind: DeviceKind,
    /// Every mount point of the device. For a disk this includes the mount
    /// points of its partitions.
    pub mount_points: Vec<String>,
    pub removable: bool,
    /// Vendor model string, if the kernel reports one.
    pub model: Option<String>,
    /// Set when the device backs the running system's root filesystem.
    pub system: bool,
}

impl Device {
    pub fn is_mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }

    /// Size in binary gigabytes (1024³ bytes).
    pub fn size_gib(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if self.is_mounted() {
            format!("[Mounted at {}]", self.mount_points.join(", "))
        } else {
            "[Not mounted]".to_string()
        };

        write!(
            f,
            "{:<15} {:<4} {:>8.1} GiB {:<20} {}",
            self.path.display(),
            self.kind,
            self.size_gib(),
            self.model.as_deref().unwrap_or("Unknown"),
            mount_info
        )?;

        if self.system {
            write!(f, " [system]")?;
        }
        Ok(())
    }
}
