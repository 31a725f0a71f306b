use crate::catalog::DeviceCatalog;
use crate::device::{Device, DeviceKind};
use crate::error::{Error, Result};
use crate::process::{Captured, run_bounded};
use nix::fcntl::{PosixFadviseAdvice, posix_fadvise};
use nix::{ioctl_none, ioctl_read};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_none!(blkflsbuf, 0x12, 97);

const LSBLK_COLUMNS: &str = "NAME,SIZE,TYPE,MOUNTPOINTS,RM,MODEL";
// util-linux before 2.37 has no MOUNTPOINTS column.
const LSBLK_LEGACY_COLUMNS: &str = "NAME,SIZE,TYPE,MOUNTPOINT,RM,MODEL";
const SWAP: &str = "[SWAP]";

/// Returns the byte extent of a block device or regular file.
///
/// Block devices report a zero length through `metadata`, so their size is
/// read with the `BLKGETSIZE64` ioctl instead.
pub fn extent_of(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;

    if !metadata.file_type().is_block_device() {
        return Ok(metadata.len());
    }

    let mut size_bytes: u64 = 0;
    // SAFETY: the fd is open for the duration of the call and the ioctl
    // writes exactly one u64 into `size_bytes`.
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes).map_err(io::Error::from)?;
    }
    Ok(size_bytes)
}

/// Opens `path` for reading with its cached pages dropped, so reads come
/// from the medium instead of the pages `dd` just wrote.
///
/// `BLKFLSBUF` needs `CAP_SYS_ADMIN`. Without it, the page-cache advice still
/// evicts the clean pages left behind by `conv=fsync`.
pub fn open_uncached(path: &Path) -> io::Result<File> {
    let file = File::open(path)?;

    if file.metadata()?.file_type().is_block_device() {
        // SAFETY: the fd is open for the duration of the call and BLKFLSBUF
        // takes no argument.
        if let Err(e) = unsafe { blkflsbuf(file.as_raw_fd()) } {
            debug!(device = %path.display(), error = %e, "BLKFLSBUF refused");
        }
    }
    if let Err(e) = posix_fadvise(&file, 0, 0, PosixFadviseAdvice::POSIX_FADV_DONTNEED) {
        warn!(path = %path.display(), error = %e, "could not drop cached pages, reads may be served from cache");
    }
    Ok(file)
}

/// Bytes available to an unprivileged writer on the filesystem holding `dir`.
pub fn available_space(dir: &Path) -> io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(dir).map_err(io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
pub(crate) fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk")
        || path_str.starts_with("/dev/nvme")
        || path_str.starts_with("/dev/loop")
    {
        // Partition suffix is `p<N>` after a digit: nvme0n1p2, mmcblk0p1, loop0p1.
        if let Some(index) = path_str.rfind('p') {
            let suffix = &path_str[index + 1..];
            let after_digit = path_str[..index].ends_with(|c: char| c.is_ascii_digit());
            if after_digit && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}

/// Finds the whole disk that holds the root filesystem, if `sysinfo` can see it.
fn system_disk_parent() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| get_parent_device_path(&PathBuf::from("/dev/").join(disk.name())))
}

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkEntry>,
}

// Older util-linux prints every column as a string, newer ones use JSON
// numbers and booleans, so the loosely typed columns stay as `Value`.
#[derive(Deserialize)]
struct LsblkEntry {
    name: String,
    #[serde(default)]
    size: Value,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default)]
    rm: Value,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    children: Vec<LsblkEntry>,
}

impl LsblkEntry {
    fn size_bytes(&self) -> u64 {
        match &self.size {
            Value::Number(n) => n.as_u64().unwrap_or(0),
            Value::String(s) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn removable(&self) -> bool {
        match &self.rm {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_u64() == Some(1),
            Value::String(s) => s.trim() == "1",
            _ => false,
        }
    }

    /// Where this entry itself is mounted, from whichever column lsblk printed.
    fn own_mount_points(&self) -> impl Iterator<Item = &str> {
        self.mountpoints
            .iter()
            .flatten()
            .chain(self.mountpoint.iter())
            .map(String::as_str)
            .filter(|mp| !mp.is_empty())
    }

    /// Mount points of this entry and everything stacked on top of it,
    /// paired with the entry that holds each one.
    fn mounts<'a>(&'a self, out: &mut Vec<(&'a str, &'a str)>) {
        for mp in self.own_mount_points() {
            if !out.iter().any(|&(owner, seen)| owner == self.name && seen == mp) {
                out.push((self.name.as_str(), mp));
            }
        }
        for child in &self.children {
            child.mounts(out);
        }
    }

    fn find(&self, path: &Path) -> Option<&LsblkEntry> {
        if Path::new(&self.name) == path {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(path))
    }
}

/// One step needed to release a mounted device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Release {
    /// `umount` the filesystem at this mount point.
    Unmount(String),
    /// `swapoff` the entry that holds the swap area.
    SwapOff(PathBuf),
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Release::Unmount(mp) => f.write_str(mp),
            Release::SwapOff(path) => write!(f, "swap on {}", path.display()),
        }
    }
}

/// Works out how to release `device` and everything stacked on it from the
/// JSON printed by `lsblk -J -b -p`.
///
/// Filesystems come off deepest mount point first. Swap is turned off on the
/// partition or mapping that holds it, never on the parent disk.
pub fn release_plan(json: &str, device: &Path) -> Result<Vec<Release>> {
    let output: LsblkOutput = serde_json::from_str(json)
        .map_err(|e| Error::CatalogUnavailable(format!("malformed lsblk output: {e}")))?;
    let entry = output
        .blockdevices
        .iter()
        .find_map(|entry| entry.find(device))
        .ok_or_else(|| Error::NotFound(device.to_path_buf()))?;

    let mut mounts = Vec::new();
    entry.mounts(&mut mounts);

    let mut plan: Vec<Release> = mounts
        .into_iter()
        .map(|(owner, mp)| {
            if mp == SWAP {
                Release::SwapOff(PathBuf::from(owner))
            } else {
                Release::Unmount(mp.to_string())
            }
        })
        .collect();
    plan.sort_by_key(|step| match step {
        Release::Unmount(mp) => (0, std::cmp::Reverse(mp.matches('/').count())),
        Release::SwapOff(_) => (1, std::cmp::Reverse(0)),
    });
    plan.dedup();
    Ok(plan)
}

/// Options controlling which `lsblk` entries become [`Device`]s.
#[derive(Clone, Debug, Default)]
pub struct ParseOptions {
    pub include_loop: bool,
    pub system_disk: Option<PathBuf>,
}

/// Parses the JSON printed by `lsblk -J -b -p`.
pub fn parse_lsblk(json: &str, options: &ParseOptions) -> Result<Vec<Device>> {
    let output: LsblkOutput = serde_json::from_str(json)
        .map_err(|e| Error::CatalogUnavailable(format!("malformed lsblk output: {e}")))?;

    let mut devices = Vec::new();
    for entry in &output.blockdevices {
        collect(entry, options, &mut devices);
    }
    Ok(devices)
}

fn collect(entry: &LsblkEntry, options: &ParseOptions, out: &mut Vec<Device>) {
    let kind = match entry.kind.as_str() {
        "disk" => DeviceKind::Disk,
        "loop" if options.include_loop => DeviceKind::Disk,
        "part" => DeviceKind::Partition,
        // rom, crypt, lvm and friends are not offered as targets; their
        // mount points still count against the device they sit on.
        _ => return,
    };

    let size_bytes = entry.size_bytes();
    // Empty card readers report a zero size.
    if size_bytes == 0 {
        return;
    }

    let path = PathBuf::from(&entry.name);
    let mut mounts = Vec::new();
    entry.mounts(&mut mounts);
    let mut mount_points: Vec<String> = Vec::new();
    for (_, mp) in mounts {
        if !mount_points.iter().any(|seen| seen == mp) {
            mount_points.push(mp.to_string());
        }
    }

    let system = options
        .system_disk
        .as_deref()
        .is_some_and(|sys| get_parent_device_path(&path) == sys)
        || mount_points.iter().any(|mp| mp == "/");

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| entry.name.clone());

    out.push(Device {
        path,
        name,
        size_bytes,
        kind,
        mount_points,
        removable: entry.removable(),
        model: entry
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string),
        system,
    });

    for child in &entry.children {
        collect(child, options, out);
    }
}

/// [`DeviceCatalog`] backed by util-linux `lsblk` and `umount`.
#[derive(Clone, Debug)]
pub struct LsblkCatalog {
    timeout: Duration,
    include_loop: bool,
    use_sudo: bool,
}

impl LsblkCatalog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            include_loop: false,
            use_sudo: false,
        }
    }

    pub fn include_loop(mut self, include: bool) -> Self {
        self.include_loop = include;
        self
    }

    pub fn use_sudo(mut self, sudo: bool) -> Self {
        self.use_sudo = sudo;
        self
    }

    fn command(&self, program: &str) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program);
            cmd
        } else {
            Command::new(program)
        }
    }

    fn lsblk(&self, columns: &str, target: Option<&Path>) -> Result<Captured> {
        let mut cmd = Command::new("lsblk");
        cmd.args(["-J", "-b", "-p", "-o", columns]);
        if let Some(target) = target {
            cmd.arg(target);
        }
        cmd.env("LC_ALL", "C");
        run_bounded(cmd, self.timeout)
    }

    /// Raw `lsblk` JSON, falling back to the single-mount column on old
    /// util-linux.
    fn lsblk_json(&self, target: Option<&Path>) -> Result<String> {
        let mut captured = self.lsblk(LSBLK_COLUMNS, target)?;
        if !captured.status.success() && captured.stderr.contains("unknown column") {
            debug!("lsblk has no MOUNTPOINTS column, using MOUNTPOINT");
            captured = self.lsblk(LSBLK_LEGACY_COLUMNS, target)?;
        }

        if !captured.status.success() {
            if let Some(target) = target {
                return Err(Error::NotFound(target.to_path_buf()));
            }
            return Err(Error::CatalogUnavailable(format!(
                "lsblk exited with {}: {}",
                captured.status,
                captured.stderr.trim()
            )));
        }
        Ok(captured.stdout)
    }

    fn query(&self, target: Option<&Path>) -> Result<Vec<Device>> {
        let json = self.lsblk_json(target)?;
        let options = ParseOptions {
            include_loop: self.include_loop,
            system_disk: system_disk_parent(),
        };
        parse_lsblk(&json, &options)
    }
}

impl DeviceCatalog for LsblkCatalog {
    fn list_devices(&self) -> Result<Vec<Device>> {
        let devices = self.query(None)?;
        debug!(count = devices.len(), "enumerated block devices");
        Ok(devices)
    }

    fn refresh(&self, path: &Path) -> Result<Device> {
        self.query(Some(path))?
            .into_iter()
            .find(|d| d.path == path)
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))
    }

    fn unmount(&self, device: &Device) -> Result<()> {
        // The snapshot only knows mount points; lsblk knows which child holds them.
        let json = self.lsblk_json(Some(&device.path))?;
        for step in release_plan(&json, &device.path)? {
            let mut cmd = match &step {
                Release::SwapOff(holder) => {
                    let mut cmd = self.command("swapoff");
                    cmd.arg(holder);
                    cmd
                }
                Release::Unmount(mp) => {
                    let mut cmd = self.command("umount");
                    cmd.arg(mp);
                    cmd
                }
            };
            cmd.env("LC_ALL", "C");

            let captured = run_bounded(cmd, self.timeout)?;
            if !captured.status.success() {
                return Err(Error::DeviceBusy(format!(
                    "could not release {step}: {}",
                    captured.stderr.trim()
                )));
            }
            info!(device = %device.path.display(), released = %step, "unmounted");
        }
        Ok(())
    }
}
