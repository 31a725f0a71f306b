//! Test doubles shared by the integration tests.
//!
//! Regular files stand in for block devices: `dd` writes to them the same
//! way, and the verification engine reads their length as the extent.
#![allow(dead_code)]

use ddsafe_core::engine::{CopyJob, DdStatusParser, Input, ProgressParser};
use ddsafe_core::{
    ConfirmationSummary, Confirmer, Device, DeviceCatalog, DeviceKind, Error, Executor, Result,
};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

/// A fake disk backed by a file of `size` bytes filled with a repeating pattern.
pub fn file_device(dir: &Path, name: &str, size: usize, seed: u8) -> Device {
    let path = dir.join(name);
    let content: Vec<u8> = (0..size).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
    std::fs::write(&path, content).unwrap();
    device(path, size as u64)
}

/// A device snapshot that does not need to exist on disk.
pub fn device(path: impl Into<PathBuf>, size_bytes: u64) -> Device {
    let path = path.into();
    Device {
        name: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        path,
        size_bytes,
        kind: DeviceKind::Disk,
        mount_points: Vec::new(),
        removable: true,
        model: Some("Test Disk".to_string()),
        system: false,
    }
}

/// In-memory catalog. `unmount` clears the mount points it holds, so a
/// later refresh sees the device unmounted.
#[derive(Default)]
pub struct MemoryCatalog {
    devices: Mutex<Vec<Device>>,
    pub unmounted: Mutex<Vec<PathBuf>>,
}

impl MemoryCatalog {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
            unmounted: Mutex::new(Vec::new()),
        }
    }

    pub fn replace(&self, device: Device) {
        let mut devices = self.devices.lock().unwrap();
        devices.retain(|d| d.path != device.path);
        devices.push(device);
    }
}

impl DeviceCatalog for MemoryCatalog {
    fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn unmount(&self, device: &Device) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        let entry = devices
            .iter_mut()
            .find(|d| d.path == device.path)
            .ok_or_else(|| Error::NotFound(device.path.clone()))?;
        entry.mount_points.clear();
        self.unmounted.lock().unwrap().push(device.path.clone());
        Ok(())
    }
}

/// Answers every prompt with a fixed reply and remembers what it was shown.
pub struct ScriptedConfirmer {
    answer: bool,
    pub shown: Vec<ConfirmationSummary>,
}

impl ScriptedConfirmer {
    pub fn accept() -> Self {
        Self {
            answer: true,
            shown: Vec::new(),
        }
    }

    pub fn decline() -> Self {
        Self {
            answer: false,
            shown: Vec::new(),
        }
    }
}

impl Confirmer for ScriptedConfirmer {
    fn confirm(&mut self, summary: &ConfirmationSummary) -> Result<bool> {
        self.shown.push(summary.clone());
        Ok(self.answer)
    }
}

/// Runs a shell script in place of `dd`.
///
/// The script gets the output path as `$1` and the input path (or `-` for
/// stdin) as `$2`, and reports progress the way `dd` does: `<n> bytes` lines
/// on stderr.
#[derive(Clone)]
pub struct ScriptExecutor {
    script: String,
}

impl ScriptExecutor {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl Executor for ScriptExecutor {
    fn command(&self, job: &CopyJob) -> Command {
        let input = match &job.input {
            Input::Path(path) => path.clone(),
            Input::Stdin => PathBuf::from("-"),
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.script)
            .arg("sh")
            .arg(&job.output)
            .arg(input);
        cmd
    }

    fn progress_parser(&self) -> Box<dyn ProgressParser> {
        Box::new(DdStatusParser)
    }
}

pub fn sha256_file(path: &Path) -> String {
    ddsafe_core::verify::verify(path, ddsafe_core::ChecksumAlgorithm::Sha256).unwrap()
}
