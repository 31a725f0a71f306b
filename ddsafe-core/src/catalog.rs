//! Block device enumeration.
use crate::device::Device;
use crate::error::{Error, Result};
use std::path::Path;

/// Read-only view of the block devices attached to the system.
///
/// Implementations must query the OS on every call. Nothing here may serve
/// a cached size or mount state, because the Coordinator relies on
/// [`refresh`](DeviceCatalog::refresh) to catch devices that changed while
/// the operator was reading the confirmation prompt.
pub trait DeviceCatalog {
    /// Lists every disk and partition the catalog is willing to offer.
    fn list_devices(&self) -> Result<Vec<Device>>;

    /// Re-queries a single device by path.
    fn refresh(&self, path: &Path) -> Result<Device> {
        self.list_devices()?
            .into_iter()
            .find(|d| d.path == path)
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))
    }

    /// Unmounts every mount point of `device`.
    ///
    /// Only called after the operator explicitly asked for a forced unmount.
    fn unmount(&self, device: &Device) -> Result<()>;
}
