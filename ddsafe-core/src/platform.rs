//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! perform tasks that are not cross-platform: enumerating block devices,
//! measuring their extent, unmounting them and checking free space.
//!
//! Only Linux is supported. The transfer path relies on GNU `dd` and the
//! catalog on util-linux `lsblk`, neither of which has a faithful equivalent
//! on the other targets.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
#[cfg(target_os = "linux")]
pub(crate) use self::linux::get_parent_device_path;

#[cfg(not(target_os = "linux"))]
compile_error!("ddsafe-core only supports Linux");
