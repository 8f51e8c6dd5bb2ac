//! Platform collaborators for block-device destinations.
//!
//! Device enumeration, unmounting and partition-table wiping are owned by the
//! operating system. [`DevicePlatform`] is the seam the block-device image
//! talks through; [`SystemPlatform`] implements it for the running OS and
//! tests substitute their own.
//!
//! The platform module for the target OS (Linux, or a fallback that reports
//! every operation as unsupported) is selected with `#[cfg]`, and each exposes
//! the same free functions.

use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::handle::BlockHandle;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
mod other;
#[cfg(not(target_os = "linux"))]
pub use self::other::*;

/// How a device handle is opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceAccess {
    pub writable: bool,
    /// Bypass the page cache (`O_DIRECT`).
    pub direct: bool,
}

pub trait DevicePlatform: Send + Sync {
    /// Lists the devices eligible as flash destinations.
    fn list_devices(&self) -> Result<Vec<Device>>;

    /// Unmounts every filesystem on the device and its partitions.
    fn unmount(&self, device: &Device) -> Result<()>;

    /// Destroys the device's partition tables so the OS drops stale
    /// partitions before the new image lands.
    fn wipe(&self, device: &Device) -> Result<()>;

    /// Opens the device's raw path. Writable handles complete every write
    /// synchronously and claim the device exclusively.
    fn open_device(&self, device: &Device, access: DeviceAccess) -> Result<Box<dyn BlockHandle>>;
}

/// The operating system's own device management.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPlatform;

impl DevicePlatform for SystemPlatform {
    fn list_devices(&self) -> Result<Vec<Device>> {
        list_devices()
    }

    fn unmount(&self, device: &Device) -> Result<()> {
        unmount(device)
    }

    fn wipe(&self, device: &Device) -> Result<()> {
        wipe(device)
    }

    fn open_device(&self, device: &Device, access: DeviceAccess) -> Result<Box<dyn BlockHandle>> {
        open_device(device, access)
    }
}

/// The platform used when callers do not inject one.
pub fn system() -> Arc<dyn DevicePlatform> {
    Arc::new(SystemPlatform)
}
