use super::DeviceAccess;
use crate::device::Device;
use crate::error::{ImageError, Result};
use crate::handle::BlockHandle;

fn unsupported<T>(operation: &str) -> Result<T> {
    Err(ImageError::Unsupported(format!(
        "{operation} is not implemented on {}",
        std::env::consts::OS
    )))
}

pub fn list_devices() -> Result<Vec<Device>> {
    unsupported("device discovery")
}

pub fn unmount(_device: &Device) -> Result<()> {
    unsupported("unmounting")
}

pub fn wipe(_device: &Device) -> Result<()> {
    unsupported("partition table wiping")
}

pub fn open_device(_device: &Device, _access: DeviceAccess) -> Result<Box<dyn BlockHandle>> {
    unsupported("raw device access")
}
