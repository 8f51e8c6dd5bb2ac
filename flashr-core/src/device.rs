use std::fmt;
use std::path::{Path, PathBuf};

/// Default sector size when a device does not report one.
pub const DEFAULT_LOGICAL_BLOCK_SIZE: u32 = 512;

/// A block device discovered on the system.
///
/// Populated by [`DevicePlatform::list_devices`](crate::platform::DevicePlatform::list_devices)
/// and looked up once when a block-device image is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The path users refer to the device by (e.g. `/dev/sdb`).
    pub device_path: PathBuf,
    /// The path opened for raw I/O (e.g. `/dev/rdisk2` on macOS,
    /// `\\.\PhysicalDrive1` on Windows; the same as `device_path` on Linux).
    pub raw_path: PathBuf,
    /// Capacity in bytes, 0 if unknown.
    pub size: u64,
    /// Physical write granularity in bytes, 0 if unknown.
    pub block_size: u32,
    /// Sector size reported by the device, 0 if unknown.
    pub logical_block_size: u32,
    pub description: String,
    /// Mount points of the device and its partitions.
    pub mount_points: Vec<PathBuf>,
}

impl Device {
    /// Returns `true` when `path` names this device by either of its paths.
    pub fn matches(&self, path: &Path) -> bool {
        self.device_path == path || self.raw_path == path
    }

    pub fn size_gb(&self) -> f64 {
        self.size as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    pub fn is_mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match self.mount_points.as_slice() {
            [] => "[Not mounted]".to_string(),
            [one] => format!("[Mounted at {}]", one.display()),
            [first, rest @ ..] => format!("[Mounted at {} +{}]", first.display(), rest.len()),
        };

        write!(
            f,
            "{:<15} {:<24} {:.1} GB {}",
            self.device_path.display(),
            self.description,
            self.size_gb(),
            mount_info
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device {
            device_path: PathBuf::from("/dev/sdb"),
            raw_path: PathBuf::from("/dev/rsdb"),
            size: 16 * 1024 * 1024 * 1024,
            block_size: 4096,
            logical_block_size: 512,
            description: "Flash Disk".into(),
            mount_points: vec![PathBuf::from("/media/usb")],
        }
    }

    #[test]
    fn matches_either_path() {
        let d = device();
        assert!(d.matches(Path::new("/dev/sdb")));
        assert!(d.matches(Path::new("/dev/rsdb")));
        assert!(!d.matches(Path::new("/dev/sdc")));
    }

    #[test]
    fn display_includes_size_and_mounts() {
        let text = device().to_string();
        assert!(text.contains("16.0 GB"));
        assert!(text.contains("[Mounted at /media/usb]"));
    }
}
