use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, umount2};
use tracing::{debug, warn};

use super::DeviceAccess;
use crate::device::{DEFAULT_LOGICAL_BLOCK_SIZE, Device};
use crate::error::{ImageError, Result};
use crate::handle::{self, BlockHandle, FileHandle};
use crate::os_options::HandleFlags;

/// Bytes zeroed at each end of a device by [`wipe`]; covers the MBR and both
/// GPT copies for 512- and 4096-byte sectors.
const WIPE_LEN: u64 = 1024 * 1024;

nix::ioctl_none!(blkrrpart, 0x12, 95);

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

fn read_sys_number(device_name: &str, file: &str) -> u64 {
    read_sys_file(device_name, file)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Returns `true` when `name` is `device_name` or one of its partitions
/// (`sdb1`, `mmcblk0p2`, `nvme0n1p3`).
fn is_same_or_partition(name: &str, device_name: &str) -> bool {
    let Some(rest) = name.strip_prefix(device_name) else {
        return false;
    };
    let digits = rest.strip_prefix('p').unwrap_or(rest);
    rest.is_empty() || (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn describe(device_name: &str) -> String {
    let vendor = read_sys_file(device_name, "device/vendor").unwrap_or_default();
    let model = read_sys_file(device_name, "device/model").unwrap_or_default();
    let description = format!("{vendor} {model}").trim().to_string();
    if description.is_empty() {
        device_name.to_string()
    } else {
        description
    }
}

/// Scans `/sys/block` for removable block devices.
///
/// The filtering logic is as follows:
/// 1.  Find the main system drive (e.g., `/dev/nvme0n1`) and exclude it.
/// 2.  Skip any loop devices (e.g., `loop0`).
/// 3.  Keep only devices whose `/sys/block/<device>/removable` flag is set.
/// 4.  Skip devices reporting a size of zero, which often corresponds to
///     empty card readers.
///
/// Mount points come from `sysinfo` and cover the device and its partitions.
pub fn list_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk_parent = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| get_parent_device_path(&PathBuf::from("/dev/").join(disk.name())))
        .ok_or_else(|| ImageError::NotFound("could not determine system drive".into()))?;

    let mut devices = Vec::new();
    for entry in fs::read_dir("/sys/block")?.filter_map(std::result::Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") || device_path == system_disk_parent {
            continue;
        }

        let is_removable = read_sys_file(&device_name, "removable").is_ok_and(|s| s == "1");
        if !is_removable {
            continue;
        }

        // `size` is always in 512-byte units, whatever the sector size.
        let size_sectors = read_sys_number(&device_name, "size");
        if size_sectors == 0 {
            continue;
        }

        let mount_points = disks
            .iter()
            .filter(|disk| {
                Path::new(disk.name())
                    .file_name()
                    .is_some_and(|name| is_same_or_partition(&name.to_string_lossy(), &device_name))
            })
            .map(|disk| disk.mount_point().to_path_buf())
            .collect();

        devices.push(Device {
            raw_path: device_path.clone(),
            device_path,
            size: size_sectors * 512,
            block_size: read_sys_number(&device_name, "queue/physical_block_size") as u32,
            logical_block_size: read_sys_number(&device_name, "queue/logical_block_size") as u32,
            description: describe(&device_name),
            mount_points,
        });
    }

    debug!(count = devices.len(), "listed devices");
    Ok(devices)
}

/// Unmounts the device's filesystems, deepest mount point first.
pub fn unmount(device: &Device) -> Result<()> {
    let mut mount_points = device.mount_points.clone();
    mount_points.sort_by_key(|mp| std::cmp::Reverse(mp.components().count()));
    for mount_point in &mount_points {
        debug!(device = %device.device_path.display(), mount_point = %mount_point.display(), "unmount");
        umount2(mount_point.as_path(), MntFlags::empty()).map_err(|e| {
            ImageError::DeviceBusy(format!(
                "unmounting {} from {}: {e}",
                device.device_path.display(),
                mount_point.display()
            ))
        })?;
    }
    Ok(())
}

/// Zeroes both ends of the device and asks the kernel to re-read its
/// (now empty) partition table.
pub fn wipe(device: &Device) -> Result<()> {
    let flags = HandleFlags {
        sync: true,
        ..HandleFlags::default()
    };
    let file = handle::open_file(&device.raw_path, true, flags).map_err(|e| busy(device, e))?;
    let mut target = FileHandle::new(file);
    let size = if device.size > 0 { device.size } else { target.len()? };

    let head = WIPE_LEN.min(size);
    let tail_start = size.saturating_sub(WIPE_LEN).max(head);
    let zeros = vec![0u8; WIPE_LEN as usize];
    for (start, len) in [(0, head), (tail_start, size - tail_start)] {
        if len == 0 {
            continue;
        }
        let written = target.write_at(&zeros[..len as usize], start)?;
        if written as u64 != len {
            return Err(ImageError::ShortWrite {
                position: start,
                expected: len as usize,
                written,
            });
        }
    }
    target.sync()?;

    let fd = std::os::fd::AsRawFd::as_raw_fd(target.file());
    // SAFETY: `fd` is an open descriptor owned by `target` for this call.
    match unsafe { blkrrpart(fd) } {
        Ok(_) => {}
        // Devices without partition support (e.g. loop devices without
        // partscan) reject the request; there is nothing to re-read.
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOTTY) => {
            warn!(device = %device.device_path.display(), "partition table re-read not supported");
        }
        // Our own exclusive write handle blocks the rescan; the kernel
        // rescans when that handle is closed.
        Err(nix::errno::Errno::EBUSY) => {
            warn!(device = %device.device_path.display(), "partition table re-read deferred");
        }
        Err(e) => {
            return Err(ImageError::DeviceBusy(format!(
                "re-reading partition table of {}: {e}",
                device.device_path.display()
            )));
        }
    }
    debug!(device = %device.device_path.display(), "wiped partition table");
    Ok(())
}

pub fn open_device(device: &Device, access: DeviceAccess) -> Result<Box<dyn BlockHandle>> {
    let flags = HandleFlags {
        sync: access.writable,
        direct: access.direct,
        exclusive: access.writable,
    };
    let file =
        handle::open_file(&device.raw_path, access.writable, flags).map_err(|e| busy(device, e))?;
    let mut handle = FileHandle::new(file);
    if access.direct {
        let alignment = match device.logical_block_size {
            0 => DEFAULT_LOGICAL_BLOCK_SIZE,
            n => n,
        };
        handle = handle.with_alignment(alignment as usize);
    }
    Ok(Box::new(handle))
}

fn busy(device: &Device, err: io::Error) -> ImageError {
    match err.raw_os_error() {
        Some(libc::EBUSY) => ImageError::DeviceBusy(format!(
            "{} is in use: {err}",
            device.raw_path.display()
        )),
        _ if err.kind() == io::ErrorKind::NotFound => {
            ImageError::NotFound(device.raw_path.display().to_string())
        }
        _ => ImageError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_partitions() {
        assert_eq!(
            get_parent_device_path(Path::new("/dev/sda1")),
            PathBuf::from("/dev/sda")
        );
        assert_eq!(
            get_parent_device_path(Path::new("/dev/nvme0n1p2")),
            PathBuf::from("/dev/nvme0n1")
        );
        assert_eq!(
            get_parent_device_path(Path::new("/dev/mmcblk0p1")),
            PathBuf::from("/dev/mmcblk0")
        );
    }

    #[test]
    fn partition_names_match_their_device() {
        assert!(is_same_or_partition("sdb", "sdb"));
        assert!(is_same_or_partition("sdb1", "sdb"));
        assert!(is_same_or_partition("mmcblk0p2", "mmcblk0"));
        assert!(!is_same_or_partition("sdba", "sdb"));
        assert!(!is_same_or_partition("sdc1", "sdb"));
        assert!(!is_same_or_partition("sdbp", "sdb"));
    }
}
