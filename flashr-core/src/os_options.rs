//! Platform open flags for image and device handles.

use std::fs::OpenOptions;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(windows)]
use std::os::windows::fs::OpenOptionsExt;

/// How a handle should bypass or flush the OS page cache.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(all(unix, not(target_os = "linux")), allow(dead_code))]
pub(crate) struct HandleFlags {
    /// Every write completes only once it reached the device.
    pub sync: bool,
    /// Bypass the page cache; buffers, offsets and lengths must be aligned.
    pub direct: bool,
    /// Fail if another process (or a mounted filesystem) holds the device.
    pub exclusive: bool,
}

#[cfg(target_os = "linux")]
pub(crate) fn apply(options: &mut OpenOptions, flags: HandleFlags) {
    let mut bits = 0;
    if flags.sync {
        bits |= libc::O_SYNC | libc::O_DSYNC;
    }
    if flags.direct {
        bits |= libc::O_DIRECT;
    }
    if flags.exclusive {
        // Without O_CREAT, O_EXCL on a block device claims it exclusively.
        bits |= libc::O_EXCL;
    }
    options.custom_flags(bits);
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn apply(options: &mut OpenOptions, flags: HandleFlags) {
    // No O_DIRECT outside Linux; F_NOCACHE would need the fd after open.
    let mut bits = 0;
    if flags.sync {
        bits |= libc::O_SYNC | libc::O_DSYNC;
    }
    options.custom_flags(bits);
}

#[cfg(windows)]
pub(crate) fn apply(options: &mut OpenOptions, flags: HandleFlags) {
    const FILE_FLAG_WRITE_THROUGH: u32 = 0x8000_0000;
    const FILE_FLAG_NO_BUFFERING: u32 = 0x2000_0000;

    let mut bits = 0;
    if flags.sync {
        bits |= FILE_FLAG_WRITE_THROUGH;
    }
    if flags.direct {
        bits |= FILE_FLAG_NO_BUFFERING;
    }
    options.custom_flags(bits);
    if flags.exclusive {
        options.share_mode(0);
    }
}
