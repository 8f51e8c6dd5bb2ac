//! The capability bitset callers query before invoking an operation.
//!
//! Each image variant declares a static set of capabilities. Once an image is
//! opened and its metadata is known, the set may only shrink: a zip archive
//! without an embedded block-map, for example, loses
//! [`Capability::READ_STREAM_SPARSE`]. Callers must therefore re-check the
//! capabilities of the opened image rather than relying on the declaration.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Capability: u32 {
        /// Positioned reads (`read_at`).
        const READ = 1 << 0;
        /// Positioned writes (`write_at`).
        const WRITE = 1 << 1;
        const READ_STREAM = 1 << 2;
        const WRITE_STREAM = 1 << 3;
        const READ_STREAM_SPARSE = 1 << 4;
        const WRITE_STREAM_SPARSE = 1 << 5;
        /// Read-back verification of written data.
        const VERIFY = 1 << 6;
        /// Creation of a new, empty destination.
        const CREATE = 1 << 7;
        /// Opening over a caller-supplied handle.
        const CUSTOM_HANDLE = 1 << 8;
    }
}

impl Capability {
    /// Returns `true` when every flag in `mask` is set.
    pub fn has(self, mask: Capability) -> bool {
        self.contains(mask)
    }

    /// Returns a copy with `mask` set or cleared.
    pub fn with_capability(self, mask: Capability, enabled: bool) -> Self {
        if enabled { self | mask } else { self - mask }
    }

    /// Returns a copy with `mask` cleared. Flags are never added.
    pub fn withdraw(self, mask: Capability) -> Self {
        self - mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_requires_every_flag_in_mask() {
        let caps = Capability::READ | Capability::READ_STREAM;
        assert!(caps.has(Capability::READ));
        assert!(caps.has(Capability::READ | Capability::READ_STREAM));
        assert!(!caps.has(Capability::READ | Capability::WRITE));
    }

    #[test]
    fn with_capability_toggles_flags() {
        let caps = Capability::READ_STREAM;
        let caps = caps.with_capability(Capability::WRITE_STREAM, true);
        assert_eq!(caps, Capability::READ_STREAM | Capability::WRITE_STREAM);
        let caps = caps.with_capability(Capability::READ_STREAM, false);
        assert_eq!(caps, Capability::WRITE_STREAM);
        // Clearing an unset flag is a no-op.
        assert_eq!(caps.with_capability(Capability::VERIFY, false), caps);
    }

    #[test]
    fn withdraw_never_adds_flags() {
        let caps = Capability::READ_STREAM | Capability::READ_STREAM_SPARSE;
        let narrowed = caps.withdraw(Capability::READ_STREAM_SPARSE | Capability::WRITE);
        assert_eq!(narrowed, Capability::READ_STREAM);
    }
}
