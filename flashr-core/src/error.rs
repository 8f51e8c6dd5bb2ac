use std::io;

use thiserror::Error;

use crate::capability::Capability;

pub type Result<T> = std::result::Result<T, ImageError>;

/// Unified error type for image sources and destinations.
///
/// Every failure surfaced by `flashr-core` maps onto one of these variants.
/// Errors raised while opening an image are returned verbatim; nothing at this
/// layer retries an operation.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The path or device does not resolve.
    #[error("not found: {0}")]
    NotFound(String),

    /// The format is unrecognised or the operation has no implementation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The operation is outside the image's capability set.
    #[error("{format}: {capability:?} not supported")]
    NotCapable {
        format: &'static str,
        capability: Capability,
    },

    #[error("io error: {0}")]
    Io(#[source] io::Error),

    #[error("short write at offset {position}: wrote {written} of {expected} bytes")]
    ShortWrite {
        position: u64,
        expected: usize,
        written: usize,
    },

    /// A container, block-map or manifest could not be parsed.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Unmounting or wiping the device failed.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("checksum mismatch in block-map range at offset {offset} ({length} bytes)")]
    ChecksumMismatch { offset: u64, length: u64 },

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("operation cancelled by user")]
    Cancelled,
}

impl ImageError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidFormat(message.into())
    }

    /// Wraps this error so it can cross a `std::io::Read`/`Write` boundary.
    ///
    /// [`From<io::Error>`] recovers the original variant on the way back.
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<ImageError>()) {
            return Self::Io(err);
        }
        let kind = err.kind();
        match err.into_inner() {
            Some(inner) => match inner.downcast::<ImageError>() {
                Ok(image_error) => *image_error,
                Err(inner) => Self::Io(io::Error::new(kind, inner)),
            },
            None => Self::Io(io::Error::from(kind)),
        }
    }
}
