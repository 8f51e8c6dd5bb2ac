use crate::blockmap::BlockMap;
use crate::device::DEFAULT_LOGICAL_BLOCK_SIZE;
use crate::error::{ImageError, Result};

/// What an image reports about itself once opened.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    /// Logical (uncompressed) length in bytes, `None` if unknown.
    pub size: Option<u64>,
    /// Length of the compressed container, `None` if not applicable.
    pub compressed_size: Option<u64>,
    /// Physical write granularity in bytes.
    pub block_size: Option<u32>,
    /// Sector size reported by the device.
    pub logical_block_size: u32,
    /// Human-readable name, e.g. a device's model.
    pub name: Option<String>,
    /// Embedded manifest document.
    pub manifest: Option<serde_json::Value>,
    pub block_map: Option<BlockMap>,
    /// Embedded logo (SVG source).
    pub logo: Option<String>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            size: None,
            compressed_size: None,
            block_size: None,
            logical_block_size: DEFAULT_LOGICAL_BLOCK_SIZE,
            name: None,
            manifest: None,
            block_map: None,
            logo: None,
        }
    }
}

impl Metadata {
    /// The granularity I/O against this image should be aligned to.
    pub fn io_block_size(&self) -> usize {
        self.block_size.unwrap_or(self.logical_block_size).max(1) as usize
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed_size.is_some()
    }

    /// Rejects metadata no image can have: a compressed form larger than the
    /// data it expands to, or block sizes that are not powers of two.
    pub fn validate(&self) -> Result<()> {
        if let (Some(size), Some(compressed)) = (self.size, self.compressed_size)
            && compressed > size
        {
            return Err(ImageError::invalid(format!(
                "compressed size {compressed} exceeds image size {size}"
            )));
        }
        let mut sizes = self.block_size.into_iter().chain([self.logical_block_size]);
        if let Some(bad) = sizes.find(|&n| power_of_two(n).is_none()) {
            return Err(ImageError::invalid(format!(
                "block size {bad} is not a power of two"
            )));
        }
        Ok(())
    }
}

/// Returns `size` when it is a positive power of two.
pub(crate) fn power_of_two(size: u32) -> Option<u32> {
    (size > 0 && size.is_power_of_two()).then_some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_checks_sizes() {
        let mut metadata = Metadata {
            size: Some(4096),
            compressed_size: Some(1000),
            block_size: Some(4096),
            ..Metadata::default()
        };
        assert!(metadata.validate().is_ok());

        metadata.compressed_size = Some(5000);
        assert!(matches!(metadata.validate(), Err(ImageError::InvalidFormat(_))));

        metadata.compressed_size = None;
        metadata.block_size = Some(3000);
        assert!(matches!(metadata.validate(), Err(ImageError::InvalidFormat(_))));

        metadata.block_size = None;
        metadata.size = None;
        metadata.compressed_size = Some(5000);
        assert!(metadata.validate().is_ok());
    }
}
