//! Block allocation maps.
//!
//! A [`BlockMap`] records which fixed-size blocks of a logical image carry
//! data. Offsets outside every mapped range are unallocated: they read as zero
//! and never need to be written.

mod bmap;
mod filter;

pub use bmap::parse;
pub use filter::{DEFAULT_CHUNK_SIZE, FilterStream};

use crate::error::{ImageError, Result};

/// A half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn intersects(&self, start: u64, end: u64) -> bool {
        start < self.end && self.start < end
    }
}

/// Digest algorithm used for per-range checksums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumType {
    Sha256,
    /// Parsed but not verifiable here (e.g. `sha1` in bmap 1.3/1.4).
    Other(String),
}

/// One allocated range and its optional checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRange {
    pub range: ByteRange,
    pub checksum: Option<Vec<u8>>,
}

/// Sorted, non-overlapping allocated ranges of an image.
///
/// Invariants:
/// - `block_size` is a power of two.
/// - Ranges are ascending, disjoint, and start on a block boundary.
/// - Every range ends on a block boundary or at `image_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMap {
    image_size: u64,
    block_size: u64,
    checksum_type: Option<ChecksumType>,
    ranges: Vec<MappedRange>,
}

impl BlockMap {
    pub fn new(image_size: u64, block_size: u64) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(ImageError::invalid(format!(
                "block size {block_size} is not a power of two"
            )));
        }
        Ok(Self {
            image_size,
            block_size,
            checksum_type: None,
            ranges: Vec::new(),
        })
    }

    /// A map marking every block of the image as allocated.
    pub fn full(image_size: u64, block_size: u64) -> Result<Self> {
        let mut map = Self::new(image_size, block_size)?;
        map.insert(0, image_size)?;
        Ok(map)
    }

    pub fn with_checksum_type(mut self, checksum_type: ChecksumType) -> Self {
        self.checksum_type = Some(checksum_type);
        self
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn checksum_type(&self) -> Option<&ChecksumType> {
        self.checksum_type.as_ref()
    }

    pub fn ranges(&self) -> &[MappedRange] {
        &self.ranges
    }

    /// Total number of blocks the image spans.
    pub fn blocks_count(&self) -> u64 {
        self.image_size.div_ceil(self.block_size)
    }

    pub fn mapped_blocks(&self) -> u64 {
        self.ranges
            .iter()
            .map(|r| r.range.len().div_ceil(self.block_size))
            .sum()
    }

    pub fn mapped_size(&self) -> u64 {
        self.ranges.iter().map(|r| r.range.len()).sum()
    }

    /// Returns `true` when the map covers the whole image.
    pub fn is_full(&self) -> bool {
        self.mapped_size() == self.image_size
    }

    /// Appends blocks `first..=last` as an allocated range.
    ///
    /// Ranges must be appended in ascending order. The final block is clipped
    /// to `image_size`.
    pub fn push_blocks(&mut self, first: u64, last: u64, checksum: Option<Vec<u8>>) -> Result<()> {
        if last < first {
            return Err(ImageError::invalid(format!(
                "block range {first}-{last} is reversed"
            )));
        }
        if last >= self.blocks_count() {
            return Err(ImageError::invalid(format!(
                "block range {first}-{last} exceeds {} blocks",
                self.blocks_count()
            )));
        }
        let start = first * self.block_size;
        let end = ((last + 1) * self.block_size).min(self.image_size);
        if let Some(prev) = self.ranges.last() {
            if start < prev.range.end {
                return Err(ImageError::invalid(format!(
                    "block range {first}-{last} overlaps or precedes the previous range"
                )));
            }
        }
        self.ranges.push(MappedRange {
            range: ByteRange::new(start, end),
            checksum,
        });
        Ok(())
    }

    /// Marks `[start, end)` as allocated, widened to block boundaries and
    /// merged with any overlapping or adjacent range.
    ///
    /// Merged ranges lose their checksums, so this is meant for maps derived
    /// from allocation tables rather than parsed from a bmap file.
    pub fn insert(&mut self, start: u64, end: u64) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        if end > self.image_size {
            return Err(ImageError::invalid(format!(
                "range {start}..{end} exceeds image size {}",
                self.image_size
            )));
        }
        let start = start - start % self.block_size;
        let end = end.div_ceil(self.block_size).saturating_mul(self.block_size).min(self.image_size);
        let mut new = ByteRange::new(start, end);

        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut inserted = false;
        for r in self.ranges.drain(..) {
            if r.range.end < new.start {
                out.push(r);
                continue;
            }
            if new.end < r.range.start {
                if !inserted {
                    out.push(MappedRange {
                        range: new,
                        checksum: None,
                    });
                    inserted = true;
                }
                out.push(r);
                continue;
            }
            // Overlapping or adjacent.
            new = ByteRange::new(new.start.min(r.range.start), new.end.max(r.range.end));
        }
        if !inserted {
            out.push(MappedRange {
                range: new,
                checksum: None,
            });
        }
        self.ranges = out;
        Ok(())
    }

    /// Returns `true` when `[start, end)` overlaps any allocated range.
    pub fn intersects(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return false;
        }
        // First range that ends after `start`.
        let idx = self.ranges.partition_point(|r| r.range.end <= start);
        self.ranges
            .get(idx)
            .is_some_and(|r| r.range.intersects(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(ranges: &[(u64, u64)]) -> BlockMap {
        let mut map = BlockMap::new(16 * 4096, 4096).unwrap();
        for &(first, last) in ranges {
            map.push_blocks(first, last, None).unwrap();
        }
        map
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        assert!(matches!(
            BlockMap::new(4096, 3000),
            Err(ImageError::InvalidFormat(_))
        ));
        assert!(BlockMap::new(4096, 0).is_err());
    }

    #[test]
    fn push_blocks_enforces_order_and_bounds() {
        let mut map = map_with(&[(2, 3)]);
        assert!(map.push_blocks(3, 4, None).is_err());
        assert!(map.push_blocks(1, 1, None).is_err());
        assert!(map.push_blocks(16, 16, None).is_err());
        assert!(map.push_blocks(6, 5, None).is_err());
        map.push_blocks(4, 4, None).unwrap();
        assert_eq!(map.ranges().len(), 2);
    }

    #[test]
    fn final_range_is_clipped_to_image_size() {
        let mut map = BlockMap::new(10_000, 4096).unwrap();
        assert_eq!(map.blocks_count(), 3);
        map.push_blocks(1, 2, None).unwrap();
        assert_eq!(map.ranges()[0].range, ByteRange::new(4096, 10_000));
        assert_eq!(map.mapped_blocks(), 2);
        assert_eq!(map.mapped_size(), 10_000 - 4096);
    }

    #[test]
    fn intersects_matches_overlap_only() {
        let map = map_with(&[(1, 1), (4, 6)]);
        assert!(!map.intersects(0, 4096));
        assert!(map.intersects(0, 4097));
        assert!(map.intersects(4096, 8192));
        assert!(!map.intersects(8192, 16384));
        assert!(map.intersects(16383, 16384 + 1));
        assert!(map.intersects(6 * 4096, 7 * 4096));
        assert!(!map.intersects(7 * 4096, 8 * 4096));
        assert!(!map.intersects(5000, 5000));
    }

    #[test]
    fn insert_widens_and_merges() {
        let mut map = BlockMap::new(16 * 4096, 4096).unwrap();
        map.insert(100, 200).unwrap();
        map.insert(8192, 8192 + 10).unwrap();
        map.insert(4096, 8192).unwrap(); // adjacent to both
        assert_eq!(
            map.ranges()
                .iter()
                .map(|r| r.range)
                .collect::<Vec<_>>(),
            vec![ByteRange::new(0, 3 * 4096)]
        );
        assert!(map.insert(0, 17 * 4096).is_err());
    }

    #[test]
    fn full_map_covers_image() {
        let map = BlockMap::full(10_000, 512).unwrap();
        assert!(map.is_full());
        assert_eq!(map.mapped_blocks(), 20);
        assert!(!map_with(&[(0, 14)]).is_full());
    }
}
