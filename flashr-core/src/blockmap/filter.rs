use std::io::{self, Read};

use sha2::{Digest, Sha256};
use tracing::warn;

use super::{BlockMap, ChecksumType};
use crate::block::Block;
use crate::error::{ImageError, Result};

/// Largest chunk emitted for a single mapped range.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Re-emits only the mapped byte ranges of a dense stream.
///
/// Each emitted [`Block`] carries its offset within the source, so a sparse
/// writer downstream can place it without the unallocated regions ever
/// crossing the pipeline. Unmapped bytes are read and discarded; nothing is
/// read past the end of the last range.
///
/// When verification is enabled and the map carries SHA-256 range checksums,
/// each range is hashed as it streams past and a mismatch ends the stream
/// with [`ImageError::ChecksumMismatch`].
pub struct FilterStream<R> {
    reader: R,
    map: BlockMap,
    chunk_size: usize,
    verify: bool,
    position: u64,
    range_index: usize,
    hasher: Sha256,
    done: bool,
}

impl<R: Read> FilterStream<R> {
    pub fn new(reader: R, map: BlockMap) -> Self {
        let chunk_size = (DEFAULT_CHUNK_SIZE as u64).max(map.block_size()) as usize;
        Self {
            reader,
            map,
            chunk_size,
            verify: false,
            position: 0,
            range_index: 0,
            hasher: Sha256::new(),
            done: false,
        }
    }

    /// Sets the largest emitted chunk, rounded up to whole map blocks.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        let block_size = self.map.block_size() as usize;
        self.chunk_size = chunk_size.max(1).div_ceil(block_size) * block_size;
        self
    }

    /// Enables per-range checksum verification.
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        if verify {
            if let Some(ChecksumType::Other(name)) = self.map.checksum_type() {
                warn!(checksum_type = %name, "block-map checksums cannot be verified; skipping");
                self.verify = false;
            }
        }
        self
    }

    /// Bytes consumed from the source so far, skipped regions included.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn skip_to(&mut self, target: u64) -> Result<()> {
        let gap = target - self.position;
        let skipped = io::copy(&mut (&mut self.reader).take(gap), &mut io::sink())?;
        self.position += skipped;
        if skipped < gap {
            return Err(self.truncated(target));
        }
        Ok(())
    }

    fn truncated(&self, expected: u64) -> ImageError {
        ImageError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "source ended at offset {} before mapped offset {expected}",
                self.position
            ),
        ))
    }

    fn next_block(&mut self) -> Result<Option<Block>> {
        let Some(mapped) = self.map.ranges().get(self.range_index) else {
            return Ok(None);
        };
        let range = mapped.range;
        let checksum = if self.verify { mapped.checksum.clone() } else { None };
        if self.position < range.start {
            self.skip_to(range.start)?;
        }

        let len = (range.end - self.position).min(self.chunk_size as u64) as usize;
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => {
                    self.position += filled as u64;
                    return Err(self.truncated(range.end));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        let block = Block::new(data, self.position);
        self.position += len as u64;

        if checksum.is_some() {
            self.hasher.update(&block.data);
        }
        if self.position == range.end {
            self.range_index += 1;
            if let Some(expected) = checksum {
                let actual = std::mem::take(&mut self.hasher).finalize();
                if actual.as_slice() != expected.as_slice() {
                    return Err(ImageError::ChecksumMismatch {
                        offset: range.start,
                        length: range.len(),
                    });
                }
            }
        }
        Ok(Some(block))
    }
}

impl<R: Read> Iterator for FilterStream<R> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
