//! Post-write verification.
//!
//! A [`Verifier`] is fed the same blocks that were written (it is a
//! [`BlockSink`]) and reads the destination back at each block's position.
//! Both sides are hashed with SHA-256, per block and across the whole run.

use std::io;

use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::block::{Block, BlockSink};
use crate::error::{ImageError, Result};
use crate::handle::BlockHandle;
use crate::stream::AlignedBuf;

/// Outcome of a successful verification pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyReport {
    pub bytes_verified: u64,
    pub blocks_verified: u64,
    /// Hex SHA-256 of every verified byte, in the order the blocks arrived.
    pub digest: String,
}

/// Compares source blocks against a destination handle.
pub struct Verifier<'a> {
    handle: &'a mut dyn BlockHandle,
    limit: Option<u64>,
    source: Sha256,
    destination: Sha256,
    scratch: Option<AlignedBuf>,
    mismatch: Option<u64>,
    bytes_verified: u64,
    blocks_verified: u64,
}

impl<'a> Verifier<'a> {
    pub fn new(handle: &'a mut dyn BlockHandle) -> Self {
        Self {
            handle,
            limit: None,
            source: Sha256::new(),
            destination: Sha256::new(),
            scratch: None,
            mismatch: None,
            bytes_verified: 0,
            blocks_verified: 0,
        }
    }

    /// Fails any block that reaches past `limit` bytes of the destination.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn bytes_verified(&self) -> u64 {
        self.bytes_verified
    }

    /// Offset of the first block whose contents differed, if any.
    pub fn first_mismatch(&self) -> Option<u64> {
        self.mismatch
    }

    /// Checks one block, recording rather than failing on a content mismatch.
    pub fn verify_block(&mut self, block: &Block) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        if let Some(limit) = self.limit.filter(|&limit| block.end() > limit) {
            return Err(ImageError::VerificationFailed(format!(
                "block at offset {} ends past the destination size {limit}",
                block.position
            )));
        }

        let alignment = self.handle.alignment();
        let on_disk = if alignment > 1 {
            self.read_aligned(block, alignment)?
        } else {
            let mut buf = vec![0u8; block.len()];
            let n = read_full(&mut *self.handle, &mut buf, block.position)?;
            buf.truncate(n);
            buf
        };
        if on_disk.len() < block.len() {
            return Err(ImageError::VerificationFailed(format!(
                "destination ends at offset {} inside a {}-byte block at {}",
                block.position + on_disk.len() as u64,
                block.len(),
                block.position
            )));
        }

        let expected = Sha256::digest(&block.data);
        let actual = Sha256::digest(&on_disk);
        if expected != actual && self.mismatch.is_none() {
            debug!(position = block.position, len = block.len(), "verification mismatch");
            self.mismatch = Some(block.position);
        }
        trace!(position = block.position, len = block.len(), "verified block");
        self.source.update(&block.data);
        self.destination.update(&on_disk);
        self.bytes_verified += block.len() as u64;
        self.blocks_verified += 1;
        Ok(())
    }

    /// Reads the block's span widened to `alignment` and returns the block's
    /// part of it.
    fn read_aligned(&mut self, block: &Block, alignment: usize) -> Result<Vec<u8>> {
        let align = alignment as u64;
        let start = block.position - block.position % align;
        let end = block.end().div_ceil(align) * align;
        let len = (end - start) as usize;
        if self.scratch.as_ref().is_some_and(|s| s.len() < len) {
            self.scratch = None;
        }
        let scratch = self
            .scratch
            .get_or_insert_with(|| AlignedBuf::new(len, alignment));
        let buf = &mut scratch.as_mut_slice()[..len];
        let n = read_full(&mut *self.handle, buf, start)?;
        let skip = (block.position - start) as usize;
        let available = n.saturating_sub(skip).min(block.len());
        Ok(buf[skip..skip + available].to_vec())
    }

    /// Ends the pass, failing if any block differed.
    pub fn finish(self) -> Result<VerifyReport> {
        let source = self.source.finalize();
        let destination = self.destination.finalize();
        if let Some(offset) = self.mismatch {
            return Err(ImageError::VerificationFailed(format!(
                "destination differs from source at offset {offset}"
            )));
        }
        if source != destination {
            return Err(ImageError::VerificationFailed("digest mismatch".into()));
        }
        let digest = hex::encode(source);
        debug!(bytes = self.bytes_verified, blocks = self.blocks_verified, %digest, "verified");
        Ok(VerifyReport {
            bytes_verified: self.bytes_verified,
            blocks_verified: self.blocks_verified,
            digest,
        })
    }
}

impl BlockSink for Verifier<'_> {
    fn write_block(&mut self, block: Block) -> Result<()> {
        self.verify_block(&block)
    }
}

/// Reads until `buf` is full or the handle runs out.
fn read_full(handle: &mut dyn BlockHandle, buf: &mut [u8], position: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match handle.read_at(&mut buf[filled..], position + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::MemoryHandle;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn matching_destination_verifies() {
        let data = pattern(10_000);
        let mut handle = MemoryHandle::new(data.clone());
        let mut verifier = Verifier::new(&mut handle).with_limit(Some(10_000));
        for (i, chunk) in data.chunks(4096).enumerate() {
            verifier
                .write_block(Block::new(chunk.to_vec(), (i * 4096) as u64))
                .unwrap();
        }
        let report = verifier.finish().unwrap();
        assert_eq!(report.bytes_verified, 10_000);
        assert_eq!(report.blocks_verified, 3);
        assert_eq!(report.digest, hex::encode(Sha256::digest(&data)));
    }

    #[test]
    fn first_mismatch_is_reported() {
        let mut data = pattern(8192);
        let source = data.clone();
        data[5000] ^= 0xff;
        let mut handle = MemoryHandle::new(data);
        let mut verifier = Verifier::new(&mut handle);
        verifier.write_block(Block::new(source[..4096].to_vec(), 0)).unwrap();
        verifier.write_block(Block::new(source[4096..].to_vec(), 4096)).unwrap();
        assert_eq!(verifier.first_mismatch(), Some(4096));
        let err = verifier.finish().unwrap_err();
        assert!(matches!(err, ImageError::VerificationFailed(msg) if msg.contains("4096")));
    }

    #[test]
    fn short_destination_fails() {
        let mut handle = MemoryHandle::new(vec![0; 100]);
        let mut verifier = Verifier::new(&mut handle);
        let err = verifier.verify_block(&Block::new(vec![0; 512], 0)).unwrap_err();
        assert!(matches!(err, ImageError::VerificationFailed(_)));

        let mut verifier = Verifier::new(&mut handle).with_limit(Some(100));
        let err = verifier.verify_block(&Block::new(vec![0; 50], 80)).unwrap_err();
        assert!(matches!(err, ImageError::VerificationFailed(_)));
    }

    #[test]
    fn aligned_handles_read_whole_sectors() {
        let data = pattern(4096);
        let mut handle = MemoryHandle::new(data.clone()).with_alignment(512);
        let mut verifier = Verifier::new(&mut handle);
        verifier.write_block(Block::new(data[700..1300].to_vec(), 700)).unwrap();
        assert_eq!(verifier.finish().unwrap().bytes_verified, 600);
    }
}
