use std::io::{self, Read};

use tracing::trace;

use super::WriteStats;
use crate::block::{Block, BlockSink};
use crate::error::{ImageError, Result};
use crate::handle::BlockHandle;

/// A heap buffer whose usable slice starts on an `alignment` boundary.
///
/// Direct I/O requires memory-aligned buffers, so the allocation is padded and
/// the slice offset chosen with `align_offset`.
pub(crate) struct AlignedBuf {
    buf: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuf {
    pub(crate) fn new(len: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1);
        let buf = vec![0u8; len + alignment];
        let offset = buf.as_ptr().align_offset(alignment);
        Self { buf, offset, len }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.len]
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..self.offset + self.len]
    }
}

/// Writes each block at its position with a single positioned write.
///
/// A write that lands fewer bytes than the block holds fails with
/// [`ImageError::ShortWrite`]; partial writes are never retried here. When the
/// handle requires aligned I/O, blocks are staged in an aligned buffer and a
/// trailing partial block is zero-padded to the alignment in that buffer only.
pub struct BlockWriter<H> {
    handle: H,
    scratch: Option<AlignedBuf>,
    stats: WriteStats,
}

impl<H: BlockHandle> BlockWriter<H> {
    pub fn new(handle: H) -> Self {
        Self {
            handle,
            scratch: None,
            stats: WriteStats::default(),
        }
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    pub fn into_handle(self) -> H {
        self.handle
    }

    /// Alignment the underlying handle requires of offsets and lengths.
    pub fn alignment(&self) -> usize {
        self.handle.alignment()
    }

    fn write_aligned(&mut self, block: &Block, alignment: usize) -> Result<usize> {
        let padded = block.len().div_ceil(alignment) * alignment;
        if self.scratch.as_ref().is_some_and(|s| s.len() < padded) {
            self.scratch = None;
        }
        let scratch = self
            .scratch
            .get_or_insert_with(|| AlignedBuf::new(padded, alignment));
        let staged = &mut scratch.as_mut_slice()[..padded];
        staged[..block.len()].copy_from_slice(&block.data);
        staged[block.len()..].fill(0);
        if padded != block.len() {
            trace!(position = block.position, len = block.len(), padded, "padding final block");
        }
        let written = self.handle.write_at(staged, block.position)?;
        Ok(written.min(block.len()))
    }
}

impl<H: BlockHandle> BlockSink for BlockWriter<H> {
    fn write_block(&mut self, block: Block) -> Result<()> {
        self.stats.bytes_read += block.len() as u64;
        self.stats.blocks_read += 1;

        let alignment = self.handle.alignment();
        let written = if alignment > 1 {
            self.write_aligned(&block, alignment)?
        } else {
            self.handle.write_at(&block.data, block.position)?
        };
        if written != block.len() {
            return Err(ImageError::ShortWrite {
                position: block.position,
                expected: block.len(),
                written,
            });
        }

        self.stats.bytes_written += written as u64;
        self.stats.blocks_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.handle.sync()?;
        Ok(())
    }
}

/// Reads a handle back one block at a time.
///
/// Each read asks for exactly one block at the current position and advances
/// by the bytes actually read. A short or empty read marks the end of the
/// medium. The stream is both an iterator of positioned [`Block`]s and a plain
/// [`Read`].
pub struct BlockReadStream<H> {
    handle: H,
    block_size: usize,
    position: u64,
    end: Option<u64>,
    scratch: AlignedBuf,
    pending: Vec<u8>,
    pending_offset: usize,
    done: bool,
}

impl<H: BlockHandle> BlockReadStream<H> {
    pub fn new(handle: H, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        let scratch = AlignedBuf::new(block_size, handle.alignment());
        Self {
            handle,
            block_size,
            position: 0,
            end: None,
            scratch,
            pending: Vec::new(),
            pending_offset: 0,
            done: false,
        }
    }

    /// Stops reading at `end` even if the medium is longer.
    pub fn with_end(mut self, end: u64) -> Self {
        self.end = Some(end);
        self
    }

    /// Starts reading at `position`.
    pub fn starting_at(mut self, position: u64) -> Self {
        self.position = position;
        self
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn next_block(&mut self) -> Result<Option<Block>> {
        if self.done {
            return Ok(None);
        }
        let wanted = match self.end {
            Some(end) if end <= self.position => {
                self.done = true;
                return Ok(None);
            }
            Some(end) => (end - self.position).min(self.block_size as u64) as usize,
            None => self.block_size,
        };
        // Aligned handles always read a whole block; the excess is dropped.
        let request = if self.handle.alignment() > 1 {
            self.block_size
        } else {
            wanted
        };

        let n = loop {
            match self
                .handle
                .read_at(&mut self.scratch.as_mut_slice()[..request], self.position)
            {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            self.done = true;
            return Ok(None);
        }
        if n < request {
            self.done = true;
        }
        let n = n.min(wanted);
        let block = Block::new(self.scratch.as_slice()[..n].to_vec(), self.position);
        self.position += n as u64;
        Ok(Some(block))
    }
}

impl<H: BlockHandle> Iterator for BlockReadStream<H> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_block() {
            Ok(block) => block.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<H: BlockHandle> Read for BlockReadStream<H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending_offset >= self.pending.len() {
            match self.next_block().map_err(ImageError::into_io)? {
                Some(block) => {
                    self.pending = block.data;
                    self.pending_offset = 0;
                }
                None => return Ok(0),
            }
        }
        let available = &self.pending[self.pending_offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::MemoryHandle;

    #[test]
    fn aligned_buf_is_aligned() {
        let mut buf = AlignedBuf::new(4096, 512);
        assert_eq!(buf.as_slice().as_ptr() as usize % 512, 0);
        assert_eq!(buf.as_mut_slice().len(), 4096);
    }

    #[test]
    fn writer_places_blocks_and_counts() {
        let device = MemoryHandle::fixed(16);
        let mut writer = BlockWriter::new(device.clone());
        writer.write_block(Block::new(b"abcd".to_vec(), 8)).unwrap();
        writer.write_block(Block::new(b"wxyz".to_vec(), 0)).unwrap();
        writer.finish().unwrap();
        assert_eq!(&device.contents()[..12], b"wxyz\0\0\0\0abcd");
        assert_eq!(writer.stats().blocks_written, 2);
        assert_eq!(writer.stats().bytes_written, 8);
        assert_eq!(device.sync_count(), 1);
    }

    #[test]
    fn short_write_is_an_error() {
        let device = MemoryHandle::fixed(10);
        let mut writer = BlockWriter::new(device);
        let err = writer
            .write_block(Block::new(vec![1; 4], 8))
            .unwrap_err();
        assert!(matches!(
            err,
            ImageError::ShortWrite { position: 8, expected: 4, written: 2 }
        ));
        assert_eq!(writer.stats().blocks_written, 0);
    }

    #[test]
    fn aligned_handles_get_padded_final_blocks() {
        let device = MemoryHandle::fixed(1024).with_alignment(512);
        let mut writer = BlockWriter::new(device.clone());
        writer.write_block(Block::new(vec![0xaa; 700], 0)).unwrap();
        assert_eq!(device.writes(), vec![(0, 1024)]);
        assert_eq!(writer.stats().bytes_written, 700);
        assert!(device.contents()[700..].iter().all(|&b| b == 0));
    }

    #[test]
    fn read_stream_ends_on_short_read() {
        let data: Vec<u8> = (0..10u8).collect();
        let blocks: Vec<_> = BlockReadStream::new(MemoryHandle::new(data), 4)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2], Block::new(vec![8, 9], 8));
    }

    #[test]
    fn read_stream_honours_end_and_implements_read() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut stream = BlockReadStream::new(MemoryHandle::new(data), 16).with_end(40);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, (0..40u8).collect::<Vec<_>>());
        assert_eq!(stream.position(), 40);
    }
}
