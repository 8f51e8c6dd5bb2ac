use std::io;

use crate::block::{Block, BlockSink};
use crate::error::{ImageError, Result};

/// Buffers producer writes of any size and emits fixed-size, positioned
/// blocks to a [`BlockSink`].
///
/// Blocks are emitted in strictly increasing, contiguous offset order. Each
/// block is exactly `chunk_size` bytes (one block unless configured
/// otherwise) except the last, which is flushed short by [`finish`] rather
/// than zero-padded.
///
/// [`finish`]: BlockStream::finish
#[derive(Debug)]
pub struct BlockStream<S> {
    block_size: usize,
    chunk_size: usize,
    position: u64,
    buffer: Vec<u8>,
    sink: S,
}

impl<S: BlockSink> BlockStream<S> {
    pub fn new(block_size: usize, sink: S) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            chunk_size: block_size,
            position: 0,
            buffer: Vec::with_capacity(block_size),
            sink,
        }
    }

    /// Emits chunks of `chunk_size` bytes, rounded up to whole blocks.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1).div_ceil(self.block_size) * self.block_size;
        self.buffer = Vec::with_capacity(self.chunk_size);
        self
    }

    /// Places the first block at `position` instead of 0.
    pub fn starting_at(mut self, position: u64) -> Self {
        self.position = position;
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Offset of the next block to be emitted.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes held back waiting for a full chunk.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Accepts one producer chunk, emitting every block it completes.
    pub fn push(&mut self, mut chunk: &[u8]) -> Result<()> {
        if !self.buffer.is_empty() {
            let take = (self.chunk_size - self.buffer.len()).min(chunk.len());
            self.buffer.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.buffer.len() < self.chunk_size {
                return Ok(());
            }
            let data = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
            self.emit(data)?;
        }

        while chunk.len() >= self.chunk_size {
            let (head, rest) = chunk.split_at(self.chunk_size);
            self.emit(head.to_vec())?;
            chunk = rest;
        }

        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Flushes any partial chunk as a final short block and finishes the sink.
    pub fn finish(mut self) -> Result<S> {
        if !self.buffer.is_empty() {
            let data = std::mem::take(&mut self.buffer);
            self.emit(data)?;
        }
        self.sink.finish()?;
        Ok(self.sink)
    }

    fn emit(&mut self, data: Vec<u8>) -> Result<()> {
        let len = data.len() as u64;
        self.sink.write_block(Block::new(data, self.position))?;
        self.position += len;
        Ok(())
    }
}

impl<S: BlockSink> io::Write for BlockStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf).map_err(ImageError::into_io)?;
        Ok(buf.len())
    }

    /// Partial blocks are only flushed by [`BlockStream::finish`].
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
