//! The positioned unit of data passed between streaming stages.

use crate::error::Result;

/// A buffer of image data tagged with the absolute offset it occupies in the
/// destination.
///
/// Blocks produced by the re-chunker are exactly one chunk long, except for
/// the final block of a stream which may be shorter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub data: Vec<u8>,
    pub position: u64,
}

impl Block {
    pub fn new(data: Vec<u8>, position: u64) -> Self {
        Self { data, position }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The offset one past the last byte of this block.
    pub fn end(&self) -> u64 {
        self.position + self.data.len() as u64
    }
}

/// A consumer of positioned blocks.
///
/// `write_block` returns only once the block has been accepted, so a
/// producer driving a sink can never outrun it.
pub trait BlockSink {
    fn write_block(&mut self, block: Block) -> Result<()>;

    /// Called once after the last block.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: BlockSink + ?Sized> BlockSink for &mut S {
    fn write_block(&mut self, block: Block) -> Result<()> {
        (**self).write_block(block)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Collects blocks in memory.
impl BlockSink for Vec<Block> {
    fn write_block(&mut self, block: Block) -> Result<()> {
        self.push(block);
        Ok(())
    }
}
