use tracing::trace;

use super::{BlockWriter, WriteStats};
use crate::block::{Block, BlockSink};
use crate::blockmap::BlockMap;
use crate::error::{ImageError, Result};
use crate::handle::BlockHandle;

/// Merged data held back for an aligned handle is written once it reaches
/// this many bytes.
const MAX_PENDING_LEN: usize = 1024 * 1024;

/// Writes only the blocks that intersect an allocated range of a block-map.
///
/// Without a map every block is written (a dense write). Dropped blocks cost
/// no destination I/O; their region keeps whatever the destination held.
///
/// The stream borrows or owns its handle through `H`. When it owns the handle
/// (`Box<dyn BlockHandle>`), [`close`](Self::close) releases it; a borrowed
/// handle outlives the stream.
///
/// Blocks may start anywhere (a sparse source reports its own granularity).
/// When the handle requires aligned I/O, accepted blocks that share an
/// alignment unit are merged, and the unmapped bytes between them are
/// written as zeros, so every write starts on an aligned offset.
pub struct SparseWriteStream<H> {
    writer: BlockWriter<H>,
    map: Option<BlockMap>,
    stats: WriteStats,
    pending: Option<Block>,
}

impl<H: BlockHandle> SparseWriteStream<H> {
    pub fn new(handle: H, map: Option<BlockMap>) -> Self {
        Self {
            writer: BlockWriter::new(handle),
            map,
            stats: WriteStats::default(),
            pending: None,
        }
    }

    pub fn block_map(&self) -> Option<&BlockMap> {
        self.map.as_ref()
    }

    /// Counters across the stream's lifetime: blocks received versus blocks
    /// that reached the destination.
    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Returns `true` when `block` would be written.
    pub fn accepts(&self, block: &Block) -> bool {
        self.map
            .as_ref()
            .is_none_or(|map| map.intersects(block.position, block.end()))
    }

    /// Syncs the destination and ends the stream, releasing an owned handle.
    pub fn close(mut self) -> Result<WriteStats> {
        BlockSink::finish(&mut self)?;
        Ok(self.stats)
    }

    fn write_merged(&mut self, block: Block, alignment: u64) -> Result<()> {
        if let Some(pending) = self.pending.as_mut() {
            if block.position < pending.end() {
                return Err(ImageError::invalid(format!(
                    "block at offset {} overlaps the previous block ending at {}",
                    block.position,
                    pending.end()
                )));
            }
            let unit_end = pending.end().next_multiple_of(alignment);
            if block.position < unit_end || block.position == pending.end() {
                let gap = (block.position - pending.position) as usize;
                pending.data.resize(gap, 0);
                pending.data.extend_from_slice(&block.data);
                return self.flush_full_units(alignment);
            }
            self.flush_pending()?;
        }

        let start = block.position - block.position % alignment;
        let mut data = vec![0u8; (block.position - start) as usize];
        data.extend_from_slice(&block.data);
        self.pending = Some(Block::new(data, start));
        self.flush_full_units(alignment)
    }

    /// Writes the aligned head of an oversized pending block.
    fn flush_full_units(&mut self, alignment: u64) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        if pending.len() < MAX_PENDING_LEN {
            return Ok(());
        }
        let head_len = pending.len() - pending.len() % alignment as usize;
        let tail = Block::new(
            pending.data.split_off(head_len),
            pending.position + head_len as u64,
        );
        let head = std::mem::replace(pending, tail);
        if self.pending.as_ref().is_some_and(Block::is_empty) {
            self.pending = None;
        }
        trace!(position = head.position, len = head.len(), "writing merged blocks");
        self.writer.write_block(head)
    }

    fn flush_pending(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(pending) => {
                trace!(position = pending.position, len = pending.len(), "writing merged blocks");
                self.writer.write_block(pending)
            }
            None => Ok(()),
        }
    }
}

impl<H: BlockHandle> BlockSink for SparseWriteStream<H> {
    fn write_block(&mut self, block: Block) -> Result<()> {
        self.stats.bytes_read += block.len() as u64;
        self.stats.blocks_read += 1;

        if !self.accepts(&block) {
            trace!(position = block.position, len = block.len(), "skipping unmapped block");
            return Ok(());
        }

        let len = block.len() as u64;
        let alignment = self.writer.alignment() as u64;
        if alignment > 1 {
            self.write_merged(block, alignment)?;
        } else {
            self.writer.write_block(block)?;
        }
        self.stats.bytes_written += len;
        self.stats.blocks_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.flush_pending()?;
        self.writer.finish()
    }
}
