//! Block-aligned streaming between producers and handles.
//!
//! Data flows through these stages:
//!
//! - [`BlockStream`] re-chunks arbitrarily sized producer writes into
//!   positioned, block-aligned [`Block`](crate::block::Block)s.
//! - [`BlockWriter`] issues one positioned write per block and treats a short
//!   write as an error.
//! - [`SparseWriteStream`] drops blocks that miss every range of a
//!   [`BlockMap`](crate::blockmap::BlockMap) before handing the rest to a
//!   [`BlockWriter`].
//! - [`BlockReadStream`] reads a handle back one block at a time.
//!
//! Every stage is pull-driven or call-driven on the caller's thread: a stage
//! only accepts the next block once the previous one was fully written, so the
//! source can never outrun the destination. An error from any stage ends the
//! whole chain.

mod raw;
mod rechunk;
mod sparse;

pub use raw::{BlockReadStream, BlockWriter};
pub use rechunk::BlockStream;
pub use sparse::SparseWriteStream;

pub(crate) use raw::AlignedBuf;

use crate::handle::BlockHandle;

/// A write stream that re-chunks producer data onto a handle.
pub type BlockWriteStream<H> = BlockStream<BlockWriter<H>>;

/// Write stream borrowing the handle of an open image.
pub type WriteStream<'a> = BlockWriteStream<&'a mut dyn BlockHandle>;

/// Progress counters shared by the write-side stages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Bytes accepted from the producer.
    pub bytes_read: u64,
    pub blocks_read: u64,
    /// Bytes that reached the destination.
    pub bytes_written: u64,
    pub blocks_written: u64,
}
