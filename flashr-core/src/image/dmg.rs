use std::fs::File;
use std::path::Path;

use tracing::debug;

use super::{Backend, OpenOptions, ReadStream, SparseReadStream};
use crate::capability::Capability;
use crate::error::Result;
use crate::handle::{self, BlockHandle};
use crate::metadata::Metadata;
use crate::os_options::HandleFlags;
use crate::udif::{SECTOR_SIZE, UdifImage};

pub(super) const CAPABILITY: Capability =
    Capability::READ_STREAM.union(Capability::READ_STREAM_SPARSE);

struct DmgImage {
    image: UdifImage<File>,
}

pub(super) fn open(
    path: &Path,
    _handle: Option<Box<dyn BlockHandle>>,
    _options: &OpenOptions,
) -> Result<Box<dyn Backend>> {
    let file = handle::open_file(path, false, HandleFlags::default())?;
    let image = UdifImage::open(file)?;
    debug!(path = %path.display(), chunks = image.chunks().len(), "dmg open");
    Ok(Box::new(DmgImage { image }))
}

impl Backend for DmgImage {
    fn metadata(&mut self) -> Result<Metadata> {
        Ok(Metadata {
            size: Some(self.image.size()),
            compressed_size: Some(self.image.encoded_size()),
            block_size: Some(SECTOR_SIZE as u32),
            block_map: Some(self.image.block_map()?),
            ..Metadata::default()
        })
    }

    fn read_stream(&mut self, _metadata: &Metadata, _options: &OpenOptions) -> Result<ReadStream<'_>> {
        Ok(Box::new(self.image.reader()))
    }

    fn sparse_read_stream(
        &mut self,
        _metadata: &Metadata,
        _options: &OpenOptions,
    ) -> Result<SparseReadStream<'_>> {
        Ok(Box::new(self.image.sparse_blocks()))
    }
}
