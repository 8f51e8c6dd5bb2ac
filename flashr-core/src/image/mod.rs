//! Uniform image sources and destinations.
//!
//! An [`Image`] names a path and a [`Format`] but holds no resources. Opening
//! it yields an [`OpenImage`], the only type that carries a handle and
//! [`Metadata`], so metadata can never be observed before a successful open.
//! Every operation on an open image is gated by its [`Capability`] set, which
//! may shrink (never grow) once the metadata is known.
//!
//! ```no_run
//! use flashr_core::{Access, Capability, Image, OpenOptions};
//!
//! # fn main() -> flashr_core::Result<()> {
//! let mut source = Image::from_path("raspios.zip")?.open(&OpenOptions::new())?;
//! let mut target = Image::from_path("/dev/sdb")?
//!     .open(&OpenOptions::new().access(Access::ReadWrite))?;
//!
//! if source.has_capability(Capability::READ_STREAM_SPARSE) {
//!     let map = source.metadata().block_map.clone();
//!     let mut writer = target.create_sparse_write_stream(map)?;
//!     for block in source.create_sparse_read_stream()? {
//!         flashr_core::BlockSink::write_block(&mut writer, block?)?;
//!     }
//!     writer.close()?;
//! }
//! # Ok(())
//! # }
//! ```

mod blockdevice;
mod dmg;
mod raw;
pub mod registry;
mod zip;

pub use raw::Compression;
pub use registry::{Format, FormatDescriptor};

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::block::Block;
use crate::blockmap::{BlockMap, DEFAULT_CHUNK_SIZE};
use crate::capability::Capability;
use crate::error::{ImageError, Result};
use crate::handle::BlockHandle;
use crate::metadata::Metadata;
use crate::platform::{self, DevicePlatform};
use crate::stream::{BlockStream, BlockWriter, SparseWriteStream, WriteStream};
use crate::verify::Verifier;

/// A dense stream over an image's logical contents.
pub type ReadStream<'a> = Box<dyn Read + 'a>;

/// Positioned blocks covering only the allocated regions of an image.
pub type SparseReadStream<'a> = Box<dyn Iterator<Item = Result<Block>> + 'a>;

/// Sparse write stream borrowing the handle of an open image.
pub type SparseWriter<'a> = SparseWriteStream<&'a mut dyn BlockHandle>;

/// Capabilities that only make sense on a writable image.
const WRITE_FAMILY: Capability = Capability::WRITE
    .union(Capability::WRITE_STREAM)
    .union(Capability::WRITE_STREAM_SPARSE)
    .union(Capability::VERIFY)
    .union(Capability::CREATE);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Access {
    #[default]
    Read,
    ReadWrite,
}

/// How an image is opened.
#[derive(Clone)]
pub struct OpenOptions {
    pub(crate) access: Access,
    pub(crate) direct_io: bool,
    pub(crate) chunk_size: usize,
    pub(crate) verify_checksums: bool,
    pub(crate) platform: Arc<dyn DevicePlatform>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self {
            access: Access::Read,
            direct_io: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify_checksums: true,
            platform: platform::system(),
        }
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Bypasses the OS page cache on file and device handles.
    pub fn direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }

    /// Buffering unit for streams, rounded up to whole blocks of the image.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Checks block-map range checksums while sparse-reading.
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Replaces the device platform used by block-device images.
    pub fn platform(mut self, platform: Arc<dyn DevicePlatform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("access", &self.access)
            .field("direct_io", &self.direct_io)
            .field("chunk_size", &self.chunk_size)
            .field("verify_checksums", &self.verify_checksums)
            .finish_non_exhaustive()
    }
}

/// The per-format half of an open image.
pub(crate) trait Backend: Send {
    /// Reads the image's metadata from its open handle.
    fn metadata(&mut self) -> Result<Metadata>;

    /// Capabilities that remain once `metadata` is known.
    fn narrow(&self, capability: Capability, _metadata: &Metadata) -> Capability {
        capability
    }

    /// Positioned access to the image's bytes, for formats that store them
    /// uncompressed.
    fn handle(&mut self) -> Option<&mut dyn BlockHandle> {
        None
    }

    fn read_stream(&mut self, metadata: &Metadata, options: &OpenOptions)
    -> Result<ReadStream<'_>>;

    fn sparse_read_stream(
        &mut self,
        _metadata: &Metadata,
        _options: &OpenOptions,
    ) -> Result<SparseReadStream<'_>> {
        Err(ImageError::Unsupported("sparse read stream".into()))
    }

    /// Runs before each write or sparse-write stream is handed out.
    fn prepare_write(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// A source or destination that has not been opened.
pub struct Image {
    path: PathBuf,
    format: Format,
    capability: Capability,
    handle: Option<Box<dyn BlockHandle>>,
}

impl Image {
    /// Resolves the format of `path` through the registry.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = registry::resolve(path)?;
        Ok(Self::new(path, format))
    }

    pub fn new(path: impl Into<PathBuf>, format: Format) -> Self {
        Self {
            path: path.into(),
            format,
            capability: format.descriptor().capability,
            handle: None,
        }
    }

    /// An image whose bytes live behind a caller-supplied handle instead of
    /// a file at `path`.
    pub fn with_handle(
        path: impl Into<PathBuf>,
        format: Format,
        handle: Box<dyn BlockHandle>,
    ) -> Result<Self> {
        let mut image = Self::new(path, format);
        image.require(Capability::CUSTOM_HANDLE)?;
        image.handle = Some(handle);
        Ok(image)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn has_capability(&self, mask: Capability) -> bool {
        self.capability.has(mask)
    }

    /// Sets or clears flags. Flags outside the format's declared set are
    /// never granted.
    pub fn with_capability(mut self, mask: Capability, enabled: bool) -> Self {
        let declared = self.format.descriptor().capability;
        self.capability = self.capability.with_capability(mask, enabled) & declared;
        self
    }

    /// Acquires a handle and reads the metadata.
    ///
    /// Failure drops whatever was acquired, so nothing leaks.
    pub fn open(self, options: &OpenOptions) -> Result<OpenImage> {
        debug!(path = %self.path.display(), format = %self.format, ?options, "open");
        let backend = (self.format.descriptor().open)(&self.path, self.handle, options)?;
        OpenImage::new(self.path, self.format, self.capability, backend, options)
    }

    /// Creates a new image at `path`, sized to `size` when given, and opens
    /// it for writing.
    pub fn create(self, options: &OpenOptions, size: Option<u64>) -> Result<OpenImage> {
        self.require(Capability::CREATE)?;
        let create = self.format.descriptor().create.ok_or(ImageError::NotCapable {
            format: self.format.name(),
            capability: Capability::CREATE,
        })?;
        let options = options.clone().access(Access::ReadWrite);
        debug!(path = %self.path.display(), format = %self.format, ?size, "create");
        let backend = create(&self.path, size, &options)?;
        OpenImage::new(self.path, self.format, self.capability, backend, &options)
    }

    /// Releases a caller-supplied handle, if any. Nothing else is held.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    fn require(&self, mask: Capability) -> Result<()> {
        require(self.format, self.capability, mask)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("capability", &self.capability)
            .field("custom_handle", &self.handle.is_some())
            .finish()
    }
}

/// An opened image: owns its handle and metadata until [`close`](Self::close)
/// or drop.
///
/// Streams borrow the image mutably, so at most one stream is live at a time
/// and the handle always outlives it.
pub struct OpenImage {
    path: PathBuf,
    format: Format,
    capability: Capability,
    metadata: Metadata,
    options: OpenOptions,
    backend: Box<dyn Backend>,
}

impl OpenImage {
    fn new(
        path: PathBuf,
        format: Format,
        capability: Capability,
        mut backend: Box<dyn Backend>,
        options: &OpenOptions,
    ) -> Result<Self> {
        let metadata = backend.metadata()?;
        metadata.validate()?;
        let mut capability = capability & backend.narrow(capability, &metadata);
        if !options.is_writable() {
            capability = capability.withdraw(WRITE_FAMILY);
        }
        debug!(
            path = %path.display(),
            size = ?metadata.size,
            block_size = ?metadata.block_size,
            ?capability,
            "opened"
        );
        Ok(Self {
            path,
            format,
            capability,
            metadata,
            options: options.clone(),
            backend,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn has_capability(&self, mask: Capability) -> bool {
        self.capability.has(mask)
    }

    /// Clears capabilities on an open image. Nothing can be granted back.
    pub fn withdraw_capability(&mut self, mask: Capability) -> Capability {
        self.capability = self.capability.withdraw(mask);
        self.capability
    }

    /// Re-reads the metadata. On failure the image is closed.
    pub fn refresh_metadata(mut self) -> Result<Self> {
        self.metadata = self.backend.metadata()?;
        self.capability = self.capability & self.backend.narrow(self.capability, &self.metadata);
        Ok(self)
    }

    pub fn read_at(&mut self, buf: &mut [u8], position: u64) -> Result<usize> {
        self.require(Capability::READ)?;
        Ok(self.handle()?.read_at(buf, position)?)
    }

    pub fn write_at(&mut self, buf: &[u8], position: u64) -> Result<usize> {
        self.require(Capability::WRITE)?;
        Ok(self.handle()?.write_at(buf, position)?)
    }

    pub fn create_read_stream(&mut self) -> Result<ReadStream<'_>> {
        self.require(Capability::READ_STREAM)?;
        debug!(path = %self.path.display(), "read stream");
        self.backend.read_stream(&self.metadata, &self.options)
    }

    pub fn create_sparse_read_stream(&mut self) -> Result<SparseReadStream<'_>> {
        self.require(Capability::READ_STREAM_SPARSE)?;
        debug!(path = %self.path.display(), "sparse read stream");
        self.backend.sparse_read_stream(&self.metadata, &self.options)
    }

    /// A re-chunking write stream placing producer bytes from offset 0.
    pub fn create_write_stream(&mut self) -> Result<WriteStream<'_>> {
        self.require(Capability::WRITE_STREAM)?;
        self.backend.prepare_write()?;
        let block_size = self.metadata.io_block_size();
        let chunk_size = self.options.chunk_size;
        debug!(path = %self.path.display(), block_size, chunk_size, "write stream");
        let handle = self.handle()?;
        Ok(BlockStream::new(block_size, BlockWriter::new(handle)).with_chunk_size(chunk_size))
    }

    /// A write stream that only lands blocks intersecting `map`; without a
    /// map every block is written.
    pub fn create_sparse_write_stream(&mut self, map: Option<BlockMap>) -> Result<SparseWriter<'_>> {
        self.require(Capability::WRITE_STREAM_SPARSE)?;
        self.backend.prepare_write()?;
        debug!(path = %self.path.display(), mapped = ?map.as_ref().map(BlockMap::mapped_size), "sparse write stream");
        let handle = self.handle()?;
        Ok(SparseWriteStream::new(handle, map))
    }

    /// Compares source blocks against what this image holds.
    pub fn create_verify(&mut self) -> Result<Verifier<'_>> {
        self.require(Capability::VERIFY)?;
        let handle = self.handle()?;
        let size = handle.len()?;
        Ok(Verifier::new(handle).with_limit(Some(size)))
    }

    /// Releases the handle.
    pub fn close(self) -> Result<()> {
        debug!(path = %self.path.display(), "close");
        self.backend.close()
    }

    fn require(&self, mask: Capability) -> Result<()> {
        require(self.format, self.capability, mask)
    }

    fn handle(&mut self) -> Result<&mut dyn BlockHandle> {
        let format = self.format.name();
        self.backend
            .handle()
            .ok_or_else(|| ImageError::Unsupported(format!("{format}: no positioned access")))
    }
}

impl fmt::Debug for OpenImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenImage")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("capability", &self.capability)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

fn require(format: Format, capability: Capability, mask: Capability) -> Result<()> {
    if capability.has(mask) {
        Ok(())
    } else {
        Err(ImageError::NotCapable {
            format: format.name(),
            capability: mask,
        })
    }
}
