use std::fs::{File, OpenOptions as FsOptions};
use std::io::{self, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use tracing::debug;
use xz2::read::XzDecoder;

use super::registry::{self, sniff};
use super::{Backend, OpenOptions, ReadStream};
use crate::capability::Capability;
use crate::error::Result;
use crate::handle::{self, BlockHandle, FileHandle};
use crate::metadata::{self, Metadata};
use crate::os_options::HandleFlags;
use crate::stream::BlockReadStream;

pub(super) const CAPABILITY: Capability = Capability::READ
    .union(Capability::WRITE)
    .union(Capability::READ_STREAM)
    .union(Capability::WRITE_STREAM)
    .union(Capability::WRITE_STREAM_SPARSE)
    .union(Capability::VERIFY)
    .union(Capability::CREATE)
    .union(Capability::CUSTOM_HANDLE);

/// Operations that need the image's bytes to sit uncompressed at their
/// logical offsets.
const POSITIONED: Capability = Capability::READ
    .union(Capability::WRITE)
    .union(Capability::WRITE_STREAM)
    .union(Capability::WRITE_STREAM_SPARSE)
    .union(Capability::VERIFY);

/// Compression a raw image is stored under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "gz" | "gzip" => Some(Self::Gzip),
            "xz" => Some(Self::Xz),
            "zst" | "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        match mime_type {
            "application/gzip" => Some(Self::Gzip),
            "application/x-xz" => Some(Self::Xz),
            "application/zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Gzip => "application/gzip",
            Self::Xz => "application/x-xz",
            Self::Zstd => "application/zstd",
        }
    }

    /// Wraps `reader` in the matching decoder.
    pub fn decoder<'a, R: Read + 'a>(self, reader: R) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Self::Xz => Box::new(XzDecoder::new_multi_decoder(reader)),
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        })
    }
}

/// A plain file, device node or caller-supplied handle holding image bytes,
/// optionally behind a stream compressor.
struct RawImage {
    handle: Box<dyn BlockHandle>,
    compression: Option<Compression>,
    block_size: Option<u32>,
}

/// Detects compression from the extension, then from the leading bytes when
/// the extension is not a known raw one.
fn detect_compression(path: &Path, handle: &mut dyn BlockHandle) -> Result<Option<Compression>> {
    let extension = registry::extension(path);
    if let Some(compression) = extension.as_deref().and_then(Compression::from_extension) {
        return Ok(Some(compression));
    }
    let known_raw = extension
        .as_deref()
        .is_some_and(|ext| super::Format::RawImage.descriptor().extensions.contains(&ext));
    if known_raw {
        return Ok(None);
    }
    let mut head = [0u8; 8];
    let n = handle.read_at(&mut head, 0)?;
    Ok(sniff(&head[..n], &[]).and_then(Compression::from_mime_type))
}

#[cfg(unix)]
fn preferred_block_size(file: &File) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;

    let blksize = file.metadata().ok()?.blksize();
    metadata::power_of_two(u32::try_from(blksize).ok()?)
}

#[cfg(not(unix))]
fn preferred_block_size(_file: &File) -> Option<u32> {
    None
}

pub(super) fn open(
    path: &Path,
    handle: Option<Box<dyn BlockHandle>>,
    options: &OpenOptions,
) -> Result<Box<dyn Backend>> {
    let (mut handle, block_size) = match handle {
        Some(handle) => (handle, None),
        None => {
            let flags = HandleFlags {
                direct: options.direct_io,
                ..HandleFlags::default()
            };
            let file = handle::open_file(path, options.is_writable(), flags)?;
            let block_size = preferred_block_size(&file);
            let mut file_handle = FileHandle::new(file);
            if options.direct_io {
                file_handle = file_handle.with_alignment(block_size.unwrap_or(4096) as usize);
            }
            let handle: Box<dyn BlockHandle> = Box::new(file_handle);
            (handle, block_size)
        }
    };
    let compression = detect_compression(path, handle.as_mut())?;
    debug!(path = %path.display(), ?compression, ?block_size, "raw image handle open");
    Ok(Box::new(RawImage {
        handle,
        compression,
        block_size,
    }))
}

pub(super) fn create(
    path: &Path,
    size: Option<u64>,
    options: &OpenOptions,
) -> Result<Box<dyn Backend>> {
    let mut fs_options = FsOptions::new();
    fs_options.read(true).write(true).create(true).truncate(true);
    let file = fs_options.open(path)?;
    if let Some(size) = size {
        file.set_len(size)?;
    }
    drop(file);
    debug!(path = %path.display(), ?size, "created raw image");
    open(path, None, options)
}

impl Backend for RawImage {
    fn metadata(&mut self) -> Result<Metadata> {
        let len = self.handle.len()?;
        let mut metadata = Metadata {
            block_size: self.block_size,
            ..Metadata::default()
        };
        if self.compression.is_some() {
            metadata.compressed_size = Some(len);
        } else {
            metadata.size = Some(len);
        }
        Ok(metadata)
    }

    fn narrow(&self, capability: Capability, _metadata: &Metadata) -> Capability {
        if self.compression.is_some() {
            capability.withdraw(POSITIONED | Capability::CREATE)
        } else {
            capability
        }
    }

    fn handle(&mut self) -> Option<&mut dyn BlockHandle> {
        // Compressed bytes are not at their logical offsets.
        if self.compression.is_some() {
            return None;
        }
        let handle: &mut dyn BlockHandle = self.handle.as_mut();
        Some(handle)
    }

    fn read_stream(&mut self, metadata: &Metadata, options: &OpenOptions) -> Result<ReadStream<'_>> {
        let block_size = metadata.io_block_size();
        let chunk_size = options.chunk_size.div_ceil(block_size) * block_size;
        let reader = BlockReadStream::new(self.handle.as_mut(), chunk_size);
        let stream: ReadStream<'_> = match self.compression {
            Some(compression) => compression.decoder(reader)?,
            None => Box::new(reader),
        };
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Access, Format, Image};
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn compression_from_names_and_mime_types() {
        assert_eq!(Compression::from_extension(".GZ"), Some(Compression::Gzip));
        assert_eq!(Compression::from_extension("zstd"), Some(Compression::Zstd));
        assert_eq!(Compression::from_extension("img"), None);
        for compression in [Compression::Gzip, Compression::Xz, Compression::Zstd] {
            assert_eq!(
                Compression::from_mime_type(compression.mime_type()),
                Some(compression)
            );
        }
    }

    #[test]
    fn plain_images_report_their_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![3u8; 10_000]).unwrap();

        let mut image = Image::new(&path, Format::RawImage)
            .open(&OpenOptions::new())
            .unwrap();
        assert_eq!(image.metadata().size, Some(10_000));
        assert_eq!(image.metadata().compressed_size, None);

        let mut data = Vec::new();
        image.create_read_stream().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![3u8; 10_000]);
    }

    #[test]
    fn gzip_images_decompress_and_lose_positioned_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img.gz");
        let original: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, gzip(&original)).unwrap();

        let options = OpenOptions::new().access(Access::ReadWrite);
        let mut image = Image::new(&path, Format::RawImage).open(&options).unwrap();
        assert_eq!(image.metadata().size, None);
        assert!(image.metadata().compressed_size.is_some());
        assert!(image.has_capability(Capability::READ_STREAM));
        assert!(!image.has_capability(Capability::READ));
        assert!(!image.has_capability(Capability::WRITE_STREAM));
        assert!(image.create_write_stream().is_err());

        let mut data = Vec::new();
        image.create_read_stream().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn compression_is_sniffed_without_an_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("download");
        std::fs::write(&path, gzip(b"payload")).unwrap();
        let mut image = Image::new(&path, Format::RawImage)
            .open(&OpenOptions::new())
            .unwrap();
        let mut text = String::new();
        image.create_read_stream().unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "payload");
    }

    #[test]
    fn create_sizes_a_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.img");
        std::fs::write(&path, b"stale contents").unwrap();

        let mut image = Image::new(&path, Format::RawImage)
            .create(&OpenOptions::new(), Some(8192))
            .unwrap();
        assert_eq!(image.metadata().size, Some(8192));
        assert!(image.has_capability(Capability::WRITE_STREAM));
        assert_eq!(image.write_at(b"fresh", 0).unwrap(), 5);
        image.close().unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[..5], b"fresh");
        assert!(contents[5..].iter().all(|&b| b == 0));
    }
}
