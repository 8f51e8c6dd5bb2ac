use std::io::BufReader;
use std::path::Path;

use tracing::{debug, warn};

use super::{Backend, Format, OpenOptions, ReadStream, SparseReadStream};
use crate::archive::{Archive, ArchiveEntry, ZipFileArchive};
use crate::blockmap::{self, FilterStream};
use crate::capability::Capability;
use crate::error::{ImageError, Result};
use crate::handle::{self, BlockHandle};
use crate::metadata::Metadata;
use crate::os_options::HandleFlags;

pub(super) const CAPABILITY: Capability =
    Capability::READ_STREAM.union(Capability::READ_STREAM_SPARSE);

const MANIFEST: &str = ".meta/manifest.json";
const BMAP: &str = ".meta/image.bmap";
const LOGO: &str = ".meta/logo.svg";

/// A zip archive carrying exactly one raw image plus optional metadata files.
struct ZipImage {
    archive: Box<dyn Archive>,
    image_entry: Option<usize>,
}

pub(super) fn open(
    path: &Path,
    _handle: Option<Box<dyn BlockHandle>>,
    _options: &OpenOptions,
) -> Result<Box<dyn Backend>> {
    let file = handle::open_file(path, false, HandleFlags::default())?;
    let archive = ZipFileArchive::new(BufReader::new(file))?;
    Ok(Box::new(ZipImage::new(Box::new(archive))))
}

fn is_image_file(name: &str) -> bool {
    let extension = super::registry::extension(Path::new(name));
    extension.is_some_and(|ext| Format::RawImage.descriptor().extensions.contains(&ext.as_str()))
}

impl ZipImage {
    fn new(archive: Box<dyn Archive>) -> Self {
        Self {
            archive,
            image_entry: None,
        }
    }

    fn find_image(entries: &[ArchiveEntry]) -> Result<&ArchiveEntry> {
        let mut images = entries
            .iter()
            .filter(|entry| !entry.is_dir && is_image_file(&entry.name));
        let image = images
            .next()
            .ok_or_else(|| ImageError::invalid("archive holds no flashable image"))?;
        if let Some(other) = images.next() {
            return Err(ImageError::invalid(format!(
                "archive holds more than one image: {} and {}",
                image.name, other.name
            )));
        }
        Ok(image)
    }

    fn load_metadata_file(&mut self, entry: &ArchiveEntry, metadata: &mut Metadata) -> Result<()> {
        let name = entry.name.to_ascii_lowercase();
        if name.ends_with(MANIFEST) {
            let text = self.archive.read_text(entry.index)?;
            let manifest = serde_json::from_str(&text)
                .map_err(|e| ImageError::invalid(format!("{}: {e}", entry.name)))?;
            metadata.manifest = Some(manifest);
        } else if name.ends_with(BMAP) {
            let text = self.archive.read_text(entry.index)?;
            metadata.block_map = Some(blockmap::parse(&text)?);
        } else if name.ends_with(LOGO) {
            match self.archive.read_text(entry.index) {
                Ok(logo) => metadata.logo = Some(logo),
                Err(e) => warn!(entry = %entry.name, error = %e, "discarding unreadable logo"),
            }
        }
        Ok(())
    }
}

impl Backend for ZipImage {
    fn metadata(&mut self) -> Result<Metadata> {
        let entries = self.archive.entries()?;
        let image = Self::find_image(&entries)?;
        let mut metadata = Metadata {
            size: Some(image.size),
            compressed_size: Some(image.compressed_size),
            ..Metadata::default()
        };
        let image_index = image.index;
        let image_size = image.size;

        for entry in entries.iter().filter(|entry| !entry.is_dir) {
            self.load_metadata_file(entry, &mut metadata)?;
        }

        if let Some(map) = &metadata.block_map {
            if map.image_size() != image_size {
                return Err(ImageError::invalid(format!(
                    "block-map describes {} bytes but the image holds {image_size}",
                    map.image_size()
                )));
            }
        }

        debug!(
            entry = %entries[image_index].name,
            size = image_size,
            manifest = metadata.manifest.is_some(),
            block_map = metadata.block_map.is_some(),
            logo = metadata.logo.is_some(),
            "zip metadata"
        );
        self.image_entry = Some(image_index);
        Ok(metadata)
    }

    fn narrow(&self, capability: Capability, metadata: &Metadata) -> Capability {
        if metadata.block_map.is_none() {
            capability.withdraw(Capability::READ_STREAM_SPARSE)
        } else {
            capability
        }
    }

    fn read_stream(&mut self, _metadata: &Metadata, _options: &OpenOptions) -> Result<ReadStream<'_>> {
        let index = self
            .image_entry
            .ok_or_else(|| ImageError::invalid("archive image entry not located"))?;
        self.archive.open_entry(index)
    }

    fn sparse_read_stream(
        &mut self,
        metadata: &Metadata,
        options: &OpenOptions,
    ) -> Result<SparseReadStream<'_>> {
        let map = metadata
            .block_map
            .clone()
            .ok_or_else(|| ImageError::Unsupported("archive has no block-map".into()))?;
        let reader = self.read_stream(metadata, options)?;
        Ok(Box::new(
            FilterStream::new(reader, map)
                .with_chunk_size(options.chunk_size)
                .with_verify(options.verify_checksums),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::path::PathBuf;

    use ::zip::write::SimpleFileOptions;
    use ::zip::{CompressionMethod, ZipWriter};

    const B: usize = 4096;

    const BMAP_MIDDLE: &str = r#"<?xml version="1.0" ?>
<bmap version="1.4">
    <ImageSize> 12288 </ImageSize>
    <BlockSize> 4096 </BlockSize>
    <BlocksCount> 3 </BlocksCount>
    <MappedBlocksCount> 1 </MappedBlocksCount>
    <BlockMap>
        <Range> 1 </Range>
    </BlockMap>
</bmap>
"#;

    fn disk() -> Vec<u8> {
        let mut disk = vec![0u8; 3 * B];
        disk[B..2 * B].fill(0xc3);
        disk
    }

    fn write_zip(dir: &Path, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("image.zip");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, data) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    fn open(path: &Path) -> Result<crate::image::OpenImage> {
        Image::from_path(path)?.open(&OpenOptions::new())
    }

    #[test]
    fn loads_embedded_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk();
        let path = write_zip(
            dir.path(),
            &[
                ("os.img", disk.as_slice()),
                ("os.meta/manifest.json", br#"{"name":"Demo OS","version":"1.0"}"#.as_slice()),
                ("os.meta/image.bmap", BMAP_MIDDLE.as_bytes()),
                ("os.meta/logo.svg", b"<svg/>".as_slice()),
            ],
        );

        let mut image = open(&path).unwrap();
        assert_eq!(image.format(), Format::ZipArchive);
        let metadata = image.metadata().clone();
        assert_eq!(metadata.size, Some(3 * B as u64));
        assert!(metadata.compressed_size.unwrap() < 3 * B as u64);
        assert_eq!(metadata.manifest.unwrap()["name"], "Demo OS");
        assert_eq!(metadata.logo.as_deref(), Some("<svg/>"));
        assert!(image.has_capability(Capability::READ_STREAM_SPARSE));

        let blocks: Vec<_> = image
            .create_sparse_read_stream()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].position, B as u64);
        assert!(blocks[0].data.iter().all(|&b| b == 0xc3));

        let mut dense = Vec::new();
        image.create_read_stream().unwrap().read_to_end(&mut dense).unwrap();
        assert_eq!(dense, disk);
    }

    #[test]
    fn no_block_map_withdraws_sparse_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), &[("os.img", disk().as_slice())]);
        let image = open(&path).unwrap();
        assert!(Format::ZipArchive.descriptor().capability.has(Capability::READ_STREAM_SPARSE));
        assert!(!image.has_capability(Capability::READ_STREAM_SPARSE));
        assert!(image.has_capability(Capability::READ_STREAM));
    }

    #[test]
    fn exactly_one_image_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let two = write_zip(dir.path(), &[("a.img", b"a".as_slice()), ("b.iso", b"b".as_slice())]);
        assert!(matches!(open(&two), Err(ImageError::InvalidFormat(_))));

        let none = write_zip(dir.path(), &[("readme.txt", b"hi".as_slice())]);
        assert!(matches!(open(&none), Err(ImageError::InvalidFormat(_))));
    }

    #[test]
    fn corrupt_primary_metadata_fails_the_open() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk();
        let manifest = write_zip(
            dir.path(),
            &[("os.img", disk.as_slice()), ("os.meta/manifest.json", b"{not json".as_slice())],
        );
        assert!(matches!(open(&manifest), Err(ImageError::InvalidFormat(_))));

        let short_image = write_zip(
            dir.path(),
            &[("os.img", &disk[..B]), ("os.meta/image.bmap", BMAP_MIDDLE.as_bytes())],
        );
        assert!(matches!(open(&short_image), Err(ImageError::InvalidFormat(_))));
    }
}
