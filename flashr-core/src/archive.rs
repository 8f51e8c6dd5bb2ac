//! Archive container access.
//!
//! The zip image variant only needs three things from an archive: its entry
//! list, a stream over one entry, and the full text of small entries. The
//! [`Archive`] trait captures that; [`ZipFileArchive`] implements it with the
//! `zip` crate.

use std::io::{Read, Seek};

use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::{ImageError, Result};

/// Entries larger than this are never read fully into memory as text.
pub const MAX_TEXT_ENTRY: u64 = 16 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub compressed_size: u64,
    pub is_dir: bool,
}

pub trait Archive: Send {
    fn entries(&mut self) -> Result<Vec<ArchiveEntry>>;

    /// Streams the decompressed contents of entry `index`.
    fn open_entry(&mut self, index: usize) -> Result<Box<dyn Read + '_>>;

    /// Reads a small text entry fully.
    fn read_text(&mut self, index: usize) -> Result<String> {
        let mut text = String::new();
        self.open_entry(index)?
            .take(MAX_TEXT_ENTRY)
            .read_to_string(&mut text)?;
        Ok(text)
    }
}

pub struct ZipFileArchive<R> {
    inner: ZipArchive<R>,
}

impl<R: Read + Seek> ZipFileArchive<R> {
    pub fn new(reader: R) -> Result<Self> {
        let inner = ZipArchive::new(reader).map_err(zip_error)?;
        Ok(Self { inner })
    }
}

impl<R: Read + Seek + Send + 'static> Archive for ZipFileArchive<R> {
    fn entries(&mut self) -> Result<Vec<ArchiveEntry>> {
        (0..self.inner.len())
            .map(|index| {
                let file = self.inner.by_index_raw(index).map_err(zip_error)?;
                Ok(ArchiveEntry {
                    index,
                    name: file.name().to_string(),
                    size: file.size(),
                    compressed_size: file.compressed_size(),
                    is_dir: file.is_dir(),
                })
            })
            .collect()
    }

    fn open_entry(&mut self, index: usize) -> Result<Box<dyn Read + '_>> {
        let file = self.inner.by_index(index).map_err(zip_error)?;
        Ok(Box::new(file))
    }
}

fn zip_error(err: ZipError) -> ImageError {
    match err {
        ZipError::Io(e) => ImageError::Io(e),
        ZipError::UnsupportedArchive(what) => ImageError::Unsupported(format!("zip: {what}")),
        other => ImageError::invalid(format!("zip: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in files {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn lists_and_reads_entries() {
        let bytes = archive(&[("a.txt", b"hello"), ("disk.img", &[0u8; 4096])]);
        let mut zip = ZipFileArchive::new(Cursor::new(bytes)).unwrap();
        let entries = zip.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "disk.img");
        assert_eq!(entries[1].size, 4096);
        assert_eq!(zip.read_text(0).unwrap(), "hello");

        let mut data = Vec::new();
        zip.open_entry(1).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data.len(), 4096);
    }

    #[test]
    fn garbage_is_invalid_format() {
        let err = ZipFileArchive::new(Cursor::new(vec![0u8; 64])).err().unwrap();
        assert!(matches!(err, ImageError::InvalidFormat(_)));
    }
}
