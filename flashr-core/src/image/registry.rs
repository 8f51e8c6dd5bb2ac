//! The format registry and path resolution.
//!
//! The registry is a static table, read-only for the life of the process.
//! Resolving a path follows a fixed precedence:
//!
//! 1. Paths that look like network sources (`scheme:...`, `*.torrent`) are
//!    rejected.
//! 2. Block devices resolve to [`Format::BlockDevice`] and character devices
//!    to [`Format::RawImage`], whatever their name.
//! 3. The extension (the inner one for `disk.img.xz`) selects the format.
//! 4. Otherwise the leading and trailing bytes are sniffed for a known
//!    signature, which selects a format by MIME type.
//!
//! No match, or more than one, is an error.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::LazyLock;

use tracing::debug;

use super::{Backend, OpenOptions, blockdevice, dmg, raw, zip};
use crate::capability::Capability;
use crate::error::{ImageError, Result};
use crate::handle::BlockHandle;

pub(crate) type OpenFn =
    fn(&Path, Option<Box<dyn BlockHandle>>, &OpenOptions) -> Result<Box<dyn Backend>>;
pub(crate) type CreateFn = fn(&Path, Option<u64>, &OpenOptions) -> Result<Box<dyn Backend>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    BlockDevice,
    RawImage,
    ZipArchive,
    AppleDmg,
}

impl Format {
    pub fn descriptor(self) -> &'static FormatDescriptor {
        match self {
            Format::BlockDevice => &FORMATS[0],
            Format::RawImage => &FORMATS[1],
            Format::ZipArchive => &FORMATS[2],
            Format::AppleDmg => &FORMATS[3],
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static declaration of one image format.
pub struct FormatDescriptor {
    pub format: Format,
    pub name: &'static str,
    pub mime_types: &'static [&'static str],
    /// Extensions, without the leading dot.
    pub extensions: &'static [&'static str],
    /// MIME types of compression schemes the format reads through.
    pub compression_schemes: &'static [&'static str],
    pub compressed_extensions: &'static [&'static str],
    pub default_extension: Option<&'static str>,
    /// Capabilities before any image is opened.
    pub capability: Capability,
    pub(crate) open: OpenFn,
    pub(crate) create: Option<CreateFn>,
}

impl fmt::Debug for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatDescriptor")
            .field("format", &self.format)
            .field("mime_types", &self.mime_types)
            .field("extensions", &self.extensions)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

static FORMATS: [FormatDescriptor; 4] = [
    FormatDescriptor {
        format: Format::BlockDevice,
        name: "block-device",
        mime_types: &[],
        extensions: &[],
        compression_schemes: &[],
        compressed_extensions: &[],
        default_extension: None,
        capability: blockdevice::CAPABILITY,
        open: blockdevice::open,
        create: None,
    },
    FormatDescriptor {
        format: Format::RawImage,
        name: "raw-image",
        mime_types: &["application/octet-stream", "application/x-iso9660-image"],
        extensions: &["img", "bin", "raw", "iso", "hddimg", "sdcard", "rpi-sdimg", "dsk"],
        compression_schemes: &["application/gzip", "application/x-xz", "application/zstd"],
        compressed_extensions: &["gz", "gzip", "xz", "zst", "zstd"],
        default_extension: Some("img"),
        capability: raw::CAPABILITY,
        open: raw::open,
        create: Some(raw::create),
    },
    FormatDescriptor {
        format: Format::ZipArchive,
        name: "zip-archive",
        mime_types: &["application/zip"],
        extensions: &["zip", "etch"],
        compression_schemes: &[],
        compressed_extensions: &[],
        default_extension: Some("zip"),
        capability: zip::CAPABILITY,
        open: zip::open,
        create: None,
    },
    FormatDescriptor {
        format: Format::AppleDmg,
        name: "apple-dmg",
        mime_types: &["application/x-apple-diskimage"],
        extensions: &["dmg"],
        compression_schemes: &[],
        compressed_extensions: &[],
        default_extension: Some("dmg"),
        capability: dmg::CAPABILITY,
        open: dmg::open,
        create: None,
    },
];

pub fn formats() -> &'static [FormatDescriptor] {
    &FORMATS
}

fn collect(field: fn(&FormatDescriptor) -> &'static [&'static str]) -> Vec<&'static str> {
    let mut values: Vec<&'static str> = Vec::new();
    for value in FORMATS.iter().flat_map(field) {
        if !values.contains(value) {
            values.push(*value);
        }
    }
    values
}

static EXTENSIONS: LazyLock<Vec<&'static str>> = LazyLock::new(|| collect(|f| f.extensions));
static MIME_TYPES: LazyLock<Vec<&'static str>> = LazyLock::new(|| collect(|f| f.mime_types));
static COMPRESSION_SCHEMES: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| collect(|f| f.compression_schemes));
static COMPRESSED_EXTENSIONS: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| collect(|f| f.compressed_extensions));

pub fn supported_extensions() -> &'static [&'static str] {
    &EXTENSIONS
}

pub fn supported_mime_types() -> &'static [&'static str] {
    &MIME_TYPES
}

pub fn supported_compression_schemes() -> &'static [&'static str] {
    &COMPRESSION_SCHEMES
}

pub fn supported_compressed_extensions() -> &'static [&'static str] {
    &COMPRESSED_EXTENSIONS
}

/// Returns `true` when the path's extension names a supported compression.
pub fn is_compressed(path: &Path) -> bool {
    extension(path).is_some_and(|ext| COMPRESSED_EXTENSIONS.contains(&ext.as_str()))
}

/// Lower-cased extension without the dot.
pub(crate) fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn is_network(path: &Path) -> bool {
    let text = path.to_string_lossy();
    // Single letters are Windows drive prefixes, not schemes.
    let scheme = text.split_once(':').is_some_and(|(scheme, _)| {
        scheme.len() > 1
            && scheme
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    });
    scheme || extension(path).as_deref() == Some("torrent")
}

fn unique(candidates: Vec<Format>, what: impl fmt::Display) -> Result<Option<Format>> {
    match candidates.as_slice() {
        [] => Ok(None),
        [format] => Ok(Some(*format)),
        many => Err(ImageError::Unsupported(format!(
            "{what} is ambiguous between {many:?}"
        ))),
    }
}

/// Selects the format declaring `extension`.
pub fn by_extension(extension: &str) -> Result<Option<Format>> {
    let extension = extension.trim_start_matches('.').to_ascii_lowercase();
    let candidates = FORMATS
        .iter()
        .filter(|f| f.extensions.contains(&extension.as_str()))
        .map(|f| f.format)
        .collect();
    unique(candidates, format_args!("extension .{extension}"))
}

/// Selects the format declaring `mime_type`, either as its own type or as a
/// compression scheme it reads through.
pub fn by_mime_type(mime_type: &str) -> Result<Option<Format>> {
    let candidates = FORMATS
        .iter()
        .filter(|f| f.mime_types.contains(&mime_type) || f.compression_schemes.contains(&mime_type))
        .map(|f| f.format)
        .collect();
    unique(candidates, format_args!("MIME type {mime_type}"))
}

fn by_path_extension(path: &Path) -> Result<Option<Format>> {
    let Some(outer) = extension(path) else {
        return Ok(None);
    };
    if !COMPRESSED_EXTENSIONS.contains(&outer.as_str()) {
        return by_extension(&outer);
    }

    let inner = path.file_stem().map(Path::new).and_then(extension);
    let candidates = FORMATS
        .iter()
        .filter(|f| f.compressed_extensions.contains(&outer.as_str()))
        .filter(|f| {
            inner
                .as_deref()
                .is_none_or(|inner| f.extensions.contains(&inner))
        })
        .map(|f| f.format)
        .collect();
    unique(candidates, format_args!("{}", path.display()))
}

#[cfg(unix)]
fn device_format(meta: &fs::Metadata) -> Option<Format> {
    use std::os::unix::fs::FileTypeExt;

    let file_type = meta.file_type();
    if file_type.is_block_device() {
        Some(Format::BlockDevice)
    } else if file_type.is_char_device() {
        // `/dev/zero` and friends stream like raw images.
        Some(Format::RawImage)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn device_format(_meta: &fs::Metadata) -> Option<Format> {
    None
}

/// Maps `path` to the format that handles it.
pub fn resolve(path: &Path) -> Result<Format> {
    if is_network(path) {
        return Err(ImageError::Unsupported(format!(
            "network sources are not supported: {}",
            path.display()
        )));
    }

    let meta = fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ImageError::NotFound(path.display().to_string()),
        _ => ImageError::Io(e),
    })?;
    if let Some(format) = device_format(&meta) {
        debug!(path = %path.display(), %format, "resolved device node");
        return Ok(format);
    }

    if let Some(format) = by_path_extension(path)? {
        debug!(path = %path.display(), %format, "resolved by extension");
        return Ok(format);
    }

    let mime_type = sniff_file(path)?.ok_or_else(|| {
        ImageError::Unsupported(format!("unrecognised image format: {}", path.display()))
    })?;
    let format = by_mime_type(mime_type)?.ok_or_else(|| {
        ImageError::Unsupported(format!("{mime_type} is not a supported image type"))
    })?;
    debug!(path = %path.display(), mime_type, %format, "resolved by content");
    Ok(format)
}

/// Bytes read from the start of a file; covers the ISO 9660 volume
/// descriptor at 0x8001.
const SNIFF_HEAD: u64 = 0x8006;
const SNIFF_TAIL: u64 = 512;

fn sniff_file(path: &Path) -> Result<Option<&'static str>> {
    let mut file = File::open(path)?;
    let mut head = Vec::new();
    (&mut file).take(SNIFF_HEAD).read_to_end(&mut head)?;

    let len = file.metadata()?.len();
    let mut tail = Vec::new();
    if len >= SNIFF_TAIL {
        file.seek(SeekFrom::Start(len - SNIFF_TAIL))?;
        file.take(SNIFF_TAIL).read_to_end(&mut tail)?;
    }
    Ok(sniff(&head, &tail))
}

/// Guesses a MIME type from a file's first bytes and its last 512 bytes.
pub fn sniff(head: &[u8], tail: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
        (b"\xfd7zXZ\x00", "application/x-xz"),
        (b"\x28\xb5\x2f\xfd", "application/zstd"),
        (b"BZh", "application/x-bzip2"),
    ];

    if let Some((_, mime)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return Some(*mime);
    }
    if tail.starts_with(crate::udif::KOLY_SIGNATURE) {
        return Some("application/x-apple-diskimage");
    }
    if head.get(0x8001..0x8006) == Some(b"CD001".as_slice()) {
        return Some("application/x-iso9660-image");
    }
    if head.get(510..512) == Some([0x55, 0xaa].as_slice()) {
        // A partition table; the image is a raw disk.
        return Some("application/octet-stream");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn extensions_select_formats() {
        assert_eq!(by_extension(".img").unwrap(), Some(Format::RawImage));
        assert_eq!(by_extension("DMG").unwrap(), Some(Format::AppleDmg));
        assert_eq!(by_extension("etch").unwrap(), Some(Format::ZipArchive));
        assert_eq!(by_extension("txt").unwrap(), None);
    }

    #[test]
    fn compressed_paths_use_the_inner_extension() {
        assert_eq!(
            by_path_extension(Path::new("disk.img.xz")).unwrap(),
            Some(Format::RawImage)
        );
        assert_eq!(
            by_path_extension(Path::new("disk.gz")).unwrap(),
            Some(Format::RawImage)
        );
        assert_eq!(by_path_extension(Path::new("disk.zip.gz")).unwrap(), None);
        assert!(is_compressed(Path::new("a.iso.zst")));
        assert!(!is_compressed(Path::new("a.iso")));
    }

    #[test]
    fn network_paths_are_rejected() {
        for path in ["http://example.com/a.img", "s3:bucket/a.img", "a.torrent"] {
            assert!(matches!(
                resolve(Path::new(path)),
                Err(ImageError::Unsupported(_))
            ));
        }
        assert!(!is_network(Path::new("C:\\images\\a.img")));
    }

    #[test]
    fn missing_files_are_not_found() {
        assert!(matches!(
            resolve(Path::new("/nonexistent/flashr/a.img")),
            Err(ImageError::NotFound(_))
        ));
    }

    #[test]
    fn sniffing_recognises_signatures() {
        assert_eq!(sniff(b"PK\x03\x04rest", &[]), Some("application/zip"));
        assert_eq!(sniff(b"\xfd7zXZ\x00\x00", &[]), Some("application/x-xz"));
        assert_eq!(sniff(b"", b"koly\x00\x00\x00\x04"), Some("application/x-apple-diskimage"));

        let mut iso = vec![0u8; 0x8006];
        iso[0x8001..0x8006].copy_from_slice(b"CD001");
        assert_eq!(sniff(&iso, &[]), Some("application/x-iso9660-image"));
        assert_eq!(sniff(&[0u8; 64], &[]), None);
    }

    #[test]
    fn content_resolves_extensionless_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("download");
        let mut file = File::create(&path).unwrap();
        let mut mbr = vec![0u8; 4096];
        mbr[510] = 0x55;
        mbr[511] = 0xaa;
        file.write_all(&mbr).unwrap();
        assert_eq!(resolve(&path).unwrap(), Format::RawImage);

        let unknown = dir.path().join("notes");
        fs::write(&unknown, b"just some text").unwrap();
        assert!(matches!(resolve(&unknown), Err(ImageError::Unsupported(_))));

        let bzip = dir.path().join("archive");
        fs::write(&bzip, b"BZh91AY&SY").unwrap();
        assert!(matches!(resolve(&bzip), Err(ImageError::Unsupported(_))));
    }

    #[test]
    fn registry_queries_are_deduplicated() {
        assert!(supported_extensions().contains(&"rpi-sdimg"));
        assert!(supported_mime_types().contains(&"application/x-apple-diskimage"));
        assert_eq!(supported_compressed_extensions().len(), 5);
        assert_eq!(supported_compression_schemes().len(), 3);
        for descriptor in formats() {
            assert_eq!(descriptor.format.descriptor().name, descriptor.name);
        }
    }
}
