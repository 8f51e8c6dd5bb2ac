//! Reader for Apple UDIF disk images (`.dmg`).
//!
//! A UDIF file is a data fork of (optionally compressed) chunks, an XML
//! property list and a 512-byte `koly` trailer pointing at both. The
//! property list's `blkx` resources hold base64-encoded `mish` tables that
//! map runs of 512-byte sectors to chunks in the data fork.
//!
//! Zero-fill, raw, ignored and zlib chunks are understood. Any other codec is
//! rejected when the image is opened, so reads never fail halfway on an
//! unsupported chunk.

use std::io::{self, Read, Seek, SeekFrom};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::read::ZlibDecoder;
use roxmltree::{Document, Node, ParsingOptions};
use tracing::{debug, trace};

use crate::block::Block;
use crate::blockmap::BlockMap;
use crate::error::{ImageError, Result};

pub const KOLY_SIGNATURE: &[u8] = b"koly";
pub const SECTOR_SIZE: u64 = 512;

const KOLY_LEN: u64 = 512;
const MISH_SIGNATURE: &[u8] = b"mish";
const MISH_HEADER_LEN: usize = 204;
const MISH_ENTRY_LEN: usize = 40;
const MAX_PLIST_LEN: u64 = 64 * 1024 * 1024;
/// Largest decoded chunk that is buffered whole. hdiutil writes at most
/// 2048 sectors per data chunk.
const MAX_CHUNK_LEN: u64 = 8 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    Zero,
    Raw,
    Ignore,
    Zlib,
}

impl ChunkKind {
    fn from_code(code: u32) -> Result<Option<Self>> {
        let kind = match code {
            0x0000_0000 => Self::Zero,
            0x0000_0001 => Self::Raw,
            0x0000_0002 => Self::Ignore,
            0x8000_0005 => Self::Zlib,
            // Comments and the table terminator carry no data.
            0x7fff_fffe | 0xffff_ffff => return Ok(None),
            0x8000_0004 => return Err(unsupported("ADC")),
            0x8000_0006 => return Err(unsupported("bzip2")),
            0x8000_0007 => return Err(unsupported("LZFSE")),
            0x8000_0008 => return Err(unsupported("LZMA")),
            other => {
                return Err(ImageError::invalid(format!(
                    "udif: unknown chunk type {other:#010x}"
                )));
            }
        };
        Ok(Some(kind))
    }

    /// Whether the chunk's sectors hold data (as opposed to reading as zero).
    pub fn is_allocated(self) -> bool {
        matches!(self, Self::Raw | Self::Zlib)
    }
}

fn unsupported(codec: &str) -> ImageError {
    ImageError::Unsupported(format!("udif: {codec} compressed chunks"))
}

/// A run of sectors, in bytes, and where its encoded data lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub kind: ChunkKind,
    pub position: u64,
    pub length: u64,
    pub data_offset: u64,
    pub data_length: u64,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.position + self.length
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Koly {
    data_fork_offset: u64,
    xml_offset: u64,
    xml_length: u64,
    sector_count: u64,
}

impl Koly {
    fn parse(trailer: &[u8]) -> Result<Self> {
        if !trailer.starts_with(KOLY_SIGNATURE) || trailer.len() < KOLY_LEN as usize {
            return Err(ImageError::invalid("udif: missing koly trailer"));
        }
        Ok(Self {
            data_fork_offset: be_u64(trailer, 24),
            xml_offset: be_u64(trailer, 216),
            xml_length: be_u64(trailer, 224),
            sector_count: be_u64(trailer, 492),
        })
    }
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

fn be_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

fn overflow() -> ImageError {
    ImageError::invalid("udif: chunk table offsets overflow")
}

fn sectors(count: u64) -> Result<u64> {
    count.checked_mul(SECTOR_SIZE).ok_or_else(overflow)
}

/// Decodes one `mish` table into absolute chunks.
fn parse_mish(table: &[u8], data_fork_offset: u64) -> Result<Vec<Chunk>> {
    if table.len() < MISH_HEADER_LEN || !table.starts_with(MISH_SIGNATURE) {
        return Err(ImageError::invalid("udif: malformed mish table"));
    }
    let first_sector = be_u64(table, 8);
    let data_offset = be_u64(table, 24);
    let count = be_u32(table, 200) as usize;
    if table.len() < MISH_HEADER_LEN + count * MISH_ENTRY_LEN {
        return Err(ImageError::invalid("udif: truncated mish table"));
    }

    let base = data_fork_offset.checked_add(data_offset).ok_or_else(overflow)?;
    let mut chunks = Vec::with_capacity(count);
    for entry in table[MISH_HEADER_LEN..]
        .chunks_exact(MISH_ENTRY_LEN)
        .take(count)
    {
        let Some(kind) = ChunkKind::from_code(be_u32(entry, 0))? else {
            continue;
        };
        let sector_count = be_u64(entry, 16);
        if sector_count == 0 {
            continue;
        }
        let sector = first_sector.checked_add(be_u64(entry, 8)).ok_or_else(overflow)?;
        let length = sectors(sector_count)?;
        if kind.is_allocated() && length > MAX_CHUNK_LEN {
            return Err(ImageError::invalid(format!(
                "udif: chunk of {length} bytes exceeds {MAX_CHUNK_LEN}"
            )));
        }
        chunks.push(Chunk {
            kind,
            position: sectors(sector)?,
            length,
            data_offset: base.checked_add(be_u64(entry, 24)).ok_or_else(overflow)?,
            data_length: be_u64(entry, 32),
        });
    }
    Ok(chunks)
}

fn element_text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

/// Extracts the decoded `Data` blobs of every `blkx` resource.
fn blkx_tables(plist: &str) -> Result<Vec<Vec<u8>>> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let doc = Document::parse_with_options(plist, options)
        .map_err(|e| ImageError::invalid(format!("udif: property list: {e}")))?;
    let array = doc
        .descendants()
        .find(|n| n.has_tag_name("key") && element_text(*n) == "blkx")
        .and_then(|key| key.next_sibling_element())
        .filter(|n| n.has_tag_name("array"))
        .ok_or_else(|| ImageError::invalid("udif: no blkx resources"))?;

    array
        .children()
        .filter(|n| n.has_tag_name("dict"))
        .map(|dict| {
            let data = dict
                .children()
                .filter(|n| n.has_tag_name("key") && element_text(*n) == "Data")
                .find_map(|key| key.next_sibling_element())
                .filter(|n| n.has_tag_name("data"))
                .ok_or_else(|| ImageError::invalid("udif: blkx entry without Data"))?;
            let encoded: String = element_text(data)
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            STANDARD
                .decode(encoded)
                .map_err(|e| ImageError::invalid(format!("udif: blkx data: {e}")))
        })
        .collect()
}

/// An opened UDIF image.
pub struct UdifImage<R> {
    reader: R,
    chunks: Vec<Chunk>,
    size: u64,
}

impl<R: Read + Seek> UdifImage<R> {
    /// Reads the trailer and chunk tables.
    pub fn open(mut reader: R) -> Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        if len < KOLY_LEN {
            return Err(ImageError::invalid("udif: file too short for a koly trailer"));
        }
        let mut trailer = [0u8; KOLY_LEN as usize];
        reader.seek(SeekFrom::Start(len - KOLY_LEN))?;
        reader.read_exact(&mut trailer)?;
        let koly = Koly::parse(&trailer)?;

        let xml_end = koly.xml_offset.checked_add(koly.xml_length);
        if koly.xml_length == 0
            || koly.xml_length > MAX_PLIST_LEN
            || xml_end.is_none_or(|end| end > len)
        {
            return Err(ImageError::invalid("udif: property list out of bounds"));
        }
        let mut plist = vec![0u8; koly.xml_length as usize];
        reader.seek(SeekFrom::Start(koly.xml_offset))?;
        reader.read_exact(&mut plist)?;
        let plist = String::from_utf8(plist)
            .map_err(|_| ImageError::invalid("udif: property list is not UTF-8"))?;

        let mut chunks = Vec::new();
        for table in blkx_tables(&plist)? {
            chunks.extend(parse_mish(&table, koly.data_fork_offset)?);
        }
        chunks.sort_by_key(|chunk| chunk.position);
        if let Some(pair) = chunks.windows(2).find(|pair| pair[0].end() > pair[1].position) {
            return Err(ImageError::invalid(format!(
                "udif: chunks overlap at offset {}",
                pair[1].position
            )));
        }

        let extent = chunks.last().map_or(0, Chunk::end);
        let size = match koly.sector_count {
            0 => extent,
            count => sectors(count)?,
        };
        if extent > size {
            return Err(ImageError::invalid(format!(
                "udif: chunks extend to {extent} past the image size {size}"
            )));
        }
        debug!(size, chunks = chunks.len(), "opened udif image");
        Ok(Self {
            reader,
            chunks,
            size,
        })
    }

    /// Uncompressed size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Bytes the chunks occupy in the data fork.
    pub fn encoded_size(&self) -> u64 {
        self.chunks
            .iter()
            .fold(0u64, |sum, chunk| sum.saturating_add(chunk.data_length))
    }

    /// Allocated regions: every raw or compressed chunk.
    pub fn block_map(&self) -> Result<BlockMap> {
        let mut map = BlockMap::new(self.size, SECTOR_SIZE)?;
        for chunk in self.chunks.iter().filter(|c| c.kind.is_allocated()) {
            map.insert(chunk.position, chunk.end())?;
        }
        Ok(map)
    }

    /// A dense reader over the whole logical image.
    pub fn reader(&mut self) -> UdifReader<'_, R> {
        UdifReader {
            image: self,
            position: 0,
            index: 0,
            pending: Vec::new(),
            pending_offset: 0,
        }
    }

    /// The allocated chunks as positioned blocks.
    pub fn sparse_blocks(&mut self) -> SparseBlocks<'_, R> {
        SparseBlocks {
            image: self,
            index: 0,
        }
    }

    fn decode(&mut self, index: usize) -> Result<Vec<u8>> {
        let chunk = &self.chunks[index];
        let (kind, length, data_offset, data_length) =
            (chunk.kind, chunk.length, chunk.data_offset, chunk.data_length);
        trace!(?kind, position = chunk.position, length, "decoding chunk");
        if !kind.is_allocated() {
            return Err(ImageError::invalid("udif: unallocated chunks hold no data"));
        }

        self.reader.seek(SeekFrom::Start(data_offset))?;
        let encoded = (&mut self.reader).take(data_length);
        let mut data = Vec::with_capacity(length as usize);
        match kind {
            ChunkKind::Zlib => {
                ZlibDecoder::new(encoded).take(length).read_to_end(&mut data)?;
            }
            _ => {
                encoded.take(length).read_to_end(&mut data)?;
            }
        }
        if data.len() as u64 != length {
            return Err(ImageError::invalid(format!(
                "udif: chunk at offset {} decoded to {} of {length} bytes",
                self.chunks[index].position,
                data.len()
            )));
        }
        Ok(data)
    }
}

/// See [`UdifImage::reader`].
pub struct UdifReader<'a, R> {
    image: &'a mut UdifImage<R>,
    position: u64,
    index: usize,
    pending: Vec<u8>,
    pending_offset: usize,
}

impl<R: Read + Seek> Read for UdifReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pending_offset < self.pending.len() {
                let available = &self.pending[self.pending_offset..];
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                self.pending_offset += n;
                return Ok(n);
            }
            if self.position >= self.image.size {
                return Ok(0);
            }

            let chunks = &self.image.chunks;
            while self.index < chunks.len() && chunks[self.index].end() <= self.position {
                self.index += 1;
            }

            // Sectors no chunk describes, and unallocated chunks, read as zero.
            let (zero_until, load) = match chunks.get(self.index) {
                Some(chunk) if chunk.position <= self.position => {
                    (chunk.end(), chunk.kind.is_allocated().then_some(chunk.position))
                }
                Some(chunk) => (chunk.position, None),
                None => (self.image.size, None),
            };
            if let Some(chunk_position) = load {
                self.pending = self.image.decode(self.index).map_err(ImageError::into_io)?;
                self.pending_offset = (self.position - chunk_position) as usize;
                self.position = zero_until;
                continue;
            }
            let n = ((zero_until - self.position) as usize).min(buf.len());
            buf[..n].fill(0);
            self.position += n as u64;
            return Ok(n);
        }
    }
}

/// See [`UdifImage::sparse_blocks`].
pub struct SparseBlocks<'a, R> {
    image: &'a mut UdifImage<R>,
    index: usize,
}

impl<R: Read + Seek> Iterator for SparseBlocks<'_, R> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.image.chunks.len() {
            let index = self.index;
            self.index += 1;
            let chunk = &self.image.chunks[index];
            if !chunk.kind.is_allocated() {
                continue;
            }
            let position = chunk.position;
            return Some(
                self.image
                    .decode(index)
                    .map(|data| Block::new(data, position)),
            );
        }
        None
    }
}
