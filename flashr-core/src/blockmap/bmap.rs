//! Parser for the bmaptool XML block-map format.
//!
//! ```xml
//! <bmap version="2.0">
//!     <ImageSize> 821752 </ImageSize>
//!     <BlockSize> 4096 </BlockSize>
//!     <BlocksCount> 201 </BlocksCount>
//!     <MappedBlocksCount> 117 </MappedBlocksCount>
//!     <ChecksumType> sha256 </ChecksumType>
//!     <BmapFileChecksum> 4310fd... </BmapFileChecksum>
//!     <BlockMap>
//!         <Range chksum="9eaf19..."> 0-1 </Range>
//!         <Range chksum="e8a26f..."> 3 </Range>
//!     </BlockMap>
//! </bmap>
//! ```

use roxmltree::{Document, Node};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{BlockMap, ChecksumType};
use crate::error::{ImageError, Result};

/// Parses a bmap document into a [`BlockMap`].
///
/// Header counts are cross-checked against the ranges, and a SHA-256
/// `BmapFileChecksum` is verified against the document itself.
pub fn parse(text: &str) -> Result<BlockMap> {
    let doc = Document::parse(text).map_err(|e| ImageError::invalid(format!("bmap: {e}")))?;
    let root = doc.root_element();
    if !root.has_tag_name("bmap") {
        return Err(ImageError::invalid(format!(
            "bmap: unexpected root element <{}>",
            root.tag_name().name()
        )));
    }
    let version = root.attribute("version").unwrap_or("");

    let image_size = number(&root, "ImageSize")?;
    let block_size = number(&root, "BlockSize")?;
    let blocks_count = number(&root, "BlocksCount")?;
    let mapped_blocks_count = number(&root, "MappedBlocksCount")?;

    let checksum_type = match child_text(&root, "ChecksumType") {
        Some(name) if name.eq_ignore_ascii_case("sha256") => Some(ChecksumType::Sha256),
        Some(name) => Some(ChecksumType::Other(name.to_ascii_lowercase())),
        // Version 1.3 and earlier carry SHA-1 range checksums without a type element.
        None => Some(ChecksumType::Other("sha1".to_owned())),
    };

    if let (Some(ChecksumType::Sha256), Some(expected)) =
        (&checksum_type, child_text(&root, "BmapFileChecksum"))
    {
        verify_file_checksum(text, expected)?;
    }

    let mut map = BlockMap::new(image_size, block_size)?;
    if map.blocks_count() != blocks_count {
        return Err(ImageError::invalid(format!(
            "bmap: BlocksCount {blocks_count} does not match image size {image_size} / block size {block_size}"
        )));
    }
    if let Some(ty) = checksum_type {
        map = map.with_checksum_type(ty);
    }

    let block_map = root
        .children()
        .find(|n| n.has_tag_name("BlockMap"))
        .ok_or_else(|| ImageError::invalid("bmap: missing <BlockMap>"))?;

    for range in block_map.children().filter(|n| n.has_tag_name("Range")) {
        let text = range.text().unwrap_or("").trim();
        let (first, last) = match text.split_once('-') {
            Some((first, last)) => (parse_u64(first)?, parse_u64(last)?),
            None => {
                let block = parse_u64(text)?;
                (block, block)
            }
        };
        let checksum = range
            .attribute("chksum")
            .or_else(|| range.attribute("sha1"))
            .map(|hex_digest| {
                hex::decode(hex_digest.trim())
                    .map_err(|e| ImageError::invalid(format!("bmap: bad range checksum: {e}")))
            })
            .transpose()?;
        map.push_blocks(first, last, checksum)?;
    }

    if map.mapped_blocks() != mapped_blocks_count {
        return Err(ImageError::invalid(format!(
            "bmap: MappedBlocksCount {mapped_blocks_count} does not match {} mapped blocks",
            map.mapped_blocks()
        )));
    }

    debug!(
        version,
        image_size,
        block_size,
        mapped_blocks = mapped_blocks_count,
        ranges = map.ranges().len(),
        "parsed bmap"
    );
    Ok(map)
}

/// The file checksum is computed over the document with the checksum field
/// itself replaced by zeros.
fn verify_file_checksum(text: &str, expected: &str) -> Result<()> {
    let zeroed = text.replacen(expected, &"0".repeat(expected.len()), 1);
    let actual = hex::encode(Sha256::digest(zeroed.as_bytes()));
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(ImageError::invalid(format!(
            "bmap: file checksum mismatch (expected {expected}, got {actual})"
        )));
    }
    Ok(())
}

fn child_text<'a>(node: &Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .and_then(|n| n.text())
        .map(str::trim)
}

fn number(node: &Node<'_, '_>, name: &str) -> Result<u64> {
    let text = child_text(node, name)
        .ok_or_else(|| ImageError::invalid(format!("bmap: missing <{name}>")))?;
    parse_u64(text)
}

fn parse_u64(text: &str) -> Result<u64> {
    text.trim()
        .parse()
        .map_err(|_| ImageError::invalid(format!("bmap: invalid number {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockmap::ByteRange;

    const BMAP_1_4: &str = r#"<?xml version="1.0" ?>
<bmap version="1.4">
    <ImageSize> 40960 </ImageSize>
    <BlockSize> 4096 </BlockSize>
    <BlocksCount> 10 </BlocksCount>
    <MappedBlocksCount> 4 </MappedBlocksCount>
    <ChecksumType> sha1 </ChecksumType>
    <BmapFileChecksum> 0000000000000000000000000000000000000000 </BmapFileChecksum>
    <BlockMap>
        <Range chksum="a94a8fe5ccb19ba61c4c0873d391e987982fbbd3"> 0-2 </Range>
        <Range chksum="a94a8fe5ccb19ba61c4c0873d391e987982fbbd3"> 7 </Range>
    </BlockMap>
</bmap>
"#;

    fn sha256_document(mapped: &str, ranges: &str) -> String {
        let template = format!(
            r#"<bmap version="2.0">
    <ImageSize> 16384 </ImageSize>
    <BlockSize> 4096 </BlockSize>
    <BlocksCount> 4 </BlocksCount>
    <MappedBlocksCount> {mapped} </MappedBlocksCount>
    <ChecksumType> sha256 </ChecksumType>
    <BmapFileChecksum> {zeros} </BmapFileChecksum>
    <BlockMap>
{ranges}
    </BlockMap>
</bmap>
"#,
            zeros = "0".repeat(64)
        );
        let digest = hex::encode(Sha256::digest(template.as_bytes()));
        template.replacen(&"0".repeat(64), &digest, 1)
    }

    #[test]
    fn parses_legacy_sha1_bmap() {
        let map = parse(BMAP_1_4).unwrap();
        assert_eq!(map.image_size(), 40960);
        assert_eq!(map.block_size(), 4096);
        assert_eq!(map.checksum_type(), Some(&ChecksumType::Other("sha1".into())));
        let ranges: Vec<_> = map.ranges().iter().map(|r| r.range).collect();
        assert_eq!(
            ranges,
            vec![ByteRange::new(0, 3 * 4096), ByteRange::new(7 * 4096, 8 * 4096)]
        );
        assert_eq!(map.ranges()[0].checksum.as_ref().map(Vec::len), Some(20));
    }

    #[test]
    fn verifies_sha256_file_checksum() {
        let doc = sha256_document("2", "        <Range> 1-2 </Range>");
        let map = parse(&doc).unwrap();
        assert_eq!(map.mapped_blocks(), 2);
        assert_eq!(map.checksum_type(), Some(&ChecksumType::Sha256));

        let tampered = doc.replace("<Range> 1-2 </Range>", "<Range> 0-1 </Range>");
        assert!(matches!(parse(&tampered), Err(ImageError::InvalidFormat(_))));
    }

    #[test]
    fn rejects_inconsistent_counts() {
        let doc = sha256_document("3", "        <Range> 1-2 </Range>");
        assert!(matches!(parse(&doc), Err(ImageError::InvalidFormat(_))));

        let bad_blocks = BMAP_1_4.replace("<BlocksCount> 10 </BlocksCount>", "<BlocksCount> 11 </BlocksCount>");
        assert!(parse(&bad_blocks).is_err());
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(matches!(parse("<bmap>"), Err(ImageError::InvalidFormat(_))));
        assert!(matches!(
            parse("<notbmap></notbmap>"),
            Err(ImageError::InvalidFormat(_))
        ));
        let bad_range = BMAP_1_4.replace("> 7 <", "> seven <");
        assert!(parse(&bad_range).is_err());
    }
}
