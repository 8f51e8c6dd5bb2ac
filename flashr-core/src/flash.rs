//! Drives a source image into a destination image.
//!
//! The sparse path is taken when the source can stream only its allocated
//! blocks and the destination can place them; otherwise the source is read
//! densely and re-chunked onto the destination. An optional verification
//! pass re-reads the source and compares it with what landed.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::block::BlockSink;
use crate::blockmap::{BlockMap, DEFAULT_CHUNK_SIZE};
use crate::capability::Capability;
use crate::error::{ImageError, Result};
use crate::image::OpenImage;
use crate::stream::{BlockStream, WriteStats};
use crate::verify::{Verifier, VerifyReport};

/// How [`run`] moves data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashOptions {
    verify: bool,
    sparse: bool,
    chunk_size: usize,
}

impl FlashOptions {
    pub fn new() -> Self {
        Self {
            verify: true,
            sparse: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Re-reads the source after writing and compares it with the destination.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Prefers the sparse path when both images allow it.
    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    /// Read buffer size for the dense path.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress reported while flashing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlashEvent {
    /// Writing begins. `total` is the number of bytes expected to be read
    /// from the source, when known.
    Start { total: Option<u64>, sparse: bool },
    Progress(WriteStats),
    VerifyStart { total: Option<u64> },
    VerifyProgress { bytes: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashResult {
    pub stats: WriteStats,
    pub sparse: bool,
    pub verification: Option<VerifyReport>,
}

fn ensure_running(running: &AtomicBool) -> Result<()> {
    if running.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(ImageError::Cancelled)
    }
}

/// Writes `source` to `destination`.
///
/// `running` is polled between blocks; clearing it aborts with
/// [`ImageError::Cancelled`]. Blocks already written stay written.
///
/// # Errors
///
/// Fails if either image lacks the capabilities the chosen path needs
/// (including `VERIFY` on the destination when verification is requested,
/// checked before anything is written), on any I/O error, on a checksum
/// mismatch in the source's block-map, or when verification finds a
/// difference.
pub fn run(
    source: &mut OpenImage,
    destination: &mut OpenImage,
    options: &FlashOptions,
    running: &AtomicBool,
    mut on_event: impl FnMut(FlashEvent),
) -> Result<FlashResult> {
    if options.verify && !destination.has_capability(Capability::VERIFY) {
        return Err(ImageError::NotCapable {
            format: destination.format().name(),
            capability: Capability::VERIFY,
        });
    }

    let sparse = options.sparse
        && source.has_capability(Capability::READ_STREAM_SPARSE)
        && destination.has_capability(Capability::WRITE_STREAM_SPARSE);
    info!(
        source = %source.path().display(),
        destination = %destination.path().display(),
        sparse,
        verify = options.verify,
        "flashing"
    );

    let stats = if sparse {
        write_sparse(source, destination, running, &mut on_event)?
    } else {
        write_dense(source, destination, options, running, &mut on_event)?
    };
    debug!(?stats, "write finished");

    let verification = if options.verify {
        let total = if sparse {
            Some(stats.bytes_read)
        } else {
            source.metadata().size
        };
        on_event(FlashEvent::VerifyStart { total });
        let verifier = destination.create_verify()?;
        let report = if sparse {
            verify_sparse(source, verifier, running, &mut on_event)?
        } else {
            verify_dense(source, verifier, options, running, &mut on_event)?
        };
        info!(bytes = report.bytes_verified, digest = %report.digest, "verified");
        Some(report)
    } else {
        None
    };

    Ok(FlashResult {
        stats,
        sparse,
        verification,
    })
}

fn write_sparse(
    source: &mut OpenImage,
    destination: &mut OpenImage,
    running: &AtomicBool,
    on_event: &mut impl FnMut(FlashEvent),
) -> Result<WriteStats> {
    let map = source.metadata().block_map.clone();
    let total = map
        .as_ref()
        .map(BlockMap::mapped_size)
        .or(source.metadata().size);
    on_event(FlashEvent::Start {
        total,
        sparse: true,
    });

    let blocks = source.create_sparse_read_stream()?;
    let mut writer = destination.create_sparse_write_stream(map)?;
    for block in blocks {
        ensure_running(running)?;
        writer.write_block(block?)?;
        on_event(FlashEvent::Progress(writer.stats()));
    }
    writer.close()
}

/// Reads into `buf`, retrying interrupted reads. Returns 0 at the end.
fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn write_dense(
    source: &mut OpenImage,
    destination: &mut OpenImage,
    options: &FlashOptions,
    running: &AtomicBool,
    on_event: &mut impl FnMut(FlashEvent),
) -> Result<WriteStats> {
    on_event(FlashEvent::Start {
        total: source.metadata().size,
        sparse: false,
    });

    let mut reader = source.create_read_stream()?;
    let mut writer = destination.create_write_stream()?;
    let mut buf = vec![0u8; options.chunk_size];
    loop {
        ensure_running(running)?;
        let n = read_chunk(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        writer.push(&buf[..n])?;
        on_event(FlashEvent::Progress(writer.sink().stats()));
    }
    let stats = writer.finish()?.stats();
    on_event(FlashEvent::Progress(stats));
    Ok(stats)
}

fn verify_sparse(
    source: &mut OpenImage,
    mut verifier: Verifier<'_>,
    running: &AtomicBool,
    on_event: &mut impl FnMut(FlashEvent),
) -> Result<VerifyReport> {
    for block in source.create_sparse_read_stream()? {
        ensure_running(running)?;
        verifier.verify_block(&block?)?;
        on_event(FlashEvent::VerifyProgress {
            bytes: verifier.bytes_verified(),
        });
    }
    verifier.finish()
}

fn verify_dense(
    source: &mut OpenImage,
    verifier: Verifier<'_>,
    options: &FlashOptions,
    running: &AtomicBool,
    on_event: &mut impl FnMut(FlashEvent),
) -> Result<VerifyReport> {
    let mut reader = source.create_read_stream()?;
    let mut stream = BlockStream::new(options.chunk_size, verifier);
    let mut buf = vec![0u8; options.chunk_size];
    loop {
        ensure_running(running)?;
        let n = read_chunk(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        stream.push(&buf[..n])?;
        on_event(FlashEvent::VerifyProgress {
            bytes: stream.sink().bytes_verified(),
        });
    }
    stream.finish()?.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::MemoryHandle;
    use crate::image::{Access, Format, Image, OpenOptions};
    use crate::udif::tests::sample;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn memory(handle: &MemoryHandle, access: Access) -> OpenImage {
        Image::with_handle("memory.img", Format::RawImage, Box::new(handle.clone()))
            .unwrap()
            .open(&OpenOptions::new().access(access))
            .unwrap()
    }

    #[test]
    fn dense_flash_writes_and_verifies() {
        let data = pattern(10_000);
        let mut source = memory(&MemoryHandle::new(data.clone()), Access::Read);
        let target = MemoryHandle::fixed(16 * 1024);
        let mut destination = memory(&target, Access::ReadWrite);

        let mut events = Vec::new();
        let options = FlashOptions::new().chunk_size(3000);
        let result = run(
            &mut source,
            &mut destination,
            &options,
            &AtomicBool::new(true),
            |event| events.push(event),
        )
        .unwrap();

        assert!(!result.sparse);
        assert_eq!(result.stats.bytes_written, 10_000);
        assert_eq!(result.verification.unwrap().bytes_verified, 10_000);
        assert_eq!(&target.contents()[..10_000], data.as_slice());
        assert_eq!(
            events.first(),
            Some(&FlashEvent::Start {
                total: Some(10_000),
                sparse: false
            })
        );
        assert!(events.contains(&FlashEvent::VerifyStart {
            total: Some(10_000)
        }));
    }

    #[test]
    fn sparse_flash_skips_unallocated_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.dmg");
        std::fs::write(&path, sample()).unwrap();
        let mut source = Image::from_path(&path)
            .unwrap()
            .open(&OpenOptions::new())
            .unwrap();
        let target = MemoryHandle::new(vec![0xee; 2048]);
        let mut destination = memory(&target, Access::ReadWrite);

        let result = run(
            &mut source,
            &mut destination,
            &FlashOptions::new(),
            &AtomicBool::new(true),
            |_| {},
        )
        .unwrap();

        assert!(result.sparse);
        assert_eq!(result.stats.blocks_written, 2);
        assert_eq!(target.writes(), vec![(0, 512), (1536, 512)]);
        let contents = target.contents();
        assert!(contents[..512].iter().all(|&b| b == 0x11));
        assert!(contents[512..1536].iter().all(|&b| b == 0xee));
        assert!(contents[1536..].iter().all(|&b| b == 0x22));
        assert_eq!(result.verification.unwrap().bytes_verified, 1024);
    }

    #[test]
    fn sparse_flash_onto_aligned_handle_writes_whole_units() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.dmg");
        std::fs::write(&path, sample()).unwrap();
        let mut source = Image::from_path(&path)
            .unwrap()
            .open(&OpenOptions::new())
            .unwrap();
        let target = MemoryHandle::new(vec![0xee; 4096]).with_alignment(4096);
        let mut destination = memory(&target, Access::ReadWrite);

        let result = run(
            &mut source,
            &mut destination,
            &FlashOptions::new(),
            &AtomicBool::new(true),
            |_| {},
        )
        .unwrap();

        assert!(result.sparse);
        assert_eq!(target.writes(), vec![(0, 4096)]);
        let contents = target.contents();
        assert!(contents[..512].iter().all(|&b| b == 0x11));
        assert!(contents[512..1536].iter().all(|&b| b == 0));
        assert!(contents[1536..2048].iter().all(|&b| b == 0x22));
        assert_eq!(result.stats.bytes_written, 1024);
        assert_eq!(result.verification.unwrap().bytes_verified, 1024);
    }

    #[test]
    fn dense_flash_when_sparse_is_declined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.dmg");
        std::fs::write(&path, sample()).unwrap();
        let mut source = Image::from_path(&path)
            .unwrap()
            .open(&OpenOptions::new())
            .unwrap();
        let target = MemoryHandle::new(vec![0xee; 2048]);
        let mut destination = memory(&target, Access::ReadWrite);

        let options = FlashOptions::new().sparse(false).verify(false);
        let result = run(&mut source, &mut destination, &options, &AtomicBool::new(true), |_| {})
            .unwrap();
        assert!(!result.sparse);
        assert!(result.verification.is_none());
        assert!(target.contents()[512..1536].iter().all(|&b| b == 0));
    }

    #[test]
    fn cleared_flag_cancels_before_writing() {
        let mut source = memory(&MemoryHandle::new(pattern(4096)), Access::Read);
        let target = MemoryHandle::fixed(4096);
        let mut destination = memory(&target, Access::ReadWrite);
        let err = run(
            &mut source,
            &mut destination,
            &FlashOptions::new(),
            &AtomicBool::new(false),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, ImageError::Cancelled));
        assert!(target.writes().is_empty());
    }

    #[test]
    fn verification_needs_the_capability_up_front() {
        let mut source = memory(&MemoryHandle::new(pattern(4096)), Access::Read);
        let target = MemoryHandle::fixed(4096);
        let mut destination = memory(&target, Access::ReadWrite);
        destination.withdraw_capability(Capability::VERIFY);

        let err = run(
            &mut source,
            &mut destination,
            &FlashOptions::new(),
            &AtomicBool::new(true),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ImageError::NotCapable { capability, .. } if capability == Capability::VERIFY
        ));
        assert!(target.writes().is_empty());
    }
}
