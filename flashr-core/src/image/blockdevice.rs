use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::{Backend, OpenOptions, ReadStream};
use crate::capability::Capability;
use crate::device::{DEFAULT_LOGICAL_BLOCK_SIZE, Device};
use crate::error::{ImageError, Result};
use crate::handle::BlockHandle;
use crate::metadata::{self, Metadata};
use crate::platform::{DeviceAccess, DevicePlatform};
use crate::stream::BlockReadStream;

pub(super) const CAPABILITY: Capability = Capability::READ
    .union(Capability::WRITE)
    .union(Capability::READ_STREAM)
    .union(Capability::WRITE_STREAM)
    .union(Capability::WRITE_STREAM_SPARSE)
    .union(Capability::VERIFY);

/// A physical disk, claimed exclusively while open for writing.
struct BlockDevice {
    device: Device,
    handle: Box<dyn BlockHandle>,
    platform: Arc<dyn DevicePlatform>,
}

/// Looks the device up, unmounts it when writing, and opens its raw path.
pub(super) fn open(
    path: &Path,
    _handle: Option<Box<dyn BlockHandle>>,
    options: &OpenOptions,
) -> Result<Box<dyn Backend>> {
    let platform = Arc::clone(&options.platform);
    let device = platform
        .list_devices()?
        .into_iter()
        .find(|device| device.matches(path))
        .ok_or_else(|| ImageError::NotFound(format!("no such device: {}", path.display())))?;
    debug!(path = %path.display(), raw = %device.raw_path.display(), "found device");

    if options.is_writable() {
        platform.unmount(&device)?;
        debug!(device = %device.device_path.display(), "unmounted");
    }

    let access = DeviceAccess {
        writable: options.is_writable(),
        direct: options.direct_io,
    };
    let handle = platform.open_device(&device, access)?;
    Ok(Box::new(BlockDevice {
        device,
        handle,
        platform,
    }))
}

impl Backend for BlockDevice {
    fn metadata(&mut self) -> Result<Metadata> {
        let size = match self.device.size {
            0 => self.handle.len()?,
            size => size,
        };
        let logical_block_size =
            metadata::power_of_two(self.device.logical_block_size).unwrap_or(DEFAULT_LOGICAL_BLOCK_SIZE);
        let block_size = metadata::power_of_two(self.device.block_size).unwrap_or(logical_block_size);
        Ok(Metadata {
            size: Some(size),
            block_size: Some(block_size),
            logical_block_size,
            name: Some(self.device.description.clone()),
            ..Metadata::default()
        })
    }

    fn handle(&mut self) -> Option<&mut dyn BlockHandle> {
        let handle: &mut dyn BlockHandle = self.handle.as_mut();
        Some(handle)
    }

    fn read_stream(&mut self, metadata: &Metadata, options: &OpenOptions) -> Result<ReadStream<'_>> {
        let block_size = metadata.io_block_size();
        let chunk_size = options.chunk_size.div_ceil(block_size) * block_size;
        let mut stream = BlockReadStream::new(self.handle.as_mut(), chunk_size);
        if let Some(size) = metadata.size {
            stream = stream.with_end(size);
        }
        Ok(Box::new(stream))
    }

    /// Stale partition tables must be gone before the first new byte lands.
    fn prepare_write(&mut self) -> Result<()> {
        self.platform.wipe(&self.device)?;
        debug!(device = %self.device.device_path.display(), "wiped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockSink};
    use crate::blockmap::BlockMap;
    use crate::handle::MemoryHandle;
    use crate::image::{Access, Format, Image};
    use std::path::PathBuf;
    use std::sync::Mutex;

    const B: usize = 4096;

    struct FakePlatform {
        handle: MemoryHandle,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakePlatform {
        fn new(size: usize) -> Arc<Self> {
            Arc::new(Self {
                handle: MemoryHandle::fixed(size),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn device(&self) -> Device {
            Device {
                device_path: PathBuf::from("/dev/sdz"),
                raw_path: PathBuf::from("/dev/sdz"),
                size: self.handle.clone().len().unwrap(),
                block_size: B as u32,
                logical_block_size: 512,
                description: "Fake Card".into(),
                mount_points: vec![PathBuf::from("/media/card")],
            }
        }
    }

    impl DevicePlatform for FakePlatform {
        fn list_devices(&self) -> Result<Vec<Device>> {
            self.calls.lock().unwrap().push("list");
            Ok(vec![self.device()])
        }

        fn unmount(&self, _device: &Device) -> Result<()> {
            self.calls.lock().unwrap().push("unmount");
            Ok(())
        }

        fn wipe(&self, _device: &Device) -> Result<()> {
            self.calls.lock().unwrap().push("wipe");
            Ok(())
        }

        fn open_device(&self, _device: &Device, access: DeviceAccess) -> Result<Box<dyn BlockHandle>> {
            self.calls
                .lock()
                .unwrap()
                .push(if access.writable { "open-rw" } else { "open-ro" });
            Ok(Box::new(self.handle.clone()))
        }
    }

    fn options(platform: &Arc<FakePlatform>, access: Access) -> OpenOptions {
        let platform: Arc<dyn DevicePlatform> = platform.clone();
        OpenOptions::new().access(access).platform(platform)
    }

    #[test]
    fn unknown_devices_are_not_found() {
        let platform = FakePlatform::new(B);
        let err = Image::new("/dev/sdq", Format::BlockDevice)
            .open(&options(&platform, Access::Read))
            .unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));
    }

    #[test]
    fn reading_never_unmounts() {
        let platform = FakePlatform::new(B);
        let image = Image::new("/dev/sdz", Format::BlockDevice)
            .open(&options(&platform, Access::Read))
            .unwrap();
        assert_eq!(platform.calls(), vec!["list", "open-ro"]);
        assert_eq!(image.metadata().size, Some(B as u64));
        assert_eq!(image.metadata().block_size, Some(B as u32));
        assert_eq!(image.metadata().name.as_deref(), Some("Fake Card"));
        assert!(!image.has_capability(Capability::WRITE_STREAM));
    }

    #[test]
    fn sparse_write_skips_unmapped_blocks() {
        let platform = FakePlatform::new(3 * B);
        let mut image = Image::new("/dev/sdz", Format::BlockDevice)
            .open(&options(&platform, Access::ReadWrite))
            .unwrap();

        let mut map = BlockMap::new(3 * B as u64, B as u64).unwrap();
        map.push_blocks(1, 1, None).unwrap();
        let mut stream = image.create_sparse_write_stream(Some(map)).unwrap();
        for i in 0..3 {
            stream
                .write_block(Block::new(vec![0x5a; B], (i * B) as u64))
                .unwrap();
        }
        let stats = stream.close().unwrap();
        image.close().unwrap();

        assert_eq!(platform.calls(), vec!["list", "unmount", "open-rw", "wipe"]);
        assert_eq!(platform.handle.writes(), vec![(B as u64, B)]);
        assert_eq!(stats.blocks_written, 1);
        assert_eq!(stats.blocks_read, 3);
    }

    #[test]
    fn read_stream_stops_at_device_size() {
        let platform = FakePlatform::new(2 * B + 100);
        let mut image = Image::new("/dev/sdz", Format::BlockDevice)
            .open(&options(&platform, Access::Read))
            .unwrap();
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut image.create_read_stream().unwrap(), &mut data).unwrap();
        assert_eq!(data.len(), 2 * B + 100);
    }
}
