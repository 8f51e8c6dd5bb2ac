//! Positioned I/O handles.
//!
//! Everything below the streaming layer talks to a [`BlockHandle`]: a file or
//! device descriptor that supports positioned reads and writes. Streams borrow
//! the handle of the image that created them (`&mut H`), so the image keeps
//! ownership and closes it; a stream built over an owned handle (`Box<H>`)
//! releases it as soon as the stream is dropped.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::os_options::{self, HandleFlags};

pub trait BlockHandle: Send {
    /// Reads up to `buf.len()` bytes at `offset`, returning the count read.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Writes up to `buf.len()` bytes at `offset`, returning the count written.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Length of the underlying file or device in bytes.
    fn len(&mut self) -> io::Result<u64>;

    /// Flushes buffered writes to the device.
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Alignment required of buffers, offsets and lengths (1 when unconstrained).
    fn alignment(&self) -> usize {
        1
    }
}

impl<H: BlockHandle + ?Sized> BlockHandle for &mut H {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        (**self).write_at(buf, offset)
    }

    fn len(&mut self) -> io::Result<u64> {
        (**self).len()
    }

    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }

    fn alignment(&self) -> usize {
        (**self).alignment()
    }
}

impl<H: BlockHandle + ?Sized> BlockHandle for Box<H> {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        (**self).write_at(buf, offset)
    }

    fn len(&mut self) -> io::Result<u64> {
        (**self).len()
    }

    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }

    fn alignment(&self) -> usize {
        (**self).alignment()
    }
}

/// A [`BlockHandle`] over an open file or device node.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
    alignment: usize,
}

impl FileHandle {
    pub fn new(file: File) -> Self {
        Self { file, alignment: 1 }
    }

    /// Declares that the file was opened for direct I/O with the given
    /// logical block size.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment.max(1);
        self
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl BlockHandle for FileHandle {
    #[cfg(unix)]
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(&self.file, buf, offset)
    }

    fn len(&mut self) -> io::Result<u64> {
        let meta = self.file.metadata()?;
        if meta.is_file() {
            return Ok(meta.len());
        }
        // Device nodes report a zero length; seeking to the end yields the
        // real capacity.
        let len = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn alignment(&self) -> usize {
        self.alignment
    }
}

/// Opens `path` with the given access mode and cache-bypass flags.
pub(crate) fn open_file(path: &Path, writable: bool, flags: HandleFlags) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(writable);
    os_options::apply(&mut options, flags);
    options.open(path)
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    writes: Vec<(u64, usize)>,
    syncs: usize,
}

/// An in-memory [`BlockHandle`].
///
/// Clones share the same storage, so a caller can keep one clone to inspect
/// what an image wrote through another. A fixed-size handle behaves like a
/// device: writes past the end come back short instead of growing it.
#[derive(Clone, Debug)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
    fixed: bool,
    alignment: usize,
}

impl MemoryHandle {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                data,
                ..MemoryState::default()
            })),
            fixed: false,
            alignment: 1,
        }
    }

    /// A zero-filled, fixed-size handle.
    pub fn fixed(size: usize) -> Self {
        Self {
            fixed: true,
            ..Self::new(vec![0; size])
        }
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment.max(1);
        self
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// `(offset, length)` of every write call, in order.
    pub fn writes(&self) -> Vec<(u64, usize)> {
        self.lock().writes.clone()
    }

    pub fn sync_count(&self) -> usize {
        self.lock().syncs
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-write.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryHandle {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl BlockHandle for MemoryHandle {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let state = self.lock();
        let len = state.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(state.data.len() - start);
        buf[..n].copy_from_slice(&state.data[start..start + n]);
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let fixed = self.fixed;
        let mut state = self.lock();
        state.writes.push((offset, buf.len()));
        let start = offset as usize;
        let n = if fixed {
            buf.len().min(state.data.len().saturating_sub(start))
        } else {
            if state.data.len() < start + buf.len() {
                state.data.resize(start + buf.len(), 0);
            }
            buf.len()
        };
        if n > 0 {
            state.data[start..start + n].copy_from_slice(&buf[..n]);
        }
        Ok(n)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.lock().data.len() as u64)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.lock().syncs += 1;
        Ok(())
    }

    fn alignment(&self) -> usize {
        self.alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_handle_grows_unless_fixed() {
        let mut growable = MemoryHandle::new(Vec::new());
        assert_eq!(growable.write_at(b"abc", 4).unwrap(), 3);
        assert_eq!(growable.contents(), b"\0\0\0\0abc");

        let mut device = MemoryHandle::fixed(6);
        assert_eq!(device.write_at(b"abcd", 4).unwrap(), 2);
        assert_eq!(device.write_at(b"x", 9).unwrap(), 0);
        assert_eq!(device.contents(), b"\0\0\0\0ab");
        assert_eq!(device.writes(), vec![(4, 4), (9, 1)]);
    }

    #[test]
    fn memory_handle_reads_stop_at_end() {
        let mut handle = MemoryHandle::new(b"0123456789".to_vec());
        let mut buf = [0u8; 4];
        assert_eq!(handle.read_at(&mut buf, 8).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(handle.read_at(&mut buf, 10).unwrap(), 0);
    }

    #[test]
    fn file_handle_positions_reads_and_writes() {
        let file = tempfile::tempfile().unwrap();
        let mut handle = FileHandle::new(file);
        handle.write_at(b"world", 6).unwrap();
        handle.write_at(b"hello ", 0).unwrap();
        assert_eq!(handle.len().unwrap(), 11);
        let mut buf = [0u8; 11];
        assert_eq!(handle.read_at(&mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
    }
}
