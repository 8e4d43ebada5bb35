//! Stream devices: a uniform seek/read/write surface over a host file, a
//! memory buffer, or a caller-supplied backend, with a per-device
//! single-owner lock.

use std::{
    cell::{Cell, RefCell},
    fs::{File, OpenOptions},
    io::{self, ErrorKind, Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::error::{Error, Result};

/// Size of the bounce buffer used by [`StreamDevice::copy_from`].
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// The storage contract a device is built on.
///
/// `std::fs::File` implements this, as does the crate's internal memory
/// backend. Callers with exotic storage (a raw device, a loop-back
/// interface) implement it themselves and hand a box to
/// [`VaFs::create_from`](crate::VaFs::create_from) or
/// [`VaFs::open_from`](crate::VaFs::open_from).
pub trait StreamBackend {
    /// Repositions the cursor and returns the new position.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;
    /// Reads up to `buf.len()` bytes at the cursor. A return of 0 means
    /// end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Writes up to `buf.len()` bytes at the cursor.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl StreamBackend for File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Seek::seek(self, pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }
}

/// Contiguous in-memory storage with a logical cursor.
///
/// Growable buffers extend by geometric doubling when a write (or a
/// seek-then-write) lands past the current capacity; read-only buffers are
/// never grown and refuse seeks past their end.
pub(crate) struct MemoryBackend {
    data: Vec<u8>,
    position: usize,
    growable: bool,
}

impl MemoryBackend {
    /// An empty, growable buffer for staging a stream during image creation.
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::new(),
            position: 0,
            growable: true,
        }
    }

    /// Wraps an existing image buffer for reading.
    pub(crate) fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            position: 0,
            growable: false,
        }
    }

    fn reserve_to(&mut self, needed: usize) {
        if needed > self.data.len() {
            if needed > self.data.capacity() {
                let doubled = self.data.capacity().max(64) * 2;
                self.data.reserve(doubled.max(needed) - self.data.len());
            }
            self.data.resize(needed, 0);
        }
    }
}

impl StreamBackend for MemoryBackend {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.data.len() as i64 + offset,
        };
        if target < 0 {
            return Err(ErrorKind::InvalidInput.into());
        }
        let target = target as usize;
        if !self.growable && target > self.data.len() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "seek past the end of a read-only memory device",
            ));
        }
        self.position = target;
        Ok(target as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.data.len().saturating_sub(self.position);
        let count = buf.len().min(available);
        buf[..count].copy_from_slice(&self.data[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.growable {
            return Err(ErrorKind::PermissionDenied.into());
        }
        self.reserve_to(self.position + buf.len());
        self.data[self.position..self.position + buf.len()].copy_from_slice(buf);
        self.position += buf.len();
        Ok(buf.len())
    }
}

/// A backend plus the state shared by everything layered on top of it: the
/// writability flag and the exclusive operation lock.
pub(crate) struct StreamDevice {
    backend: RefCell<Box<dyn StreamBackend>>,
    locked: Cell<bool>,
    writable: bool,
}

impl StreamDevice {
    pub(crate) fn create_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::from_backend(Box::new(file), true))
    }

    pub(crate) fn open_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::from_backend(Box::new(file), false))
    }

    pub(crate) fn create_memory() -> Self {
        Self::from_backend(Box::new(MemoryBackend::new()), true)
    }

    pub(crate) fn open_memory(buffer: Vec<u8>) -> Self {
        Self::from_backend(Box::new(MemoryBackend::from_vec(buffer)), false)
    }

    pub(crate) fn from_backend(backend: Box<dyn StreamBackend>, writable: bool) -> Self {
        Self {
            backend: RefCell::new(backend),
            locked: Cell::new(false),
            writable,
        }
    }

    pub(crate) fn seek(&self, pos: SeekFrom) -> Result<u64> {
        Ok(self.backend.borrow_mut().seek(pos)?)
    }

    pub(crate) fn position(&self) -> Result<u64> {
        self.seek(SeekFrom::Current(0))
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.backend.borrow_mut().read(buf)?)
    }

    /// Fills `buf` completely, retrying interrupted reads. A short read is
    /// an integrity failure: callers only ask for ranges the format says
    /// exist.
    pub(crate) fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut backend = self.backend.borrow_mut();
        let mut todo: &mut [u8] = buf;
        while !todo.is_empty() {
            match backend.read(todo) {
                Ok(0) => return Err(Error::Integrity("unexpected end of device")),
                Ok(n) => todo = &mut todo[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub(crate) fn write_all(&self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::PermissionDenied);
        }
        let mut backend = self.backend.borrow_mut();
        let mut todo = buf;
        while !todo.is_empty() {
            match backend.write(todo) {
                Ok(0) => return Err(Error::Io(ErrorKind::WriteZero.into())),
                Ok(n) => todo = &todo[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Appends the full content of `source` to this device through a bounce
    /// buffer.
    pub(crate) fn copy_from(&self, source: &StreamDevice) -> Result<()> {
        source.seek(SeekFrom::Start(0))?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let count = source.read(&mut buffer)?;
            if count == 0 {
                return Ok(());
            }
            self.write_all(&buffer[..count])?;
        }
    }

    /// Takes the device lock, failing with [`Error::WouldBlock`] if another
    /// operation holds it. The caller must pair this with
    /// [`StreamDevice::release`].
    pub(crate) fn acquire(&self) -> Result<()> {
        if self.locked.replace(true) {
            return Err(Error::WouldBlock);
        }
        Ok(())
    }

    pub(crate) fn release(&self) {
        self.locked.set(false);
    }

    /// Scoped variant of [`StreamDevice::acquire`]: the lock drops with the
    /// guard.
    pub(crate) fn lock(&self) -> Result<DeviceLock<'_>> {
        self.acquire()?;
        Ok(DeviceLock(self))
    }
}

/// RAII guard for a held device lock.
pub(crate) struct DeviceLock<'a>(&'a StreamDevice);

impl Drop for DeviceLock<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}
