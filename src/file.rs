//! File handles.

use std::{io::SeekFrom, rc::Rc};

use crate::{
    device::StreamDevice,
    error::{Error, Result},
    image::{Mode, VaFs},
    tree::FileNode,
};

/// Handle to one regular file with a logical cursor.
///
/// On a created image the handle is a writer: the first [`write`] pins the
/// file's start position in the data stream and takes the data-stream lock
/// until the handle drops, so one file's bytes always land contiguously.
/// On an opened image the handle is a reader with [`seek`]/[`read`].
///
/// [`write`]: FileHandle::write
/// [`seek`]: FileHandle::seek
/// [`read`]: FileHandle::read
pub struct FileHandle<'v> {
    image: &'v VaFs,
    file: Rc<FileNode>,
    position: u32,
    /// The device whose lock this handle holds across a write sequence.
    write_lock: Option<Rc<StreamDevice>>,
}

impl<'v> FileHandle<'v> {
    pub(crate) fn new(image: &'v VaFs, file: Rc<FileNode>) -> Self {
        Self {
            image,
            file,
            position: 0,
            write_lock: None,
        }
    }

    /// The file's length in bytes.
    pub fn length(&self) -> u64 {
        u64::from(self.file.length.get())
    }

    /// The file's stored permission bits.
    pub fn permissions(&self) -> u32 {
        self.file.permissions
    }

    /// Repositions the cursor, clamped to `[0, length]`. Only valid on an
    /// opened image.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.image.mode() != Mode::Read {
            return Err(Error::PermissionDenied);
        }

        let length = i64::from(self.file.length.get());
        let target = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset).unwrap_or(i64::MAX),
            SeekFrom::Current(offset) => i64::from(self.position) + offset,
            SeekFrom::End(offset) => length + offset,
        };
        self.position = target.clamp(0, length) as u32;
        Ok(u64::from(self.position))
    }

    /// Reads up to `buf.len()` bytes at the cursor, returning the count;
    /// 0 means end of file. The data-stream lock is held for the duration
    /// of the call.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.image.mode() != Mode::Read {
            return Err(Error::PermissionDenied);
        }

        let remaining = (self.file.length.get() - self.position) as usize;
        let count = buf.len().min(remaining);
        if count == 0 {
            return Ok(0);
        }

        let data = self.file.data.get();
        if data.is_invalid() {
            return Err(Error::Integrity("file length disagrees with data position"));
        }

        let mut stream = self.image.data_stream().borrow_mut();
        let device = stream.device().clone();
        let _lock = device.lock()?;

        stream.seek(
            data.block.get(),
            u64::from(data.offset.get()) + u64::from(self.position),
        )?;
        stream.read_exact(&mut buf[..count])?;

        self.position += count as u32;
        Ok(count)
    }

    /// Appends bytes to the file. Only valid while the image is being
    /// created.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.image.mode() != Mode::Write {
            return Err(Error::PermissionDenied);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut stream = self.image.data_stream().borrow_mut();
        if self.write_lock.is_none() {
            let device = stream.device().clone();
            device.acquire()?;
            self.write_lock = Some(device);
        }

        if self.file.data.get().is_invalid() {
            self.file.data.set(stream.position());
        }

        stream.write_all(buf)?;

        let added = u32::try_from(buf.len())
            .map_err(|_| Error::InvalidArgument("write larger than the file size limit"))?;
        let length = self
            .file
            .length
            .get()
            .checked_add(added)
            .ok_or(Error::InvalidArgument("file too large"))?;
        self.file.length.set(length);
        self.image
            .bump_overview(|totals| totals.total_uncompressed_bytes += buf.len() as u64);

        Ok(buf.len())
    }
}

impl Drop for FileHandle<'_> {
    fn drop(&mut self) {
        if let Some(device) = self.write_lock.take() {
            device.release();
        }
    }
}
