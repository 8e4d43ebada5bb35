//! The block stream codec.
//!
//! A block stream turns a flat byte sequence into fixed-size blocks layered
//! over a stream device: `[StreamHeader][Block 0]…[Block N][BlockTable]`.
//! Each block is independently filtered and checksummed, so readers can
//! seek-decode any block without touching the rest of the stream.

use std::{io::SeekFrom, rc::Rc};

use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, trace};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    cache::BlockCache,
    device::StreamDevice,
    error::{Error, Result},
    filter::FilterOps,
    format::{
        BlockPosition, BlockTableEntry, StreamHeader, BLOCK_SIZE_MAX, BLOCK_SIZE_MIN,
        BLOCK_TABLE_ENTRY_SIZE, STREAM_HEADER_SIZE, STREAM_MAGIC,
    },
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Read/write codec for one logical stream (descriptor or data).
///
/// A stream is either created for writing (staging blocks into a growable
/// temporary device) or opened for reading (block table loaded up front, a
/// block cache in play). The two modes share the staging buffer: it holds
/// the block currently being filled on the write path, or the block most
/// recently decoded on the read path.
pub(crate) struct BlockStream {
    device: Rc<StreamDevice>,
    device_offset: u64,
    block_size: u32,
    filter: Option<Rc<dyn FilterOps>>,
    table: Vec<BlockTableEntry>,
    cache: Option<BlockCache>,
    staging: Vec<u8>,
    /// Block index the staging buffer corresponds to.
    staging_index: u32,
    /// Cursor within the staging buffer.
    staging_offset: u32,
    /// Whether the staging buffer holds a decoded block (read mode only;
    /// the write path always appends into a valid buffer).
    staging_loaded: bool,
}

impl BlockStream {
    /// Creates a write-mode stream at `device_offset`, emitting the initial
    /// header immediately so blocks land after it.
    pub(crate) fn create(
        device: Rc<StreamDevice>,
        device_offset: u64,
        block_size: u32,
    ) -> Result<Self> {
        if !(BLOCK_SIZE_MIN..=BLOCK_SIZE_MAX).contains(&block_size) {
            return Err(Error::InvalidArgument("block size out of range"));
        }
        trace!("stream create: offset={device_offset} block_size={block_size}");

        let header = StreamHeader {
            magic: STREAM_MAGIC.into(),
            block_size: block_size.into(),
            ..Default::default()
        };
        device.write_all(header.as_bytes())?;

        Ok(Self {
            device,
            device_offset,
            block_size,
            filter: None,
            table: Vec::new(),
            cache: None,
            staging: vec![0; block_size as usize],
            staging_index: 0,
            staging_offset: 0,
            staging_loaded: true,
        })
    }

    /// Opens a read-mode stream at `device_offset`, loading and validating
    /// the header and block table.
    pub(crate) fn open(
        device: Rc<StreamDevice>,
        device_offset: u64,
        cache_capacity: usize,
    ) -> Result<Self> {
        device.seek(SeekFrom::Start(device_offset))?;
        let mut header_bytes = [0u8; STREAM_HEADER_SIZE];
        device.read_exact(&mut header_bytes)?;
        let header = StreamHeader::read_from_bytes(&header_bytes).unwrap();

        if header.magic.get() != STREAM_MAGIC {
            return Err(Error::Integrity("bad stream magic"));
        }
        let block_size = header.block_size.get();
        if !(BLOCK_SIZE_MIN..=BLOCK_SIZE_MAX).contains(&block_size) {
            return Err(Error::Integrity("stream block size out of range"));
        }
        trace!(
            "stream open: offset={device_offset} block_size={block_size} blocks={}",
            header.block_count.get()
        );

        let count = header.block_count.get() as usize;
        let mut table_bytes = vec![0u8; count * BLOCK_TABLE_ENTRY_SIZE];
        device.seek(SeekFrom::Start(
            device_offset + u64::from(header.block_table_offset.get()),
        ))?;
        device.read_exact(&mut table_bytes)?;

        let table = table_bytes
            .chunks_exact(BLOCK_TABLE_ENTRY_SIZE)
            .map(|chunk| BlockTableEntry::read_from_bytes(chunk).unwrap())
            .collect();

        Ok(Self {
            device,
            device_offset,
            block_size,
            filter: None,
            table,
            cache: Some(BlockCache::new(cache_capacity)),
            staging: vec![0; block_size as usize],
            staging_index: 0,
            staging_offset: 0,
            staging_loaded: false,
        })
    }

    pub(crate) fn device(&self) -> &Rc<StreamDevice> {
        &self.device
    }

    pub(crate) fn set_filter(&mut self, filter: Option<Rc<dyn FilterOps>>) {
        self.filter = filter;
    }

    /// Current logical position: the block being staged and the offset
    /// within it.
    pub(crate) fn position(&self) -> BlockPosition {
        BlockPosition::new(self.staging_index, self.staging_offset)
    }

    /* Write path */

    /// Appends bytes, flushing the staging buffer each time it fills.
    pub(crate) fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let space = (self.block_size - self.staging_offset) as usize;
            let count = data.len().min(space);

            let start = self.staging_offset as usize;
            self.staging[start..start + count].copy_from_slice(&data[..count]);
            self.staging_offset += count as u32;
            data = &data[count..];

            if self.staging_offset == self.block_size {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    /// Encodes and emits the staged block, then starts a fresh one. Empty
    /// staging buffers are ignored.
    fn flush_block(&mut self) -> Result<()> {
        if self.staging_offset == 0 {
            return Ok(());
        }

        let payload = &self.staging[..self.staging_offset as usize];
        // CRC covers the decoded bytes, never the encoded form.
        let crc = CRC32.checksum(payload);

        let encoded_owned;
        let encoded: &[u8] = match &self.filter {
            Some(filter) => {
                encoded_owned = filter.encode(payload)?;
                &encoded_owned
            }
            None => payload,
        };

        let offset = self.device.position()? - self.device_offset;
        trace!(
            "flush block {}: {} -> {} bytes at {offset}",
            self.staging_index,
            payload.len(),
            encoded.len()
        );
        self.device.write_all(encoded)?;

        let length = u32::try_from(encoded.len())
            .map_err(|_| Error::InvalidArgument("encoded block too large"))?;
        self.table.push(BlockTableEntry {
            length_on_disk: length.into(),
            offset: u32::try_from(offset)
                .map_err(|_| Error::InvalidArgument("stream too large"))?
                .into(),
            crc: crc.into(),
            flags: 0u16.into(),
            reserved: 0u16.into(),
        });

        self.staging_index += 1;
        self.staging_offset = 0;
        Ok(())
    }

    /// Finalizes a write-mode stream: flushes the partial block, rebases
    /// block offsets to the image origin (`base_offset` is where this
    /// stream will land in the final image), writes the block table, and
    /// rewrites the stream header in place.
    pub(crate) fn finish(&mut self, base_offset: u64) -> Result<()> {
        self.flush_block()?;

        let base =
            u32::try_from(base_offset).map_err(|_| Error::InvalidArgument("image too large"))?;
        for entry in &mut self.table {
            let absolute = entry
                .offset
                .get()
                .checked_add(base)
                .ok_or(Error::InvalidArgument("image too large"))?;
            entry.offset = absolute.into();
        }

        let table_offset = self.device.position()? - self.device_offset;
        for entry in &self.table {
            self.device.write_all(entry.as_bytes())?;
        }
        debug!(
            "stream finish: {} blocks, table at {table_offset}, base {base_offset}",
            self.table.len()
        );

        let end = self.device.position()?;
        let header = StreamHeader {
            magic: STREAM_MAGIC.into(),
            block_size: self.block_size.into(),
            block_table_offset: u32::try_from(table_offset)
                .map_err(|_| Error::InvalidArgument("stream too large"))?
                .into(),
            block_count: u32::try_from(self.table.len())
                .map_err(|_| Error::InvalidArgument("too many blocks"))?
                .into(),
        };
        self.device.seek(SeekFrom::Start(self.device_offset))?;
        self.device.write_all(header.as_bytes())?;
        self.device.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /* Read path */

    /// Positions the cursor at `(block, offset)`, normalizing offsets that
    /// span past the block size onto later blocks, and loads the target
    /// block if it is not already staged.
    pub(crate) fn seek(&mut self, block: u32, offset: u64) -> Result<()> {
        let block_size = u64::from(self.block_size);
        let index = u64::from(block) + offset / block_size;
        let within = offset % block_size;

        let index = u32::try_from(index).map_err(|_| Error::EndOfStream)?;
        if (index as usize) >= self.table.len() {
            return Err(Error::EndOfStream);
        }

        if !self.staging_loaded || self.staging_index != index {
            self.load_block(index)?;
            self.staging_index = index;
            self.staging_loaded = true;
        }
        self.staging_offset = within as u32;
        Ok(())
    }

    /// Copies `buf.len()` bytes from the cursor, crossing block boundaries
    /// as long as bytes remain.
    pub(crate) fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.staging_offset == self.block_size {
                let next = self.staging_index + 1;
                self.load_block(next)?;
                self.staging_index = next;
                self.staging_offset = 0;
            }

            let available = (self.block_size - self.staging_offset) as usize;
            let count = (buf.len() - filled).min(available);
            let start = self.staging_offset as usize;
            buf[filled..filled + count].copy_from_slice(&self.staging[start..start + count]);
            self.staging_offset += count as u32;
            filled += count;
        }
        Ok(())
    }

    /// Brings a block into the staging buffer: cache first, then device
    /// read, filter decode, and CRC verification.
    fn load_block(&mut self, index: u32) -> Result<()> {
        if let Some(cache) = &mut self.cache {
            if let Some(data) = cache.get(index) {
                self.staging[..data.len()].copy_from_slice(data);
                return Ok(());
            }
        }

        let entry = *self.table.get(index as usize).ok_or(Error::EndOfStream)?;
        trace!(
            "load block {index}: {} bytes at {}",
            entry.length_on_disk.get(),
            entry.offset.get()
        );

        let mut raw = vec![0u8; entry.length_on_disk.get() as usize];
        self.device
            .seek(SeekFrom::Start(u64::from(entry.offset.get())))?;
        self.device.read_exact(&mut raw)?;

        let decoded_len = match &self.filter {
            Some(filter) => filter.decode(&raw, &mut self.staging)?,
            None => {
                if raw.len() > self.staging.len() {
                    return Err(Error::Integrity("block larger than block size"));
                }
                self.staging[..raw.len()].copy_from_slice(&raw);
                raw.len()
            }
        };
        if decoded_len > self.staging.len() {
            return Err(Error::Integrity("decoded block larger than block size"));
        }

        let crc = CRC32.checksum(&self.staging[..decoded_len]);
        if crc != entry.crc.get() {
            debug!(
                "block {index} crc mismatch: computed {crc:#010x}, expected {:#010x}",
                entry.crc.get()
            );
            return Err(Error::Integrity("block crc mismatch"));
        }

        if let Some(cache) = &mut self.cache {
            cache.insert(index, &self.staging[..decoded_len]);
        }
        Ok(())
    }
}
