//! Image lifecycle: creation, finalization, and opening.
//!
//! A created image is write-only: handles may add directories, files, and
//! symlinks, and everything is staged in temporary memory-backed devices
//! until [`VaFs::close`] lays out the final artifact. An opened image is
//! read-only for its whole life.

use std::{cell::Cell, cell::RefCell, io::SeekFrom, path::Path, rc::Rc};

use log::{debug, info};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    cache::DEFAULT_CACHE_CAPACITY,
    device::{StreamBackend, StreamDevice},
    directory::DirectoryHandle,
    error::{Error, Result},
    feature::{Feature, Overview},
    file::FileHandle,
    filter::{FilterOps, MissingFilter},
    format::{
        Architecture, FeatureHeader, Guid, ImageHeader, BLOCK_SIZE_MAX, BLOCK_SIZE_MIN,
        DATA_BLOCK_SIZE_DEFAULT, DESCRIPTOR_BLOCK_SIZE, FEATURE_HEADER_SIZE, IMAGE_HEADER_SIZE,
        IMAGE_MAGIC, IMAGE_VERSION, S_IFDIR, S_IFLNK, S_IFREG,
    },
    resolve::{self, Resolved, Stat},
    stream::BlockStream,
    symlink::SymlinkHandle,
    tree::DirectoryNode,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Read,
    Write,
}

/// Parameters for creating an image.
#[derive(Clone, Default)]
pub struct VaFsConfig {
    architecture: Architecture,
    block_size: Option<u32>,
    filter: Option<(u32, Rc<dyn FilterOps>)>,
}

impl VaFsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the target architecture in the image header.
    pub fn set_architecture(&mut self, architecture: Architecture) {
        self.architecture = architecture;
    }

    /// Overrides the data stream block size. Must lie in `[8 KiB, 1 MiB]`;
    /// validated when the image is created.
    pub fn set_block_size(&mut self, block_size: u32) {
        self.block_size = Some(block_size);
    }

    /// Applies a filter to both streams of the new image. Only the family
    /// id is persisted; readers must install matching callbacks.
    pub fn set_filter(&mut self, filter: u32, ops: Rc<dyn FilterOps>) {
        self.filter = Some((filter, ops));
    }
}

/// An archive image, either being created (write-only) or opened from an
/// existing artifact (read-only).
///
/// Sub-handles ([`DirectoryHandle`], [`FileHandle`], [`SymlinkHandle`])
/// borrow the image, so they cannot outlive it and [`VaFs::close`] cannot
/// run while any of them is alive.
pub struct VaFs {
    mode: Mode,
    architecture: Architecture,
    attributes: u32,
    features: Vec<Feature>,
    /// Live totals while writing; folded into the overview feature at
    /// close.
    overview: Cell<Overview>,
    /// The filter family recorded for this image, if any.
    filter: Option<u32>,
    image_device: Rc<StreamDevice>,
    descriptor: RefCell<BlockStream>,
    data: RefCell<BlockStream>,
    root: Rc<DirectoryNode>,
}

impl VaFs {
    /* Lifecycle */

    /// Creates a new image file. The result is write-only.
    pub fn create(path: impl AsRef<Path>, config: &VaFsConfig) -> Result<VaFs> {
        let device = StreamDevice::create_file(path.as_ref())?;
        Self::create_on(Rc::new(device), config)
    }

    /// Creates a new image on a caller-supplied backend.
    pub fn create_from(backend: Box<dyn StreamBackend>, config: &VaFsConfig) -> Result<VaFs> {
        Self::create_on(Rc::new(StreamDevice::from_backend(backend, true)), config)
    }

    fn create_on(device: Rc<StreamDevice>, config: &VaFsConfig) -> Result<VaFs> {
        let block_size = config.block_size.unwrap_or(DATA_BLOCK_SIZE_DEFAULT);
        if !(BLOCK_SIZE_MIN..=BLOCK_SIZE_MAX).contains(&block_size) {
            return Err(Error::InvalidArgument("block size out of range"));
        }
        info!(
            "creating image: architecture {:?}, data block size {block_size}",
            config.architecture
        );

        // Reserve the header region with zeroes; the real header is only
        // written at close, so a torn create never validates as an image.
        device.write_all(&[0u8; IMAGE_HEADER_SIZE])?;

        // Both streams stage into growable memory devices so content
        // emission never seeks back into the primary device.
        let descriptor_device = Rc::new(StreamDevice::create_memory());
        let data_device = Rc::new(StreamDevice::create_memory());
        let mut descriptor = BlockStream::create(descriptor_device, 0, DESCRIPTOR_BLOCK_SIZE)?;
        let mut data = BlockStream::create(data_device, 0, block_size)?;

        let mut features = vec![Feature::Overview(Overview::default())];
        let mut filter = None;
        if let Some((id, ops)) = &config.filter {
            descriptor.set_filter(Some(ops.clone()));
            data.set_filter(Some(ops.clone()));
            features.push(Feature::Filter(*id));
            filter = Some(*id);
        }

        Ok(VaFs {
            mode: Mode::Write,
            architecture: config.architecture,
            attributes: 0,
            features,
            overview: Cell::new(Overview::default()),
            filter,
            image_device: device,
            descriptor: RefCell::new(descriptor),
            data: RefCell::new(data),
            root: DirectoryNode::new_root(),
        })
    }

    /// Opens an existing image file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<VaFs> {
        let device = StreamDevice::open_file(path.as_ref())?;
        Self::open_on(Rc::new(device))
    }

    /// Opens an image held in a memory buffer.
    pub fn open_memory(buffer: Vec<u8>) -> Result<VaFs> {
        Self::open_on(Rc::new(StreamDevice::open_memory(buffer)))
    }

    /// Opens an image on a caller-supplied backend.
    pub fn open_from(backend: Box<dyn StreamBackend>) -> Result<VaFs> {
        Self::open_on(Rc::new(StreamDevice::from_backend(backend, false)))
    }

    fn open_on(device: Rc<StreamDevice>) -> Result<VaFs> {
        device.seek(SeekFrom::Start(0))?;
        let mut header_bytes = [0u8; IMAGE_HEADER_SIZE];
        device.read_exact(&mut header_bytes)?;
        let header = ImageHeader::read_from_bytes(&header_bytes).unwrap();

        if header.magic.get() != IMAGE_MAGIC {
            return Err(Error::Integrity("bad image magic"));
        }
        if header.version.get() != IMAGE_VERSION {
            return Err(Error::Integrity("unsupported image version"));
        }
        let descriptor_offset = header.descriptor_block_offset.get();
        let data_offset = header.data_block_offset.get();
        if (descriptor_offset as usize) < IMAGE_HEADER_SIZE || data_offset <= descriptor_offset {
            return Err(Error::Integrity("image stream offsets out of range"));
        }

        // the feature table sits between the header and the descriptor
        // stream; the cursor is already past the header
        let mut features = Vec::new();
        for _ in 0..header.feature_count.get() {
            features.push(read_feature(&device)?);
        }

        let mut descriptor =
            BlockStream::open(device.clone(), u64::from(descriptor_offset), DEFAULT_CACHE_CAPACITY)?;
        let mut data =
            BlockStream::open(device.clone(), u64::from(data_offset), DEFAULT_CACHE_CAPACITY)?;

        let filter = features.iter().find_map(|feature| match feature {
            Feature::Filter(id) => Some(*id),
            _ => None,
        });
        if filter.is_some() {
            // until callbacks are installed, every block access must
            // report the missing filter rather than decode garbage
            descriptor.set_filter(Some(Rc::new(MissingFilter)));
            data.set_filter(Some(Rc::new(MissingFilter)));
        }

        let architecture = Architecture::from(header.architecture.get());
        debug!(
            "opened image: architecture {architecture:?}, {} features, filter {filter:?}",
            features.len()
        );

        Ok(VaFs {
            mode: Mode::Read,
            architecture,
            attributes: header.attributes.get(),
            features,
            overview: Cell::new(Overview::default()),
            filter,
            image_device: device,
            descriptor: RefCell::new(descriptor),
            data: RefCell::new(data),
            root: DirectoryNode::open_root(header.root_descriptor),
        })
    }

    /// Finalizes a created image and releases the device. Opened images
    /// just release their resources.
    ///
    /// Dropping a created image without calling `close` discards it: the
    /// header is never written, so no reader will accept the artifact.
    pub fn close(mut self) -> Result<()> {
        if self.mode == Mode::Write {
            self.finalize()?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        info!("closing image: flushing descriptor tree and streams");
        {
            let mut descriptor = self.descriptor.borrow_mut();
            let device = descriptor.device().clone();
            let _lock = device.lock()?;
            self.root.flush(&mut descriptor)?;
        }

        // Final layout: [header][features][descriptor stream][data stream],
        // byte-adjacent.
        let features_len: usize = self.features.iter().map(Feature::encoded_len).sum();
        let descriptor_base = (IMAGE_HEADER_SIZE + features_len) as u64;
        self.descriptor.borrow_mut().finish(descriptor_base)?;

        let descriptor_size = self
            .descriptor
            .borrow()
            .device()
            .seek(SeekFrom::End(0))?;
        let data_base = descriptor_base + descriptor_size;
        self.data.borrow_mut().finish(data_base)?;

        let totals = self.overview.get();
        for feature in &mut self.features {
            if let Feature::Overview(overview) = feature {
                *overview = totals;
            }
        }

        let header = ImageHeader {
            magic: IMAGE_MAGIC.into(),
            version: IMAGE_VERSION.into(),
            architecture: u32::from(self.architecture).into(),
            feature_count: (self.features.len() as u16).into(),
            reserved: 0u16.into(),
            attributes: self.attributes.into(),
            descriptor_block_offset: u32::try_from(descriptor_base)
                .map_err(|_| Error::InvalidArgument("image too large"))?
                .into(),
            data_block_offset: u32::try_from(data_base)
                .map_err(|_| Error::InvalidArgument("image too large"))?
                .into(),
            root_descriptor: self.root.descriptor.get(),
        };

        self.image_device.seek(SeekFrom::Start(0))?;
        self.image_device.write_all(header.as_bytes())?;
        for feature in &self.features {
            self.image_device.write_all(&feature.to_bytes())?;
        }

        self.image_device.copy_from(self.descriptor.borrow().device())?;
        self.image_device.copy_from(self.data.borrow().device())?;

        debug!(
            "image finalized: descriptors at {descriptor_base}, data at {data_base}, \
             {} files / {} directories / {} symlinks",
            totals.files, totals.directories, totals.symlinks
        );
        Ok(())
    }

    /* Features and filters */

    /// Installs a feature record. Must happen before other operations on
    /// the image; duplicate GUIDs are rejected.
    pub fn feature_add(&mut self, feature: Feature) -> Result<()> {
        if self.features.iter().any(|f| f.guid() == feature.guid()) {
            return Err(Error::AlreadyExists(format!("{:?}", feature.guid())));
        }
        self.features.push(feature);
        Ok(())
    }

    /// Looks up an installed feature by GUID.
    pub fn feature_query(&self, guid: &Guid) -> Option<&Feature> {
        self.features.iter().find(|f| f.guid() == *guid)
    }

    /// Supplies filter callbacks for the family this image records.
    ///
    /// Fails with [`Error::InvalidArgument`] when the image uses no filter
    /// or records a different family id.
    pub fn install_filter(&self, filter: u32, ops: Rc<dyn FilterOps>) -> Result<()> {
        match self.filter {
            Some(id) if id == filter => {
                self.descriptor.borrow_mut().set_filter(Some(ops.clone()));
                self.data.borrow_mut().set_filter(Some(ops));
                Ok(())
            }
            Some(_) => Err(Error::InvalidArgument(
                "filter family does not match the image",
            )),
            None => Err(Error::InvalidArgument("image does not use a filter")),
        }
    }

    /// The filter family recorded in the image, if any.
    pub fn filter(&self) -> Option<u32> {
        self.filter
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /* Path operations */

    /// Opens a directory by path. Symlinks along the way are resolved.
    pub fn open_directory(&self, path: &str) -> Result<DirectoryHandle<'_>> {
        match resolve::walk(self, path, true)? {
            Resolved::Directory(dir) => Ok(DirectoryHandle::new(self, dir)),
            Resolved::File(file) => Err(Error::NotADirectory(file.name.clone())),
            Resolved::Symlink(link) => Err(Error::NotADirectory(link.name.clone())),
        }
    }

    /// Opens a file by path, following symlinks (at most 40).
    pub fn open_file(&self, path: &str) -> Result<FileHandle<'_>> {
        if self.mode != Mode::Read {
            return Err(Error::PermissionDenied);
        }
        match resolve::walk(self, path, true)? {
            Resolved::File(file) => Ok(FileHandle::new(self, file)),
            Resolved::Directory(dir) => Err(Error::IsADirectory(dir.name.clone())),
            Resolved::Symlink(link) => Err(Error::NoSuchEntry(link.name.clone())),
        }
    }

    /// Opens a symlink by path. The terminal component is not followed.
    pub fn open_symlink(&self, path: &str) -> Result<SymlinkHandle<'_>> {
        if self.mode != Mode::Read {
            return Err(Error::PermissionDenied);
        }
        if resolve::is_root(path) {
            return Err(Error::IsADirectory("root".into()));
        }
        match resolve::walk(self, path, false)? {
            Resolved::Symlink(link) => Ok(SymlinkHandle::new(self, link)),
            Resolved::Directory(dir) => Err(Error::IsADirectory(dir.name.clone())),
            Resolved::File(file) => Err(Error::NoSuchEntry(file.name.clone())),
        }
    }

    /// Stats a path. Like `lstat`, a terminal symlink is reported as a
    /// symlink; symlinks in intermediate positions are resolved.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        if resolve::is_root(path) {
            return Ok(Stat {
                mode: S_IFDIR | 0o755,
                size: 0,
            });
        }
        Ok(match resolve::walk(self, path, false)? {
            Resolved::Directory(dir) => Stat {
                mode: S_IFDIR | dir.permissions,
                size: 0,
            },
            Resolved::File(file) => Stat {
                mode: S_IFREG | file.permissions,
                size: u64::from(file.length.get()),
            },
            Resolved::Symlink(_) => Stat {
                mode: S_IFLNK | 0o777,
                size: 0,
            },
        })
    }

    /* Internal accessors */

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn root(&self) -> &Rc<DirectoryNode> {
        &self.root
    }

    pub(crate) fn descriptor_stream(&self) -> &RefCell<BlockStream> {
        &self.descriptor
    }

    pub(crate) fn data_stream(&self) -> &RefCell<BlockStream> {
        &self.data
    }

    pub(crate) fn bump_overview(&self, update: impl FnOnce(&mut Overview)) {
        let mut totals = self.overview.get();
        update(&mut totals);
        self.overview.set(totals);
    }
}

fn read_feature(device: &StreamDevice) -> Result<Feature> {
    let mut header_bytes = [0u8; FEATURE_HEADER_SIZE];
    device.read_exact(&mut header_bytes)?;
    let header = FeatureHeader::read_from_bytes(&header_bytes).unwrap();

    let payload_len = (header.length.get() as usize)
        .checked_sub(FEATURE_HEADER_SIZE)
        .ok_or(Error::Integrity("feature record too short"))?;
    let mut payload = vec![0u8; payload_len];
    device.read_exact(&mut payload)?;

    Feature::parse(header.guid, &payload)
}
