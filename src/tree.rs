//! The descriptor tree.
//!
//! Directories, files, and symlinks live in memory as reference-counted
//! nodes. On the write side a directory accumulates children until the
//! image is closed, when [`DirectoryNode::flush`] serializes the tree
//! post-order into the descriptor stream. On the read side directories are
//! lazy: a node starts out knowing only its descriptor position and loads
//! its children on first enumeration or lookup.

use std::{
    cell::{Cell, Ref, RefCell},
    mem::size_of,
    rc::Rc,
};

use log::{debug, trace};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    directory::EntryKind,
    error::{Error, Result},
    format::{
        BlockPosition, DescriptorHeader, DirectoryRecord, DirectoryStreamHeader, FileRecord,
        SymlinkRecord, DESCRIPTOR_DIRECTORY, DESCRIPTOR_FILE, DESCRIPTOR_HEADER_SIZE,
        DESCRIPTOR_SYMLINK, NAME_MAX, PATH_MAX,
    },
    image::VaFs,
    resolve::validate_name,
    stream::BlockStream,
};

/// A regular file entry.
pub(crate) struct FileNode {
    pub(crate) name: String,
    pub(crate) permissions: u32,
    /// Start of the file's bytes in the data stream; invalid until the
    /// first byte is written, and stays invalid for zero-length files.
    pub(crate) data: Cell<BlockPosition>,
    pub(crate) length: Cell<u32>,
}

/// A symbolic link entry.
pub(crate) struct SymlinkNode {
    pub(crate) name: String,
    pub(crate) target: String,
}

/// A directory entry, shared by the write and read paths.
pub(crate) struct DirectoryNode {
    pub(crate) name: String,
    pub(crate) permissions: u32,
    /// Position of this directory's body in the descriptor stream. Set by
    /// `flush` on the write side, parsed from the record on the read side.
    pub(crate) descriptor: Cell<BlockPosition>,
    loaded: Cell<bool>,
    children: RefCell<Vec<Node>>,
}

/// A tagged child of a directory.
#[derive(Clone)]
pub(crate) enum Node {
    File(Rc<FileNode>),
    Directory(Rc<DirectoryNode>),
    Symlink(Rc<SymlinkNode>),
}

impl Node {
    pub(crate) fn name(&self) -> &str {
        match self {
            Node::File(file) => &file.name,
            Node::Directory(dir) => &dir.name,
            Node::Symlink(link) => &link.name,
        }
    }

    pub(crate) fn kind(&self) -> EntryKind {
        match self {
            Node::File(_) => EntryKind::File,
            Node::Directory(_) => EntryKind::Directory,
            Node::Symlink(_) => EntryKind::Symlink,
        }
    }
}

impl DirectoryNode {
    /// The in-memory root of a newly created image.
    pub(crate) fn new_root() -> Rc<Self> {
        Rc::new(Self {
            name: "root".into(),
            permissions: 0o777,
            descriptor: Cell::new(BlockPosition::INVALID),
            loaded: Cell::new(true),
            children: RefCell::new(Vec::new()),
        })
    }

    /// The lazily loaded root of an opened image.
    pub(crate) fn open_root(position: BlockPosition) -> Rc<Self> {
        Rc::new(Self {
            name: "root".into(),
            permissions: 0o755,
            descriptor: Cell::new(position),
            loaded: Cell::new(false),
            children: RefCell::new(Vec::new()),
        })
    }

    fn new_child(name: String, permissions: u32) -> Rc<Self> {
        Rc::new(Self {
            name,
            permissions,
            descriptor: Cell::new(BlockPosition::INVALID),
            loaded: Cell::new(true),
            children: RefCell::new(Vec::new()),
        })
    }

    /* Write side */

    fn reject_duplicate(&self, name: &str) -> Result<()> {
        if self.children.borrow().iter().any(|c| c.name() == name) {
            return Err(Error::AlreadyExists(name.into()));
        }
        Ok(())
    }

    pub(crate) fn add_file(&self, name: &str, permissions: u32) -> Result<Rc<FileNode>> {
        validate_name(name)?;
        self.reject_duplicate(name)?;

        let file = Rc::new(FileNode {
            name: name.into(),
            permissions,
            data: Cell::new(BlockPosition::INVALID),
            length: Cell::new(0),
        });
        self.children.borrow_mut().push(Node::File(file.clone()));
        Ok(file)
    }

    pub(crate) fn add_directory(&self, name: &str, permissions: u32) -> Result<Rc<DirectoryNode>> {
        validate_name(name)?;
        self.reject_duplicate(name)?;

        let dir = DirectoryNode::new_child(name.into(), permissions);
        self.children
            .borrow_mut()
            .push(Node::Directory(dir.clone()));
        Ok(dir)
    }

    pub(crate) fn add_symlink(&self, name: &str, target: &str) -> Result<Rc<SymlinkNode>> {
        validate_name(name)?;
        if target.is_empty() {
            return Err(Error::InvalidArgument("empty symlink target"));
        }
        if target.len() > PATH_MAX {
            return Err(Error::NameTooLong);
        }
        self.reject_duplicate(name)?;

        let link = Rc::new(SymlinkNode {
            name: name.into(),
            target: target.into(),
        });
        self.children.borrow_mut().push(Node::Symlink(link.clone()));
        Ok(link)
    }

    /// Serializes this directory and every subdirectory into the descriptor
    /// stream. Children flush first so their positions are known by the
    /// time the parent emits their records.
    pub(crate) fn flush(&self, stream: &mut BlockStream) -> Result<()> {
        for child in self.children.borrow().iter() {
            if let Node::Directory(dir) = child {
                dir.flush(stream)?;
            }
        }

        self.descriptor.set(stream.position());
        let children = self.children.borrow();
        debug!(
            "flush directory {:?}: {} entries at {:?}",
            self.name,
            children.len(),
            self.descriptor.get()
        );

        let header = DirectoryStreamHeader {
            count: (children.len() as u32).into(),
        };
        stream.write_all(header.as_bytes())?;

        for child in children.iter() {
            match child {
                Node::File(file) => write_file_record(stream, file)?,
                Node::Directory(dir) => write_directory_record(stream, dir)?,
                Node::Symlink(link) => write_symlink_record(stream, link)?,
            }
        }
        Ok(())
    }

    /* Read side */

    /// Loads the directory body from the descriptor stream if this node is
    /// still in its unloaded state.
    pub(crate) fn ensure_loaded(&self, image: &VaFs) -> Result<()> {
        if self.loaded.get() {
            return Ok(());
        }

        let position = self.descriptor.get();
        if position.is_invalid() {
            self.loaded.set(true);
            return Ok(());
        }

        let mut stream = image.descriptor_stream().borrow_mut();
        let device = stream.device().clone();
        let _lock = device.lock()?;

        trace!("load directory {:?} at {position:?}", self.name);
        stream.seek(position.block.get(), u64::from(position.offset.get()))?;

        let mut head = [0u8; size_of::<DirectoryStreamHeader>()];
        stream.read_exact(&mut head)?;
        let count = DirectoryStreamHeader::read_from_bytes(&head)
            .unwrap()
            .count
            .get();
        trace!("directory {:?}: {count} entries", self.name);

        let mut children = self.children.borrow_mut();
        for _ in 0..count {
            children.push(read_record(&mut stream)?);
        }
        drop(children);

        self.loaded.set(true);
        Ok(())
    }

    /// Borrows the child list, loading it first when necessary.
    pub(crate) fn entries(&self, image: &VaFs) -> Result<Ref<'_, Vec<Node>>> {
        self.ensure_loaded(image)?;
        Ok(self.children.borrow())
    }

    /// Looks up a child by exact name.
    pub(crate) fn find(&self, image: &VaFs, name: &str) -> Result<Option<Node>> {
        let children = self.entries(image)?;
        Ok(children.iter().find(|c| c.name() == name).cloned())
    }
}

/* Record encoding */

fn write_file_record(stream: &mut BlockStream, file: &FileNode) -> Result<()> {
    let name = file.name.as_bytes();
    let total = DESCRIPTOR_HEADER_SIZE + size_of::<FileRecord>() + name.len();
    let header = DescriptorHeader {
        kind: DESCRIPTOR_FILE.into(),
        length: (total as u16).into(),
    };
    let record = FileRecord {
        data: file.data.get(),
        file_length: file.length.get().into(),
        permissions: file.permissions.into(),
    };
    stream.write_all(header.as_bytes())?;
    stream.write_all(record.as_bytes())?;
    stream.write_all(name)
}

fn write_directory_record(stream: &mut BlockStream, dir: &DirectoryNode) -> Result<()> {
    let name = dir.name.as_bytes();
    let total = DESCRIPTOR_HEADER_SIZE + size_of::<DirectoryRecord>() + name.len();
    let header = DescriptorHeader {
        kind: DESCRIPTOR_DIRECTORY.into(),
        length: (total as u16).into(),
    };
    let record = DirectoryRecord {
        descriptor: dir.descriptor.get(),
        permissions: dir.permissions.into(),
    };
    stream.write_all(header.as_bytes())?;
    stream.write_all(record.as_bytes())?;
    stream.write_all(name)
}

fn write_symlink_record(stream: &mut BlockStream, link: &SymlinkNode) -> Result<()> {
    let name = link.name.as_bytes();
    let target = link.target.as_bytes();
    let total = DESCRIPTOR_HEADER_SIZE + size_of::<SymlinkRecord>() + name.len() + target.len();
    let header = DescriptorHeader {
        kind: DESCRIPTOR_SYMLINK.into(),
        length: (total as u16).into(),
    };
    let record = SymlinkRecord {
        name_length: (name.len() as u16).into(),
        target_length: (target.len() as u16).into(),
    };
    stream.write_all(header.as_bytes())?;
    stream.write_all(record.as_bytes())?;
    stream.write_all(name)?;
    stream.write_all(target)
}

/* Record parsing */

fn read_string(stream: &mut BlockStream, length: usize, max: usize) -> Result<String> {
    if length > max {
        return Err(Error::Integrity("descriptor string too long"));
    }
    let mut bytes = vec![0u8; length];
    stream.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| Error::Integrity("descriptor string is not utf-8"))
}

fn read_record(stream: &mut BlockStream) -> Result<Node> {
    let mut head = [0u8; DESCRIPTOR_HEADER_SIZE];
    stream.read_exact(&mut head)?;
    let head = DescriptorHeader::read_from_bytes(&head).unwrap();
    let length = head.length.get() as usize;

    match head.kind.get() {
        DESCRIPTOR_FILE => {
            let mut body = [0u8; size_of::<FileRecord>()];
            stream.read_exact(&mut body)?;
            let record = FileRecord::read_from_bytes(&body).unwrap();

            let fixed = DESCRIPTOR_HEADER_SIZE + size_of::<FileRecord>();
            let name_len = length
                .checked_sub(fixed)
                .ok_or(Error::Integrity("file descriptor too short"))?;
            let name = read_string(stream, name_len, NAME_MAX)?;

            Ok(Node::File(Rc::new(FileNode {
                name,
                permissions: record.permissions.get(),
                data: Cell::new(record.data),
                length: Cell::new(record.file_length.get()),
            })))
        }
        DESCRIPTOR_DIRECTORY => {
            let mut body = [0u8; size_of::<DirectoryRecord>()];
            stream.read_exact(&mut body)?;
            let record = DirectoryRecord::read_from_bytes(&body).unwrap();

            let fixed = DESCRIPTOR_HEADER_SIZE + size_of::<DirectoryRecord>();
            let name_len = length
                .checked_sub(fixed)
                .ok_or(Error::Integrity("directory descriptor too short"))?;
            let name = read_string(stream, name_len, NAME_MAX)?;

            Ok(Node::Directory(Rc::new(DirectoryNode {
                name,
                permissions: record.permissions.get(),
                descriptor: Cell::new(record.descriptor),
                loaded: Cell::new(false),
                children: RefCell::new(Vec::new()),
            })))
        }
        DESCRIPTOR_SYMLINK => {
            let mut body = [0u8; size_of::<SymlinkRecord>()];
            stream.read_exact(&mut body)?;
            let record = SymlinkRecord::read_from_bytes(&body).unwrap();

            let name_len = record.name_length.get() as usize;
            let target_len = record.target_length.get() as usize;
            let fixed = DESCRIPTOR_HEADER_SIZE + size_of::<SymlinkRecord>();
            if length != fixed + name_len + target_len {
                return Err(Error::Integrity("symlink descriptor length mismatch"));
            }

            let name = read_string(stream, name_len, NAME_MAX)?;
            let target = read_string(stream, target_len, PATH_MAX)?;

            Ok(Node::Symlink(Rc::new(SymlinkNode { name, target })))
        }
        _ => Err(Error::Integrity("unknown descriptor type")),
    }
}
