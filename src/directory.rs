//! Directory handles: enumeration and per-name child operations.

use std::rc::Rc;

use crate::{
    error::{Error, Result},
    file::FileHandle,
    image::{Mode, VaFs},
    tree::{DirectoryNode, Node},
};

/// The type of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One enumerated directory entry.
#[derive(Clone, Debug)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
}

/// Handle to one directory with a monotonically advancing read index.
///
/// Enumeration order is stable for a given image but otherwise
/// unspecified; callers must not rely on any particular ordering.
pub struct DirectoryHandle<'v> {
    image: &'v VaFs,
    dir: Rc<DirectoryNode>,
    index: usize,
}

impl<'v> DirectoryHandle<'v> {
    pub(crate) fn new(image: &'v VaFs, dir: Rc<DirectoryNode>) -> Self {
        Self {
            image,
            dir,
            index: 0,
        }
    }

    /// The directory's stored permission bits.
    pub fn permissions(&self) -> u32 {
        self.dir.permissions
    }

    /// Returns the next entry and advances the index, or `None` once the
    /// directory is exhausted.
    pub fn read_entry(&mut self) -> Result<Option<Entry>> {
        let children = self.dir.entries(self.image)?;
        let Some(node) = children.get(self.index) else {
            return Ok(None);
        };
        self.index += 1;
        Ok(Some(Entry {
            name: node.name().to_owned(),
            kind: node.kind(),
        }))
    }

    fn find_required(&self, name: &str) -> Result<Node> {
        self.dir
            .find(self.image, name)?
            .ok_or_else(|| Error::NoSuchEntry(name.into()))
    }

    /// Opens a child directory by name.
    pub fn open_directory(&self, name: &str) -> Result<DirectoryHandle<'v>> {
        if self.image.mode() != Mode::Read {
            return Err(Error::PermissionDenied);
        }
        match self.find_required(name)? {
            Node::Directory(dir) => Ok(DirectoryHandle::new(self.image, dir)),
            _ => Err(Error::NotADirectory(name.into())),
        }
    }

    /// Creates a child directory. Only valid while the image is being
    /// created.
    pub fn create_directory(&self, name: &str, permissions: u32) -> Result<DirectoryHandle<'v>> {
        if self.image.mode() != Mode::Write {
            return Err(Error::PermissionDenied);
        }
        let dir = self.dir.add_directory(name, permissions)?;
        self.image.bump_overview(|totals| totals.directories += 1);
        Ok(DirectoryHandle::new(self.image, dir))
    }

    /// Opens a child file by name. The name must refer to a regular file;
    /// symlinks are not followed here (use [`VaFs::open_file`] for
    /// resolving opens).
    pub fn open_file(&self, name: &str) -> Result<FileHandle<'v>> {
        if self.image.mode() != Mode::Read {
            return Err(Error::PermissionDenied);
        }
        match self.find_required(name)? {
            Node::File(file) => Ok(FileHandle::new(self.image, file)),
            Node::Directory(_) => Err(Error::IsADirectory(name.into())),
            Node::Symlink(_) => Err(Error::InvalidArgument("entry is not a regular file")),
        }
    }

    /// Creates a child file and returns a writable handle for it.
    pub fn create_file(&self, name: &str, permissions: u32) -> Result<FileHandle<'v>> {
        if self.image.mode() != Mode::Write {
            return Err(Error::PermissionDenied);
        }
        let file = self.dir.add_file(name, permissions)?;
        self.image.bump_overview(|totals| totals.files += 1);
        Ok(FileHandle::new(self.image, file))
    }

    /// Creates a child symlink pointing at `target`.
    pub fn create_symlink(&self, name: &str, target: &str) -> Result<()> {
        if self.image.mode() != Mode::Write {
            return Err(Error::PermissionDenied);
        }
        self.dir.add_symlink(name, target)?;
        self.image.bump_overview(|totals| totals.symlinks += 1);
        Ok(())
    }

    /// Returns the raw target of a child symlink.
    pub fn read_symlink(&self, name: &str) -> Result<String> {
        if self.image.mode() != Mode::Read {
            return Err(Error::PermissionDenied);
        }
        match self.find_required(name)? {
            Node::Symlink(link) => Ok(link.target.clone()),
            _ => Err(Error::InvalidArgument("entry is not a symlink")),
        }
    }
}
