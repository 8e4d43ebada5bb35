//! Write-once, read-many block-structured archive images.
//!
//! A `vafs` image stores a directory tree of regular files, subdirectories,
//! and symbolic links in a single container file, laid out as two block
//! streams (one for descriptors, one for file data) behind a fixed header
//! and a table of GUID-tagged feature records. Blocks are independently
//! checksummed and optionally passed through a pluggable per-block filter,
//! so readers can seek-decode any block with integrity checks and images
//! can carry transparent compression without the core knowing the
//! algorithm.
//!
//! Images are produced once, sequentially, and consumed many times with
//! random-access reads. A created image accepts new entries until
//! [`VaFs::close`] finalizes the artifact; an opened image is read-only
//! for its whole life.
//!
//! ```no_run
//! # fn main() -> vafs::Result<()> {
//! use vafs::{Architecture, VaFs, VaFsConfig};
//!
//! let mut config = VaFsConfig::new();
//! config.set_architecture(Architecture::X64);
//!
//! let image = VaFs::create("initrd.vafs", &config)?;
//! let root = image.open_directory("/")?;
//! let mut file = root.create_file("hello.txt", 0o644)?;
//! file.write(b"Hi\n")?;
//! drop(file);
//! drop(root);
//! image.close()?;
//!
//! let image = VaFs::open("initrd.vafs")?;
//! let mut file = image.open_file("/hello.txt")?;
//! let mut contents = vec![0; file.length() as usize];
//! file.read(&mut contents)?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod device;
mod directory;
mod error;
mod feature;
mod file;
mod filter;
pub mod format;
mod image;
mod resolve;
mod stream;
mod symlink;
mod tree;

pub use device::StreamBackend;
pub use directory::{DirectoryHandle, Entry, EntryKind};
pub use error::{Error, Result};
pub use feature::{Feature, Overview};
pub use file::FileHandle;
pub use filter::FilterOps;
pub use format::{Architecture, Guid, FEATURE_FILTER, FEATURE_OVERVIEW, NAME_MAX, PATH_MAX};
pub use image::{VaFs, VaFsConfig};
pub use resolve::Stat;
pub use symlink::SymlinkHandle;
