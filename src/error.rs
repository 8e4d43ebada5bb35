//! Error taxonomy shared by every layer of the crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by image, stream, and handle operations.
///
/// All errors propagate to the caller; nothing in the crate retries I/O. An
/// [`Error::Integrity`] failure poisons only the operation that observed it:
/// other blocks of the same image may still read fine.
#[derive(Debug, Error)]
pub enum Error {
    /// A parameter was out of range or otherwise unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A path component or directory entry does not exist.
    #[error("entry {0:?} does not exist")]
    NoSuchEntry(String),
    /// Creation collided with an existing name, or a feature GUID was
    /// already installed.
    #[error("entry {0:?} already exists")]
    AlreadyExists(String),
    /// A non-directory was found where the path walk needed a directory.
    #[error("entry {0:?} is not a directory")]
    NotADirectory(String),
    /// A directory was found where a non-directory was expected.
    #[error("entry {0:?} is a directory")]
    IsADirectory(String),
    /// The operation is not permitted in the image's current mode, e.g.
    /// writing to an opened image or seeking a file on a write-only image.
    #[error("operation not permitted in this mode")]
    PermissionDenied,
    /// The stream device lock is held by another operation.
    #[error("device is locked by another operation")]
    WouldBlock,
    /// The on-disk image violates a format invariant: CRC mismatch,
    /// truncated block, bad magic or version, malformed descriptor.
    #[error("image integrity violation: {0}")]
    Integrity(&'static str),
    /// The image names a filter family but no callbacks are installed.
    #[error("image requires a filter that is not installed")]
    UnsupportedFilter,
    /// A name exceeded 255 bytes or a path exceeded 4096 bytes.
    #[error("name or path exceeds the permitted length")]
    NameTooLong,
    /// Symlink resolution exceeded the redirection cap.
    #[error("too many levels of symbolic links")]
    TooManyLinks,
    /// A block-stream read or seek moved past the last known byte.
    #[error("read past the end of the stream")]
    EndOfStream,
    /// An underlying device operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
