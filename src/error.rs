//! Error type shared by all filesystem builders.

use std::io;

/// Broad classification of a build failure.
///
/// Every kind is fatal to the image being built; the classification only
/// tells the caller what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The node sequence or build options are inconsistent.
    Structural,
    /// A fixed-capacity allocator ran out of blocks, inodes or ids.
    ResourceExhaustion,
    /// Compression codec or host I/O failure.
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum FsBuildError {
    #[error("cannot add entry with path {path}: no parent dir")]
    NoParentDirectory { path: String },

    #[error("cannot create new root node: root directory already exists")]
    RootAlreadyExists,

    #[error("entry {path} already exists")]
    AlreadyExists { path: String },

    #[error("invalid path: {path:?}")]
    InvalidPath { path: String },

    #[error("file name too long: {name}")]
    NameTooLong { name: String },

    #[error("file {path} is too large for this filesystem ({size} bytes)")]
    FileTooLarge { path: String, size: u64 },

    #[error("unknown user/group id: {0}")]
    UnknownId(u32),

    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("unsupported filesystem format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid filesystem geometry: {0}")]
    InvalidGeometry(String),

    #[error("filesystem image was already built")]
    AlreadyBuilt,

    #[error("filesystem is full: no free blocks")]
    OutOfBlocks,

    #[error("no free inodes")]
    OutOfInodes,

    #[error("too many distinct user/group ids")]
    TooManyIds,

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FsBuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsBuildError::OutOfBlocks | FsBuildError::OutOfInodes | FsBuildError::TooManyIds => {
                ErrorKind::ResourceExhaustion
            }
            FsBuildError::Compression(_) | FsBuildError::Io(_) => ErrorKind::Io,
            _ => ErrorKind::Structural,
        }
    }

    pub(crate) fn no_parent(path: &str) -> Self {
        FsBuildError::NoParentDirectory {
            path: path.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsBuildError>;
