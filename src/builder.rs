//! The contract shared by every filesystem image builder.
//!
//! A builder is fed a sequence of node-creation calls and then asked once for
//! the finished image. The root directory must be created first, at `"/"`;
//! every other node needs its parent directory to exist already.
//!
//! # Example
//!
//! ```rust
//! use fsimage::builder::FilesystemBuilder;
//! use fsimage::ext2::Ext2FsBuilder;
//!
//! # fn main() -> fsimage::error::Result<()> {
//! let mut fs = Ext2FsBuilder::new(8 * 1024 * 1024)?;
//! fs.directory("/", 0, 0, 0o755)?;
//! fs.directory("/etc", 0, 0, 0o755)?;
//! fs.file("/etc/hostname", b"node1", 0, 0, 0o644)?;
//! fs.char_device("/console", 5, 1, 0, 0, 0o600)?;
//! let image = fs.get_filesystem_image()?;
//! assert_eq!(image.len(), 8 * 1024 * 1024);
//! # Ok(())
//! # }
//! ```

use crate::error::Result;

/// POSIX file type bits (the `S_IFMT` part of a mode).
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Permission and special bits kept from a caller-supplied mode.
pub const PERMISSION_MASK: u32 = 0o7777;

/// Kind of node a creation call inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Directory,
    File,
    SymLink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl NodeKind {
    /// `S_IFMT` bits for this kind.
    pub fn mode_bits(self) -> u32 {
        match self {
            NodeKind::Directory => S_IFDIR,
            NodeKind::File => S_IFREG,
            NodeKind::SymLink => S_IFLNK,
            NodeKind::BlockDevice => S_IFBLK,
            NodeKind::CharDevice => S_IFCHR,
            NodeKind::Fifo => S_IFIFO,
            NodeKind::Socket => S_IFSOCK,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Directory => "DIR",
            NodeKind::File => "FILE",
            NodeKind::SymLink => "LINK",
            NodeKind::BlockDevice => "BLOCK",
            NodeKind::CharDevice => "CHAR",
            NodeKind::Fifo => "FIFO",
            NodeKind::Socket => "SOCK",
        }
    }
}

/// Full mode (type bits plus permissions) for a node.
pub fn full_mode(kind: NodeKind, mode: u32) -> u32 {
    kind.mode_bits() | (mode & PERMISSION_MASK)
}

/// Current wall-clock time as a 32-bit unix timestamp.
pub fn now_timestamp() -> u32 {
    time::OffsetDateTime::now_utc().unix_timestamp().clamp(0, u32::MAX as i64) as u32
}

/// 32-bit Linux device number (`new_encode_dev`).
pub fn encode_device(major: u32, minor: u32) -> u32 {
    (minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12)
}

/// Sequential node-creation interface implemented by every image builder.
///
/// Calls must be issued in order by a single owner. Any error aborts the
/// image being built; the builder does not roll back partial state.
pub trait FilesystemBuilder {
    /// Create a directory. `"/"` creates the root and may only be called once.
    fn directory(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()>;

    /// Create a regular file with the given content.
    fn file(&mut self, path: &str, content: &[u8], user: u32, group: u32, mode: u32)
        -> Result<()>;

    /// Create a symbolic link pointing at `target`.
    fn symlink(&mut self, path: &str, target: &str, user: u32, group: u32, mode: u32)
        -> Result<()>;

    /// Create a block device node.
    fn block_device(
        &mut self,
        path: &str,
        major: u32,
        minor: u32,
        user: u32,
        group: u32,
        mode: u32,
    ) -> Result<()>;

    /// Create a character device node.
    fn char_device(
        &mut self,
        path: &str,
        major: u32,
        minor: u32,
        user: u32,
        group: u32,
        mode: u32,
    ) -> Result<()>;

    /// Create a named pipe.
    fn fifo(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()>;

    /// Create a unix socket node.
    fn socket(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()>;

    /// Serialize everything into the finished image. Build-once: a second
    /// call fails with [`FsBuildError::AlreadyBuilt`](crate::error::FsBuildError::AlreadyBuilt).
    fn get_filesystem_image(&mut self) -> Result<Vec<u8>>;
}
