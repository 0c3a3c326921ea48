//! On-disk inode records.
//!
//! Every record starts with the same 16-byte header; the body depends on the
//! inode type. Compact ("basic") forms are used unless a field overflows,
//! then the extended form is chosen.

use std::mem::size_of;

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::builder::NodeKind;

pub const BASIC_DIRECTORY: u16 = 1;
pub const BASIC_FILE: u16 = 2;
pub const BASIC_SYMLINK: u16 = 3;
pub const BASIC_BLOCK_DEVICE: u16 = 4;
pub const BASIC_CHAR_DEVICE: u16 = 5;
pub const BASIC_FIFO: u16 = 6;
pub const BASIC_SOCKET: u16 = 7;
pub const EXTENDED_DIRECTORY: u16 = 8;
pub const EXTENDED_FILE: u16 = 9;

pub const NO_FRAGMENT: u32 = 0xFFFF_FFFF;
pub const NO_XATTR: u32 = 0xFFFF_FFFF;
/// Set in a data block size when the block is stored raw.
pub const DATA_UNCOMPRESSED: u32 = 1 << 24;

#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct InodeHeader {
    pub inode_type: U16,
    pub permissions: U16,
    pub uid_idx: U16,
    pub gid_idx: U16,
    pub mtime: U32,
    pub inode_number: U32,
}

#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct BasicDirectory {
    pub start_block: U32,
    pub nlink: U32,
    pub file_size: U16,
    pub offset: U16,
    pub parent_inode: U32,
}

#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ExtendedDirectory {
    pub nlink: U32,
    pub file_size: U32,
    pub start_block: U32,
    pub parent_inode: U32,
    pub index_count: U16,
    pub offset: U16,
    pub xattr_idx: U32,
}

/// Followed by one `u32` per full data block.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct BasicFile {
    pub blocks_start: U32,
    pub frag_index: U32,
    pub block_offset: U32,
    pub file_size: U32,
}

#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ExtendedFile {
    pub blocks_start: U64,
    pub file_size: U64,
    pub sparse: U64,
    pub nlink: U32,
    pub frag_index: U32,
    pub block_offset: U32,
    pub xattr_idx: U32,
}

/// Followed by the target bytes.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct BasicSymlink {
    pub nlink: U32,
    pub target_size: U32,
}

#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct BasicDevice {
    pub nlink: U32,
    pub rdev: U32,
}

#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct BasicIpc {
    pub nlink: U32,
}

pub const HEADER_SIZE: usize = size_of::<InodeHeader>();
pub const BASIC_DIRECTORY_SIZE: usize = HEADER_SIZE + size_of::<BasicDirectory>();
pub const EXTENDED_DIRECTORY_SIZE: usize = HEADER_SIZE + size_of::<ExtendedDirectory>();

/// Field offsets inside directory records, used when patching them.
pub mod dir_fields {
    use super::{BasicDirectory, ExtendedDirectory, HEADER_SIZE};
    use std::mem::offset_of;

    pub const BASIC_START_BLOCK: usize = HEADER_SIZE + offset_of!(BasicDirectory, start_block);
    pub const BASIC_FILE_SIZE: usize = HEADER_SIZE + offset_of!(BasicDirectory, file_size);
    pub const BASIC_OFFSET: usize = HEADER_SIZE + offset_of!(BasicDirectory, offset);
    pub const EXT_FILE_SIZE: usize = HEADER_SIZE + offset_of!(ExtendedDirectory, file_size);
    pub const EXT_START_BLOCK: usize = HEADER_SIZE + offset_of!(ExtendedDirectory, start_block);
    pub const EXT_OFFSET: usize = HEADER_SIZE + offset_of!(ExtendedDirectory, offset);
}

/// Basic inode type used in directory entries.
pub fn basic_type(kind: NodeKind) -> u16 {
    match kind {
        NodeKind::Directory => BASIC_DIRECTORY,
        NodeKind::File => BASIC_FILE,
        NodeKind::SymLink => BASIC_SYMLINK,
        NodeKind::BlockDevice => BASIC_BLOCK_DEVICE,
        NodeKind::CharDevice => BASIC_CHAR_DEVICE,
        NodeKind::Fifo => BASIC_FIFO,
        NodeKind::Socket => BASIC_SOCKET,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeBody {
    Directory {
        extended: bool,
        start_block: u32,
        nlink: u32,
        file_size: u32,
        block_offset: u16,
        parent_inode: u32,
    },
    File {
        blocks_start: u64,
        file_size: u64,
        fragment_index: u32,
        fragment_offset: u32,
        block_sizes: Vec<u32>,
    },
    SymLink {
        target: Vec<u8>,
    },
    Device {
        rdev: u32,
    },
    Ipc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub kind: NodeKind,
    pub permissions: u16,
    pub uid_index: u16,
    pub gid_index: u16,
    pub mtime: u32,
    pub inode_number: u32,
    pub body: InodeBody,
}

impl Inode {
    pub fn inode_type(&self) -> u16 {
        match &self.body {
            InodeBody::Directory { extended: true, .. } => EXTENDED_DIRECTORY,
            InodeBody::File {
                blocks_start,
                file_size,
                ..
            } if needs_extended_file(*blocks_start, *file_size) => EXTENDED_FILE,
            _ => basic_type(self.kind),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = InodeHeader {
            inode_type: U16::new(self.inode_type()),
            permissions: U16::new(self.permissions),
            uid_idx: U16::new(self.uid_index),
            gid_idx: U16::new(self.gid_index),
            mtime: U32::new(self.mtime),
            inode_number: U32::new(self.inode_number),
        };
        let mut out = header.as_bytes().to_vec();

        match &self.body {
            InodeBody::Directory {
                extended: false,
                start_block,
                nlink,
                file_size,
                block_offset,
                parent_inode,
            } => {
                let body = BasicDirectory {
                    start_block: U32::new(*start_block),
                    nlink: U32::new(*nlink),
                    file_size: U16::new(*file_size as u16),
                    offset: U16::new(*block_offset),
                    parent_inode: U32::new(*parent_inode),
                };
                out.extend_from_slice(body.as_bytes());
            }
            InodeBody::Directory {
                extended: true,
                start_block,
                nlink,
                file_size,
                block_offset,
                parent_inode,
            } => {
                let body = ExtendedDirectory {
                    nlink: U32::new(*nlink),
                    file_size: U32::new(*file_size),
                    start_block: U32::new(*start_block),
                    parent_inode: U32::new(*parent_inode),
                    index_count: U16::new(0),
                    offset: U16::new(*block_offset),
                    xattr_idx: U32::new(NO_XATTR),
                };
                out.extend_from_slice(body.as_bytes());
            }
            InodeBody::File {
                blocks_start,
                file_size,
                fragment_index,
                fragment_offset,
                block_sizes,
            } => {
                if needs_extended_file(*blocks_start, *file_size) {
                    let body = ExtendedFile {
                        blocks_start: U64::new(*blocks_start),
                        file_size: U64::new(*file_size),
                        sparse: U64::new(0),
                        nlink: U32::new(1),
                        frag_index: U32::new(*fragment_index),
                        block_offset: U32::new(*fragment_offset),
                        xattr_idx: U32::new(NO_XATTR),
                    };
                    out.extend_from_slice(body.as_bytes());
                } else {
                    let body = BasicFile {
                        blocks_start: U32::new(*blocks_start as u32),
                        frag_index: U32::new(*fragment_index),
                        block_offset: U32::new(*fragment_offset),
                        file_size: U32::new(*file_size as u32),
                    };
                    out.extend_from_slice(body.as_bytes());
                }
                let sizes: Vec<U32> = block_sizes.iter().copied().map(U32::new).collect();
                out.extend_from_slice(sizes.as_bytes());
            }
            InodeBody::SymLink { target } => {
                let body = BasicSymlink {
                    nlink: U32::new(1),
                    target_size: U32::new(target.len() as u32),
                };
                out.extend_from_slice(body.as_bytes());
                out.extend_from_slice(target);
            }
            InodeBody::Device { rdev } => {
                let body = BasicDevice {
                    nlink: U32::new(1),
                    rdev: U32::new(*rdev),
                };
                out.extend_from_slice(body.as_bytes());
            }
            InodeBody::Ipc => {
                out.extend_from_slice(BasicIpc { nlink: U32::new(1) }.as_bytes());
            }
        }
        out
    }
}

fn needs_extended_file(blocks_start: u64, file_size: u64) -> bool {
    blocks_start > u32::MAX as u64 || file_size > u32::MAX as u64
}
