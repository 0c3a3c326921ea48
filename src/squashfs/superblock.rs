use bitflags::bitflags;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const SQUASHFS_MAGIC: u32 = 0x7371_7368;
pub const SUPERBLOCK_SIZE: usize = 96;
pub const VERSION_MAJOR: u16 = 4;
pub const VERSION_MINOR: u16 = 0;
/// Marks an absent table (xattrs).
pub const INVALID_TABLE: u64 = u64::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuperblockFlags: u16 {
        const UNCOMPRESSED_INODES = 0x0001;
        const UNCOMPRESSED_DATA = 0x0002;
        const CHECK = 0x0004;
        const UNCOMPRESSED_FRAGMENTS = 0x0008;
        const NO_FRAGMENTS = 0x0010;
        const ALWAYS_FRAGMENTS = 0x0020;
        const DUPLICATES = 0x0040;
        const EXPORTABLE = 0x0080;
        const UNCOMPRESSED_XATTRS = 0x0100;
        const NO_XATTRS = 0x0200;
        const COMPRESSOR_OPTIONS = 0x0400;
        const UNCOMPRESSED_IDS = 0x0800;
    }
}

/// The superblock as stored at offset 0.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct SuperblockRecord {
    pub magic: U32,
    pub inode_count: U32,
    pub mod_time: U32,
    pub block_size: U32,
    pub fragment_count: U32,
    pub compression: U16,
    pub block_log: U16,
    pub flags: U16,
    pub id_count: U16,
    pub version_major: U16,
    pub version_minor: U16,
    pub root_inode: U64,
    pub bytes_used: U64,
    pub id_table: U64,
    pub xattr_table: U64,
    pub inode_table: U64,
    pub directory_table: U64,
    pub fragment_table: U64,
    pub export_table: U64,
}

const _: () = assert!(std::mem::size_of::<SuperblockRecord>() == SUPERBLOCK_SIZE);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub inode_count: u32,
    pub mod_time: u32,
    pub block_size: u32,
    pub fragment_count: u32,
    pub compression_id: u16,
    pub flags: SuperblockFlags,
    pub id_count: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub xattr_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub export_table_start: u64,
}

impl Superblock {
    pub fn new(block_size: u32, compression_id: u16, mod_time: u32) -> Self {
        Self {
            inode_count: 0,
            mod_time,
            block_size,
            fragment_count: 0,
            compression_id,
            flags: SuperblockFlags::empty(),
            id_count: 0,
            root_inode: 0,
            bytes_used: 0,
            id_table_start: 0,
            xattr_table_start: INVALID_TABLE,
            inode_table_start: 0,
            directory_table_start: 0,
            fragment_table_start: 0,
            export_table_start: 0,
        }
    }

    pub fn to_record(&self) -> SuperblockRecord {
        SuperblockRecord {
            magic: U32::new(SQUASHFS_MAGIC),
            inode_count: U32::new(self.inode_count),
            mod_time: U32::new(self.mod_time),
            block_size: U32::new(self.block_size),
            fragment_count: U32::new(self.fragment_count),
            compression: U16::new(self.compression_id),
            block_log: U16::new(self.block_size.trailing_zeros() as u16),
            flags: U16::new(self.flags.bits()),
            id_count: U16::new(self.id_count),
            version_major: U16::new(VERSION_MAJOR),
            version_minor: U16::new(VERSION_MINOR),
            root_inode: U64::new(self.root_inode),
            bytes_used: U64::new(self.bytes_used),
            id_table: U64::new(self.id_table_start),
            xattr_table: U64::new(self.xattr_table_start),
            inode_table: U64::new(self.inode_table_start),
            directory_table: U64::new(self.directory_table_start),
            fragment_table: U64::new(self.fragment_table_start),
            export_table: U64::new(self.export_table_start),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_record().as_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let mut sb = Superblock::new(131072, 1, 42);
        sb.inode_count = 3;
        sb.export_table_start = 0x1234;
        sb.flags = SuperblockFlags::NO_XATTRS | SuperblockFlags::EXPORTABLE;
        let raw = sb.to_bytes();

        assert_eq!(raw.len(), SUPERBLOCK_SIZE);
        assert_eq!(&raw[0..4], b"hsqs");
        assert_eq!(u32::from_le_bytes(raw[4..8].try_into().unwrap()), 3);
        assert_eq!(u16::from_le_bytes(raw[22..24].try_into().unwrap()), 17);
        assert_eq!(u16::from_le_bytes(raw[24..26].try_into().unwrap()), 0x0280);
        assert_eq!(u16::from_le_bytes(raw[28..30].try_into().unwrap()), 4);
        assert_eq!(u64::from_le_bytes(raw[56..64].try_into().unwrap()), u64::MAX);
        assert_eq!(u64::from_le_bytes(raw[88..96].try_into().unwrap()), 0x1234);
    }

    #[test]
    fn test_record_reads_back() {
        let mut sb = Superblock::new(4096, 4, 7);
        sb.flags = SuperblockFlags::UNCOMPRESSED_INODES;
        sb.bytes_used = 8192;
        let record = SuperblockRecord::read_from_bytes(&sb.to_bytes()).ok().unwrap();

        assert_eq!(record.magic.get(), SQUASHFS_MAGIC);
        assert_eq!(record.block_log.get(), 12);
        assert_eq!(record.compression.get(), 4);
        assert_eq!(record.bytes_used.get(), 8192);
        assert_eq!(
            SuperblockFlags::from_bits(record.flags.get()),
            Some(SuperblockFlags::UNCOMPRESSED_INODES)
        );
    }
}
