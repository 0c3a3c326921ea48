//! On-disk ext2 records: superblock, block group descriptor, inode and
//! directory entry.
//!
//! Layout follows the revision 1 ("dynamic") format with 128-byte inodes.
//! All fields are little-endian.

use bitflags::bitflags;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::builder::NodeKind;
use crate::codec::align_up;

pub const BLOCK_SIZE: u32 = 1024;
/// `s_log_block_size`: block size is `1024 << LOG_BLOCK_SIZE`.
pub const LOG_BLOCK_SIZE: u32 = 0;
pub const SUPERBLOCK_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
/// With 1 KiB blocks the superblock lives in block 1, which is the first
/// block covered by group 0.
pub const FIRST_DATA_BLOCK: u32 = 1;
pub const BLOCKS_PER_GROUP: u32 = 8192;
pub const INODES_PER_GROUP: u32 = 2504;
pub const INODE_SIZE: u32 = 128;
pub const GROUP_DESCRIPTOR_SIZE: u32 = 32;
pub const EXT2_MAGIC: u16 = 0xEF53;

pub const ROOT_INO: u32 = 2;
/// First inode not reserved by the filesystem.
pub const FIRST_INO: u32 = 11;

/// Direct pointers in `i_block`.
pub const DIRECT_BLOCKS: u32 = 12;
pub const IND_BLOCK: usize = 12;
pub const DIND_BLOCK: usize = 13;
pub const TIND_BLOCK: usize = 14;
pub const N_BLOCKS: usize = 15;

/// Symlink targets shorter than this are stored inside `i_block`.
pub const FAST_SYMLINK_MAX: usize = 60;
pub const MAX_NAME_LEN: usize = 255;

const STATE_CLEAN: u16 = 1;
const ERRORS_CONTINUE: u16 = 1;
const REV_DYNAMIC: u32 = 1;
const CREATOR_OS_LINUX: u32 = 0;

bitflags! {
    /// `s_feature_compat`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompatFeatures: u32 {
        const DIR_PREALLOC = 0x0001;
        const IMAGIC_INODES = 0x0002;
        const HAS_JOURNAL = 0x0004;
        const EXT_ATTR = 0x0008;
        const RESIZE_INODE = 0x0010;
        const DIR_INDEX = 0x0020;
    }
}

bitflags! {
    /// `s_feature_incompat`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFeatures: u32 {
        const COMPRESSION = 0x0001;
        /// Directory entries carry the file type.
        const FILETYPE = 0x0002;
        const RECOVER = 0x0004;
        const JOURNAL_DEV = 0x0008;
        const META_BG = 0x0010;
    }
}

bitflags! {
    /// `s_feature_ro_compat`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoCompatFeatures: u32 {
        const SPARSE_SUPER = 0x0001;
        const LARGE_FILE = 0x0002;
        const BTREE_DIR = 0x0004;
    }
}

/// Number of inode table blocks in every group.
pub const fn inode_table_blocks() -> u32 {
    INODES_PER_GROUP * INODE_SIZE / BLOCK_SIZE
}

/// Directory entry file type (`EXT2_FT_*`).
pub fn file_type(kind: NodeKind) -> u8 {
    match kind {
        NodeKind::File => 1,
        NodeKind::Directory => 2,
        NodeKind::CharDevice => 3,
        NodeKind::BlockDevice => 4,
        NodeKind::Fifo => 5,
        NodeKind::Socket => 6,
        NodeKind::SymLink => 7,
    }
}

/// The 1024-byte on-disk superblock.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct SuperblockRecord {
    pub inodes_count: U32,
    pub blocks_count: U32,
    pub r_blocks_count: U32,
    pub free_blocks_count: U32,
    pub free_inodes_count: U32,
    pub first_data_block: U32,
    pub log_block_size: U32,
    pub log_frag_size: U32,
    pub blocks_per_group: U32,
    pub frags_per_group: U32,
    pub inodes_per_group: U32,
    pub mtime: U32,
    pub wtime: U32,
    pub mnt_count: U16,
    pub max_mnt_count: U16,
    pub magic: U16,
    pub state: U16,
    pub errors: U16,
    pub minor_rev_level: U16,
    pub lastcheck: U32,
    pub checkinterval: U32,
    pub creator_os: U32,
    pub rev_level: U32,
    pub def_resuid: U16,
    pub def_resgid: U16,
    pub first_ino: U32,
    pub inode_size: U16,
    pub block_group_nr: U16,
    pub feature_compat: U32,
    pub feature_incompat: U32,
    pub feature_ro_compat: U32,
    pub reserved: [u8; 920],
}

/// 32-byte block group descriptor.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct GroupDescriptorRecord {
    pub block_bitmap: U32,
    pub inode_bitmap: U32,
    pub inode_table: U32,
    pub free_blocks_count: U16,
    pub free_inodes_count: U16,
    pub used_dirs_count: U16,
    pub pad: U16,
    pub reserved: [u8; 12],
}

/// 128-byte revision 1 inode.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct InodeRecord {
    pub mode: U16,
    pub uid: U16,
    pub size: U32,
    pub atime: U32,
    pub ctime: U32,
    pub mtime: U32,
    pub dtime: U32,
    pub gid: U16,
    pub links_count: U16,
    pub blocks: U32,
    pub flags: U32,
    pub osd1: U32,
    pub block: [U32; N_BLOCKS],
    pub generation: U32,
    pub file_acl: U32,
    pub dir_acl: U32,
    pub faddr: U32,
    pub frag: u8,
    pub fsize: u8,
    pub pad1: U16,
    pub uid_high: U16,
    pub gid_high: U16,
    pub reserved2: U32,
}

/// Fixed part of a directory entry; the name follows.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct DirEntryHeader {
    pub inode: U32,
    pub rec_len: U16,
    pub name_len: u8,
    pub file_type: u8,
}

const _: () = {
    assert!(std::mem::size_of::<SuperblockRecord>() == SUPERBLOCK_SIZE);
    assert!(std::mem::size_of::<GroupDescriptorRecord>() == GROUP_DESCRIPTOR_SIZE as usize);
    assert!(std::mem::size_of::<InodeRecord>() == INODE_SIZE as usize);
    assert!(std::mem::size_of::<DirEntryHeader>() == 8);
};

#[derive(Debug, Clone)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub block_group_nr: u16,
    pub feature_compat: CompatFeatures,
    pub feature_incompat: IncompatFeatures,
    pub feature_ro_compat: RoCompatFeatures,
}

impl Superblock {
    pub fn new(blocks_count: u32, group_count: u32, timestamp: u32) -> Self {
        Self {
            inodes_count: group_count * INODES_PER_GROUP,
            blocks_count,
            r_blocks_count: blocks_count / 20,
            free_blocks_count: 0,
            free_inodes_count: group_count * INODES_PER_GROUP,
            wtime: timestamp,
            lastcheck: timestamp,
            block_group_nr: 0,
            feature_compat: CompatFeatures::empty(),
            feature_incompat: IncompatFeatures::FILETYPE,
            feature_ro_compat: RoCompatFeatures::empty(),
        }
    }

    pub fn to_record(&self) -> SuperblockRecord {
        SuperblockRecord {
            inodes_count: U32::new(self.inodes_count),
            blocks_count: U32::new(self.blocks_count),
            r_blocks_count: U32::new(self.r_blocks_count),
            free_blocks_count: U32::new(self.free_blocks_count),
            free_inodes_count: U32::new(self.free_inodes_count),
            first_data_block: U32::new(FIRST_DATA_BLOCK),
            log_block_size: U32::new(LOG_BLOCK_SIZE),
            log_frag_size: U32::new(LOG_BLOCK_SIZE),
            blocks_per_group: U32::new(BLOCKS_PER_GROUP),
            frags_per_group: U32::new(BLOCKS_PER_GROUP),
            inodes_per_group: U32::new(INODES_PER_GROUP),
            mtime: U32::new(0),
            wtime: U32::new(self.wtime),
            mnt_count: U16::new(0),
            max_mnt_count: U16::new(u16::MAX),
            magic: U16::new(EXT2_MAGIC),
            state: U16::new(STATE_CLEAN),
            errors: U16::new(ERRORS_CONTINUE),
            minor_rev_level: U16::new(0),
            lastcheck: U32::new(self.lastcheck),
            checkinterval: U32::new(0),
            creator_os: U32::new(CREATOR_OS_LINUX),
            rev_level: U32::new(REV_DYNAMIC),
            def_resuid: U16::new(0),
            def_resgid: U16::new(0),
            first_ino: U32::new(FIRST_INO),
            inode_size: U16::new(INODE_SIZE as u16),
            block_group_nr: U16::new(self.block_group_nr),
            feature_compat: U32::new(self.feature_compat.bits()),
            feature_incompat: U32::new(self.feature_incompat.bits()),
            feature_ro_compat: U32::new(self.feature_ro_compat.bits()),
            reserved: [0; 920],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_record().as_bytes().to_vec()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDescriptor {
    pub fn to_record(&self) -> GroupDescriptorRecord {
        GroupDescriptorRecord {
            block_bitmap: U32::new(self.block_bitmap),
            inode_bitmap: U32::new(self.inode_bitmap),
            inode_table: U32::new(self.inode_table),
            free_blocks_count: U16::new(self.free_blocks_count),
            free_inodes_count: U16::new(self.free_inodes_count),
            used_dirs_count: U16::new(self.used_dirs_count),
            pad: U16::new(0),
            reserved: [0; 12],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_record().as_bytes().to_vec()
    }
}

/// In-memory inode. Serialized into the inode table when the image is built.
#[derive(Debug, Clone)]
pub struct Inode {
    pub index: u32,
    pub kind: NodeKind,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub links_count: u16,
    /// `i_blocks`: allocated 512-byte sectors, data and indirect tables alike.
    pub blocks: u32,
    pub block: [u32; N_BLOCKS],
    /// Data blocks appended so far (not stored on disk).
    pub data_blocks: u32,
}

impl Inode {
    pub fn new(index: u32, kind: NodeKind, mode: u32, uid: u32, gid: u32, timestamp: u32) -> Self {
        Self {
            index,
            kind,
            mode: mode as u16,
            uid,
            gid,
            size: 0,
            atime: timestamp,
            ctime: timestamp,
            mtime: timestamp,
            links_count: 1,
            blocks: 0,
            block: [0; N_BLOCKS],
            data_blocks: 0,
        }
    }

    /// Store up to 60 bytes directly in `i_block` (fast symlinks).
    pub fn set_inline_data(&mut self, data: &[u8]) {
        let mut raw = [0u8; FAST_SYMLINK_MAX];
        raw[..data.len()].copy_from_slice(data);
        for (slot, chunk) in self.block.iter_mut().zip(raw.chunks_exact(4)) {
            *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        self.size = data.len() as u32;
    }

    /// Store a device number the way Linux does: the old 16-bit encoding in
    /// `i_block[0]` when it fits, the 32-bit encoding in `i_block[1]` otherwise.
    pub fn set_device(&mut self, major: u32, minor: u32) {
        if major < 256 && minor < 256 {
            self.block[0] = (major << 8) | minor;
            self.block[1] = 0;
        } else {
            self.block[0] = 0;
            self.block[1] = crate::builder::encode_device(major, minor);
        }
    }

    pub fn to_record(&self) -> InodeRecord {
        InodeRecord {
            mode: U16::new(self.mode),
            uid: U16::new(self.uid as u16),
            size: U32::new(self.size),
            atime: U32::new(self.atime),
            ctime: U32::new(self.ctime),
            mtime: U32::new(self.mtime),
            dtime: U32::new(0),
            gid: U16::new(self.gid as u16),
            links_count: U16::new(self.links_count),
            blocks: U32::new(self.blocks),
            flags: U32::new(0),
            osd1: U32::new(0),
            block: self.block.map(U32::new),
            generation: U32::new(0),
            file_acl: U32::new(0),
            dir_acl: U32::new(0),
            faddr: U32::new(0),
            frag: 0,
            fsize: 0,
            pad1: U16::new(0),
            uid_high: U16::new((self.uid >> 16) as u16),
            gid_high: U16::new((self.gid >> 16) as u16),
            reserved2: U32::new(0),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_record().as_bytes().to_vec()
    }
}

/// One directory entry before packing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub file_type: u8,
    pub name: String,
}

impl DirEntry {
    pub fn new(inode: u32, kind: NodeKind, name: &str) -> Self {
        Self {
            inode,
            file_type: file_type(kind),
            name: name.to_string(),
        }
    }

    /// Minimal record length: 8-byte header plus name, 4-byte aligned.
    pub fn record_len(&self) -> usize {
        align_up(8 + self.name.len(), 4)
    }

    fn write(&self, chunk: &mut Vec<u8>, rec_len: usize) {
        let start = chunk.len();
        let header = DirEntryHeader {
            inode: U32::new(self.inode),
            rec_len: U16::new(rec_len as u16),
            name_len: self.name.len() as u8,
            file_type: self.file_type,
        };
        chunk.extend_from_slice(header.as_bytes());
        chunk.extend_from_slice(self.name.as_bytes());
        chunk.resize(start + rec_len, 0);
    }
}

/// Pack directory entries into block-sized chunks.
///
/// Entries never span a chunk; the last entry in each chunk has its record
/// length inflated to cover the chunk's trailing slack, so every chunk is
/// exactly `block_size` bytes.
pub fn pack_directory(entries: &[DirEntry], block_size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = Vec::with_capacity(block_size);
    let mut last: Option<(usize, &DirEntry)> = None;

    for entry in entries {
        let len = entry.record_len();
        if chunk.len() + len > block_size {
            close_chunk(&mut out, &mut chunk, last.take(), block_size);
        }
        last = Some((chunk.len(), entry));
        entry.write(&mut chunk, len);
    }
    if !chunk.is_empty() {
        close_chunk(&mut out, &mut chunk, last, block_size);
    }
    out
}

fn close_chunk(
    out: &mut Vec<u8>,
    chunk: &mut Vec<u8>,
    last: Option<(usize, &DirEntry)>,
    block_size: usize,
) {
    if let Some((offset, entry)) = last {
        chunk.truncate(offset);
        entry.write(chunk, block_size - offset);
    }
    chunk.resize(block_size, 0);
    out.extend_from_slice(chunk);
    chunk.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Vec<(u32, u16, String)> {
        let mut out = Vec::new();
        let mut off = 0;
        while off < raw.len() {
            let inode = u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
            let rec_len = u16::from_le_bytes(raw[off + 4..off + 6].try_into().unwrap());
            let name_len = raw[off + 6] as usize;
            let name = String::from_utf8(raw[off + 8..off + 8 + name_len].to_vec()).unwrap();
            out.push((inode, rec_len, name));
            off += rec_len as usize;
        }
        out
    }

    #[test]
    fn test_superblock_layout() {
        let sb = Superblock::new(16384, 2, 1000);
        let raw = sb.to_bytes();

        assert_eq!(raw.len(), 1024);
        assert_eq!(u32::from_le_bytes(raw[0..4].try_into().unwrap()), 5008);
        assert_eq!(u16::from_le_bytes(raw[56..58].try_into().unwrap()), EXT2_MAGIC);
        assert_eq!(u32::from_le_bytes(raw[96..100].try_into().unwrap()), 2);

        let record = SuperblockRecord::read_from_bytes(&raw).ok().unwrap();
        assert_eq!(record.blocks_count.get(), 16384);
        assert_eq!(record.first_data_block.get(), 1);
        assert_eq!(record.blocks_per_group.get(), 8192);
        assert_eq!(record.inodes_per_group.get(), 2504);
        assert_eq!(record.first_ino.get(), 11);
        assert_eq!(record.inode_size.get(), 128);
        assert_eq!(record.wtime.get(), 1000);
        assert_eq!(
            IncompatFeatures::from_bits(record.feature_incompat.get()),
            Some(IncompatFeatures::FILETYPE)
        );
        assert_eq!(record.feature_ro_compat.get(), 0);
    }

    #[test]
    fn test_group_descriptor_and_inode_sizes() {
        let gd = GroupDescriptor {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 5,
            free_blocks_count: 100,
            free_inodes_count: 200,
            used_dirs_count: 1,
        };
        let raw = gd.to_bytes();
        assert_eq!(raw.len(), 32);
        assert_eq!(u32::from_le_bytes(raw[8..12].try_into().unwrap()), 5);
        assert_eq!(u16::from_le_bytes(raw[16..18].try_into().unwrap()), 1);

        let inode = Inode::new(12, NodeKind::File, 0o100644, 70000, 5, 0);
        let raw = inode.to_bytes();
        assert_eq!(raw.len(), 128);
        assert_eq!(u16::from_le_bytes(raw[2..4].try_into().unwrap()), 70000u32 as u16);
        assert_eq!(u16::from_le_bytes(raw[120..122].try_into().unwrap()), 1);

        let record = InodeRecord::read_from_bytes(&raw).ok().unwrap();
        assert_eq!(record.mode.get(), 0o100644);
        assert_eq!(record.gid.get(), 5);
        assert_eq!(record.links_count.get(), 1);
    }

    #[test]
    fn test_inline_symlink() {
        let mut inode = Inode::new(12, NodeKind::SymLink, 0o120777, 0, 0, 0);
        inode.set_inline_data(b"/bin/busybox");
        let raw = inode.to_bytes();
        assert_eq!(inode.size, 12);
        assert_eq!(&raw[40..52], b"/bin/busybox");
        assert_eq!(inode.blocks, 0);
    }

    #[test]
    fn test_device_encoding() {
        let mut inode = Inode::new(12, NodeKind::CharDevice, 0o020600, 0, 0, 0);
        inode.set_device(5, 1);
        assert_eq!(inode.block[0], 0x0501);

        inode.set_device(259, 300);
        assert_eq!(inode.block[0], 0);
        assert_eq!(inode.block[1], (300 & 0xff) | (259 << 8) | ((300 & !0xff) << 12));
    }

    #[test]
    fn test_pack_single_chunk() {
        let entries = vec![
            DirEntry::new(2, NodeKind::Directory, "."),
            DirEntry::new(2, NodeKind::Directory, ".."),
            DirEntry::new(11, NodeKind::File, "hostname"),
        ];
        let raw = pack_directory(&entries, 1024);
        assert_eq!(raw.len(), 1024);

        let parsed = parse(&raw);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], (2, 12, ".".to_string()));
        assert_eq!(parsed[1], (2, 12, "..".to_string()));
        assert_eq!(parsed[2], (11, 1000, "hostname".to_string()));
    }

    #[test]
    fn test_pack_spills_into_second_chunk() {
        let mut entries = vec![
            DirEntry::new(2, NodeKind::Directory, "."),
            DirEntry::new(2, NodeKind::Directory, ".."),
        ];
        // 24 bytes each: 8 header + 16 name
        for i in 0..50 {
            entries.push(DirEntry::new(11 + i, NodeKind::File, &format!("file-{i:011}")));
        }
        let raw = pack_directory(&entries, 1024);
        assert_eq!(raw.len(), 2048);

        let first = parse(&raw[..1024]);
        let second = parse(&raw[1024..]);
        assert_eq!(first.len() + second.len(), 52);
        assert_eq!(
            first.iter().map(|e| e.1 as usize).sum::<usize>(),
            1024,
            "first chunk must be filled exactly"
        );
        assert_eq!(second.iter().map(|e| e.1 as usize).sum::<usize>(), 1024);
        assert_eq!(second.last().unwrap().2, "file-00000000049");
    }
}
