//! ext2 image builder.
//!
//! The image is a fixed-size buffer laid out at construction time: every
//! block group gets a superblock copy, a descriptor-table copy, a block
//! bitmap, an inode bitmap and its inode table, all pre-marked busy. Data
//! blocks are then handed out monotonically as nodes are added. Directory
//! contents are only packed and written when the image is finalized, since
//! entries keep arriving until then.
//!
//! # Example
//!
//! ```rust
//! use fsimage::builder::FilesystemBuilder;
//! use fsimage::ext2::Ext2FsBuilder;
//!
//! # fn main() -> fsimage::error::Result<()> {
//! let mut fs = Ext2FsBuilder::with_timestamp(4 * 1024 * 1024, 0)?;
//! fs.directory("/", 0, 0, 0o755)?;
//! fs.symlink("/sh", "/bin/busybox", 0, 0, 0o777)?;
//! let image = fs.get_filesystem_image()?;
//! assert_eq!(&image[1024 + 56..1024 + 58], &[0x53, 0xef]);
//! # Ok(())
//! # }
//! ```

mod block_map;
pub mod structures;

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info};

use crate::builder::{full_mode, now_timestamp, FilesystemBuilder, NodeKind};
use crate::codec::ByteArena;
use crate::error::{FsBuildError, Result};
use crate::path;

pub use block_map::BlockMap;
use structures::*;

const POINTERS_PER_BLOCK: u32 = BLOCK_SIZE / 4;
const SECTORS_PER_BLOCK: u32 = BLOCK_SIZE / 512;

/// Group count and derived sizes for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub blocks_count: u32,
    pub group_count: u32,
    /// Blocks taken by one copy of the group descriptor table.
    pub gdt_blocks: u32,
}

impl Geometry {
    /// Compute the layout for an image of `disk_size` bytes.
    ///
    /// A trailing group too small to hold its own metadata plus one data
    /// block is dropped; the bytes it would have covered stay unused.
    pub fn for_disk_size(disk_size: u64) -> Result<Self> {
        let total = disk_size / BLOCK_SIZE as u64;
        let mut blocks = u32::try_from(total).map_err(|_| {
            FsBuildError::InvalidGeometry(format!("{disk_size} bytes exceeds 2^32 blocks"))
        })?;
        let mut groups = blocks.saturating_sub(FIRST_DATA_BLOCK).div_ceil(BLOCKS_PER_GROUP);

        while groups > 0 {
            let gdt_blocks = (groups * GROUP_DESCRIPTOR_SIZE).div_ceil(BLOCK_SIZE);
            let geometry = Geometry {
                blocks_count: blocks,
                group_count: groups,
                gdt_blocks,
            };
            let last = groups - 1;
            if geometry.group_end(last) - geometry.group_start(last) > geometry.overhead() {
                return Ok(geometry);
            }
            groups -= 1;
            blocks = FIRST_DATA_BLOCK + groups * BLOCKS_PER_GROUP;
        }

        Err(FsBuildError::InvalidGeometry(format!(
            "{disk_size} bytes is too small for an ext2 image"
        )))
    }

    /// Metadata blocks at the head of every group.
    pub fn overhead(&self) -> u32 {
        1 + self.gdt_blocks + 2 + inode_table_blocks()
    }

    pub fn inodes_count(&self) -> u32 {
        self.group_count * INODES_PER_GROUP
    }

    pub fn group_start(&self, group: u32) -> u32 {
        FIRST_DATA_BLOCK + group * BLOCKS_PER_GROUP
    }

    /// One past the last block of `group`.
    pub fn group_end(&self, group: u32) -> u32 {
        (self.group_start(group) + BLOCKS_PER_GROUP).min(self.blocks_count)
    }

    pub fn group_of_block(&self, block: u32) -> u32 {
        (block - FIRST_DATA_BLOCK) / BLOCKS_PER_GROUP
    }

    /// Whether `block` holds group metadata rather than data.
    pub fn is_overhead(&self, block: u32) -> bool {
        block - self.group_start(self.group_of_block(block)) < self.overhead()
    }

    fn block_bitmap(&self, group: u32) -> u32 {
        self.group_start(group) + 1 + self.gdt_blocks
    }

    fn inode_bitmap(&self, group: u32) -> u32 {
        self.block_bitmap(group) + 1
    }

    fn inode_table(&self, group: u32) -> u32 {
        self.inode_bitmap(group) + 1
    }
}

/// Image buffer plus the allocators that hand out its blocks and inodes.
/// Allocator positions to return to when a node cannot be completed.
#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    next_block: u32,
    next_inode: u32,
}

struct Disk {
    image: ByteArena,
    geometry: Geometry,
    superblock: Superblock,
    groups: Vec<GroupDescriptor>,
    block_map: BlockMap,
    next_block: u32,
    next_inode: u32,
}

impl Disk {
    fn new(disk_size: u64, geometry: Geometry, timestamp: u32) -> Result<Self> {
        let len = usize::try_from(disk_size).map_err(|_| {
            FsBuildError::InvalidGeometry(format!("{disk_size} bytes does not fit in memory"))
        })?;
        let mut block_map = BlockMap::new(geometry.blocks_count);
        block_map.mark_busy(0);

        let mut groups = Vec::with_capacity(geometry.group_count as usize);
        for group in 0..geometry.group_count {
            let start = geometry.group_start(group);
            for block in start..start + geometry.overhead() {
                block_map.mark_busy(block);
            }
            groups.push(GroupDescriptor {
                block_bitmap: geometry.block_bitmap(group),
                inode_bitmap: geometry.inode_bitmap(group),
                inode_table: geometry.inode_table(group),
                free_blocks_count: 0,
                free_inodes_count: INODES_PER_GROUP as u16,
                used_dirs_count: 0,
            });
        }

        let mut disk = Disk {
            image: ByteArena::zeroed(len),
            geometry,
            superblock: Superblock::new(geometry.blocks_count, geometry.group_count, timestamp),
            groups,
            block_map,
            next_block: geometry.group_start(0) + geometry.overhead(),
            next_inode: FIRST_INO,
        };
        disk.init_bitmaps();
        Ok(disk)
    }

    fn init_bitmaps(&mut self) {
        let bits_per_block = BLOCK_SIZE * 8;
        let mut free_total = 0;

        for group in 0..self.geometry.group_count {
            let start = self.geometry.group_start(group);
            let end = self.geometry.group_end(group);
            let bitmap = self.groups[group as usize].block_bitmap;

            for block in start..end {
                if !self.block_map.is_free(block) {
                    self.set_bit(bitmap, block - start);
                }
            }
            for bit in (end - start)..bits_per_block {
                self.set_bit(bitmap, bit);
            }

            let inode_bitmap = self.groups[group as usize].inode_bitmap;
            for bit in INODES_PER_GROUP..bits_per_block {
                self.set_bit(inode_bitmap, bit);
            }

            let free = self.block_map.count_free(start, end);
            self.groups[group as usize].free_blocks_count = free as u16;
            free_total += free;
        }
        self.superblock.free_blocks_count = free_total;

        for ino in 1..FIRST_INO {
            self.mark_inode(ino);
        }
        self.groups[0].free_inodes_count -= (FIRST_INO - 1) as u16;
    }

    fn set_bit(&mut self, bitmap_block: u32, bit: u32) {
        let offset = block_offset(bitmap_block) + (bit / 8) as usize;
        let byte = self.image.read_u8(offset);
        self.image.write_u8(offset, byte | (1 << (bit % 8)));
    }

    fn clear_bit(&mut self, bitmap_block: u32, bit: u32) {
        let offset = block_offset(bitmap_block) + (bit / 8) as usize;
        let byte = self.image.read_u8(offset);
        self.image.write_u8(offset, byte & !(1 << (bit % 8)));
    }

    fn mark_inode(&mut self, index: u32) {
        let group = ((index - 1) / INODES_PER_GROUP) as usize;
        let bitmap = self.groups[group].inode_bitmap;
        self.set_bit(bitmap, (index - 1) % INODES_PER_GROUP);
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            next_block: self.next_block,
            next_inode: self.next_inode,
        }
    }

    /// Free every inode and data block handed out since `to`.
    ///
    /// Allocation is monotonic, so everything in between belongs to the
    /// failed node except group metadata the block cursor skipped over.
    fn rollback(&mut self, to: Checkpoint) {
        for block in to.next_block..self.next_block {
            if !self.geometry.is_overhead(block) {
                self.release_block(block);
            }
        }
        for index in to.next_inode..self.next_inode {
            self.release_inode(index);
        }
        self.next_block = to.next_block;
        self.next_inode = to.next_inode;
    }

    fn release_inode(&mut self, index: u32) {
        let group = ((index - 1) / INODES_PER_GROUP) as usize;
        let bitmap = self.groups[group].inode_bitmap;
        self.clear_bit(bitmap, (index - 1) % INODES_PER_GROUP);
        self.groups[group].free_inodes_count += 1;
        self.superblock.free_inodes_count += 1;
    }

    fn release_block(&mut self, block: u32) {
        self.block_map.mark_free(block);
        self.image
            .write_bytes(block_offset(block), &[0; BLOCK_SIZE as usize]);

        let group = self.geometry.group_of_block(block);
        let start = self.geometry.group_start(group);
        let bitmap = self.groups[group as usize].block_bitmap;
        self.clear_bit(bitmap, block - start);
        self.groups[group as usize].free_blocks_count += 1;
        self.superblock.free_blocks_count += 1;
    }

    /// Hand out the next non-reserved inode index.
    fn allocate_inode(&mut self) -> Result<u32> {
        let index = self.next_inode;
        if index > self.superblock.inodes_count {
            return Err(FsBuildError::OutOfInodes);
        }
        self.next_inode += 1;
        self.mark_inode(index);
        let group = ((index - 1) / INODES_PER_GROUP) as usize;
        self.groups[group].free_inodes_count -= 1;
        self.superblock.free_inodes_count -= 1;
        Ok(index)
    }

    fn count_directory(&mut self, index: u32) {
        let group = ((index - 1) / INODES_PER_GROUP) as usize;
        self.groups[group].used_dirs_count += 1;
    }

    fn allocate_block(&mut self) -> Result<u32> {
        let end = self.geometry.blocks_count;
        while self.next_block < end && !self.block_map.is_free(self.next_block) {
            self.next_block += 1;
        }
        if self.next_block >= end {
            return Err(FsBuildError::OutOfBlocks);
        }

        let block = self.next_block;
        self.next_block += 1;
        self.block_map.mark_busy(block);

        let group = self.geometry.group_of_block(block);
        let start = self.geometry.group_start(group);
        let bitmap = self.groups[group as usize].block_bitmap;
        self.set_bit(bitmap, block - start);
        self.groups[group as usize].free_blocks_count -= 1;
        self.superblock.free_blocks_count -= 1;
        Ok(block)
    }

    /// Write `content` into freshly allocated blocks owned by `inode`.
    fn set_content(&mut self, inode: &mut Inode, content: &[u8]) -> Result<()> {
        for chunk in content.chunks(BLOCK_SIZE as usize) {
            let block = self.allocate_block()?;
            self.image.write_bytes(block_offset(block), chunk);
            self.add_block_to_inode(inode, block)?;
        }
        inode.size = content.len() as u32;
        Ok(())
    }

    /// Append data block `block` to the inode's block list, growing the
    /// indirect trees as needed.
    fn add_block_to_inode(&mut self, inode: &mut Inode, block: u32) -> Result<()> {
        let mut index = inode.data_blocks;

        if index < DIRECT_BLOCKS {
            inode.block[index as usize] = block;
        } else {
            index -= DIRECT_BLOCKS;
            let mut placed = false;
            for (slot, level) in [(IND_BLOCK, 1), (DIND_BLOCK, 2), (TIND_BLOCK, 3)] {
                let capacity = POINTERS_PER_BLOCK.pow(level);
                if index < capacity {
                    if index == 0 {
                        inode.block[slot] = self.allocate_block()?;
                        inode.blocks += SECTORS_PER_BLOCK;
                    }
                    let table = inode.block[slot];
                    self.fill_indirect_table(inode, table, index, level, block)?;
                    placed = true;
                    break;
                }
                index -= capacity;
            }
            if !placed {
                return Err(FsBuildError::FileTooLarge {
                    path: format!("inode {}", inode.index),
                    size: inode.size as u64,
                });
            }
        }

        inode.data_blocks += 1;
        inode.blocks += SECTORS_PER_BLOCK;
        Ok(())
    }

    /// Store `block` at position `offset` of the tree rooted at `table`,
    /// which has `level` levels of indirection below it.
    fn fill_indirect_table(
        &mut self,
        inode: &mut Inode,
        table: u32,
        offset: u32,
        level: u32,
        block: u32,
    ) -> Result<()> {
        let base = block_offset(table);
        if level == 1 {
            self.image.write_u32(base + offset as usize * 4, block);
            return Ok(());
        }

        let per_entry = POINTERS_PER_BLOCK.pow(level - 1);
        let slot = base + (offset / per_entry) as usize * 4;
        let nested = offset % per_entry;
        let sub_table = if nested == 0 {
            let sub_table = self.allocate_block()?;
            self.image.write_u32(slot, sub_table);
            inode.blocks += SECTORS_PER_BLOCK;
            sub_table
        } else {
            self.image.read_u32(slot)
        };
        self.fill_indirect_table(inode, sub_table, nested, level - 1, block)
    }

    fn write_inode(&mut self, inode: &Inode) {
        let group = ((inode.index - 1) / INODES_PER_GROUP) as usize;
        let slot = (inode.index - 1) % INODES_PER_GROUP;
        let offset = block_offset(self.groups[group].inode_table) + (slot * INODE_SIZE) as usize;
        self.image.write_bytes(offset, &inode.to_bytes());
    }

    /// Write the primary superblock and descriptor table plus one backup of
    /// each at the head of every group.
    fn write_metadata(&mut self) {
        let table: Vec<u8> = self.groups.iter().flat_map(|gd| gd.to_bytes()).collect();
        for group in 0..self.geometry.group_count {
            let start = self.geometry.group_start(group);
            let mut superblock = self.superblock.clone();
            superblock.block_group_nr = group as u16;
            self.image.write_bytes(block_offset(start), &superblock.to_bytes());
            self.image.write_bytes(block_offset(start + 1), &table);
        }
    }
}

fn block_offset(block: u32) -> usize {
    block as usize * BLOCK_SIZE as usize
}

/// A directory whose content is written at finalization.
#[derive(Debug)]
struct BuilderDirectory {
    inode: u32,
    entries: Vec<DirEntry>,
    names: HashSet<String>,
}

impl BuilderDirectory {
    fn new(inode: u32, parent: u32) -> Self {
        let mut dir = Self {
            inode,
            entries: Vec::new(),
            names: HashSet::new(),
        };
        dir.push(DirEntry::new(inode, NodeKind::Directory, "."));
        dir.push(DirEntry::new(parent, NodeKind::Directory, ".."));
        dir
    }

    fn push(&mut self, entry: DirEntry) {
        self.names.insert(entry.name.clone());
        self.entries.push(entry);
    }
}

/// Builds an ext2 image of a fixed size.
pub struct Ext2FsBuilder {
    disk: Disk,
    inodes: BTreeMap<u32, Inode>,
    dirs: HashMap<String, BuilderDirectory>,
    /// Directory paths in creation order, so finalization is deterministic.
    dir_order: Vec<String>,
    timestamp: u32,
    built: bool,
}

impl Ext2FsBuilder {
    /// Create a builder for an image of `disk_size` bytes, stamping nodes
    /// with the current time.
    pub fn new(disk_size: u64) -> Result<Self> {
        Self::with_timestamp(disk_size, now_timestamp())
    }

    pub fn with_timestamp(disk_size: u64, timestamp: u32) -> Result<Self> {
        let geometry = Geometry::for_disk_size(disk_size)?;
        debug!(
            "ext2: {} blocks in {} groups, {} inodes",
            geometry.blocks_count,
            geometry.group_count,
            geometry.inodes_count()
        );
        Ok(Self {
            disk: Disk::new(disk_size, geometry, timestamp)?,
            inodes: BTreeMap::new(),
            dirs: HashMap::new(),
            dir_order: Vec::new(),
            timestamp,
            built: false,
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.disk.geometry
    }

    /// Allocate an inode for a new node, let `fill` store its content and
    /// link it into its parent. When `fill` fails the inode and any blocks
    /// it took are released and the parent is left untouched.
    fn create_inode<F>(
        &mut self,
        path: &str,
        kind: NodeKind,
        user: u32,
        group: u32,
        mode: u32,
        fill: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Disk, &mut Inode) -> Result<()>,
    {
        if self.built {
            return Err(FsBuildError::AlreadyBuilt);
        }
        let path = path::normalize(path)?;
        let checkpoint = self.disk.checkpoint();

        let (index, parent_ino) = match path::parent_dir_path(&path) {
            None => {
                if kind != NodeKind::Directory {
                    return Err(FsBuildError::InvalidPath { path });
                }
                if self.dirs.contains_key("/") {
                    return Err(FsBuildError::RootAlreadyExists);
                }
                (ROOT_INO, ROOT_INO)
            }
            Some(parent_path) => {
                let name = path::file_name(&path);
                if name.len() > MAX_NAME_LEN {
                    return Err(FsBuildError::NameTooLong {
                        name: name.to_string(),
                    });
                }
                let parent = self
                    .dirs
                    .get(parent_path)
                    .ok_or_else(|| FsBuildError::no_parent(&path))?;
                if parent.names.contains(name) {
                    return Err(FsBuildError::AlreadyExists { path });
                }
                let parent_ino = parent.inode;
                (self.disk.allocate_inode()?, parent_ino)
            }
        };

        let mut inode = Inode::new(
            index,
            kind,
            full_mode(kind, mode),
            user,
            group,
            self.timestamp,
        );
        if let Err(err) = fill(&mut self.disk, &mut inode) {
            self.disk.rollback(checkpoint);
            return Err(err);
        }

        if let Some(parent_path) = path::parent_dir_path(&path) {
            let entry = DirEntry::new(index, kind, path::file_name(&path));
            if let Some(parent) = self.dirs.get_mut(parent_path) {
                parent.push(entry);
            }
        }
        if kind == NodeKind::Directory {
            self.disk.count_directory(index);
            self.register_directory(&path, index, parent_ino);
        }

        debug!("INode {index}: {} {path}", kind.name());
        self.inodes.insert(index, inode);
        Ok(())
    }

    fn register_directory(&mut self, path: &str, inode: u32, parent: u32) {
        self.dirs
            .insert(path.to_string(), BuilderDirectory::new(inode, parent));
        self.dir_order.push(path.to_string());
    }

    fn device(
        &mut self,
        kind: NodeKind,
        path: &str,
        major: u32,
        minor: u32,
        user: u32,
        group: u32,
        mode: u32,
    ) -> Result<()> {
        self.create_inode(path, kind, user, group, mode, |_, inode| {
            inode.set_device(major, minor);
            Ok(())
        })
    }

    fn plain_node(&mut self, kind: NodeKind, path: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.create_inode(path, kind, user, group, mode, |_, _| Ok(()))
    }
}

impl FilesystemBuilder for Ext2FsBuilder {
    fn directory(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.plain_node(NodeKind::Directory, path, user, group, mode)
    }

    fn file(&mut self, path: &str, content: &[u8], user: u32, group: u32, mode: u32) -> Result<()> {
        if content.len() as u64 > u32::MAX as u64 {
            return Err(FsBuildError::FileTooLarge {
                path: path.to_string(),
                size: content.len() as u64,
            });
        }
        self.create_inode(path, NodeKind::File, user, group, mode, |disk, inode| {
            disk.set_content(inode, content)
        })
    }

    fn symlink(&mut self, path: &str, target: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.create_inode(path, NodeKind::SymLink, user, group, mode, |disk, inode| {
            if target.len() < FAST_SYMLINK_MAX {
                inode.set_inline_data(target.as_bytes());
                Ok(())
            } else {
                disk.set_content(inode, target.as_bytes())
            }
        })
    }

    fn block_device(
        &mut self,
        path: &str,
        major: u32,
        minor: u32,
        user: u32,
        group: u32,
        mode: u32,
    ) -> Result<()> {
        self.device(NodeKind::BlockDevice, path, major, minor, user, group, mode)
    }

    fn char_device(
        &mut self,
        path: &str,
        major: u32,
        minor: u32,
        user: u32,
        group: u32,
        mode: u32,
    ) -> Result<()> {
        self.device(NodeKind::CharDevice, path, major, minor, user, group, mode)
    }

    fn fifo(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.plain_node(NodeKind::Fifo, path, user, group, mode)
    }

    fn socket(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.plain_node(NodeKind::Socket, path, user, group, mode)
    }

    fn get_filesystem_image(&mut self) -> Result<Vec<u8>> {
        if self.built {
            return Err(FsBuildError::AlreadyBuilt);
        }
        if !self.dirs.contains_key("/") {
            return Err(FsBuildError::no_parent("/"));
        }

        for dir_path in &self.dir_order {
            let Some(dir) = self.dirs.get(dir_path) else {
                continue;
            };
            let Some(inode) = self.inodes.get_mut(&dir.inode) else {
                continue;
            };
            let content = pack_directory(&dir.entries, BLOCK_SIZE as usize);
            self.disk.set_content(inode, &content)?;
            inode.links_count = dir.entries.len() as u16;
            debug!(
                "ext2: directory {dir_path} has {} entries in {} blocks",
                dir.entries.len(),
                inode.data_blocks
            );
        }

        for inode in self.inodes.values() {
            self.disk.write_inode(inode);
        }
        self.disk.write_metadata();
        self.built = true;

        let image = std::mem::take(&mut self.disk.image).into_vec();
        info!(
            "ext2: image ready, {} bytes, {} free blocks, {} free inodes",
            image.len(),
            self.disk.superblock.free_blocks_count,
            self.disk.superblock.free_inodes_count
        );
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    /// Minimal ext2 reader for verifying built images.
    struct Reader<'a> {
        image: &'a [u8],
    }

    impl<'a> Reader<'a> {
        fn u16_at(&self, off: usize) -> u16 {
            u16::from_le_bytes(self.image[off..off + 2].try_into().unwrap())
        }

        fn u32_at(&self, off: usize) -> u32 {
            u32::from_le_bytes(self.image[off..off + 4].try_into().unwrap())
        }

        fn sb(&self, field: usize) -> u32 {
            self.u32_at(SUPERBLOCK_OFFSET + field)
        }

        fn inode_offset(&self, index: u32) -> usize {
            let group = ((index - 1) / INODES_PER_GROUP) as usize;
            let gd = 2 * BLOCK_SIZE as usize + group * GROUP_DESCRIPTOR_SIZE as usize;
            let table = self.u32_at(gd + 8);
            block_offset(table) + ((index - 1) % INODES_PER_GROUP * INODE_SIZE) as usize
        }

        fn mode(&self, index: u32) -> u16 {
            self.u16_at(self.inode_offset(index))
        }

        fn size(&self, index: u32) -> u32 {
            self.u32_at(self.inode_offset(index) + 4)
        }

        fn links(&self, index: u32) -> u16 {
            self.u16_at(self.inode_offset(index) + 26)
        }

        fn sectors(&self, index: u32) -> u32 {
            self.u32_at(self.inode_offset(index) + 28)
        }

        fn ptr(&self, index: u32, slot: usize) -> u32 {
            self.u32_at(self.inode_offset(index) + 40 + slot * 4)
        }

        fn walk(&self, table: u32, level: u32, remaining: &mut usize, out: &mut Vec<u32>) {
            for i in 0..POINTERS_PER_BLOCK as usize {
                if *remaining == 0 {
                    return;
                }
                let ptr = self.u32_at(block_offset(table) + i * 4);
                if level == 1 {
                    out.push(ptr);
                    *remaining -= 1;
                } else {
                    self.walk(ptr, level - 1, remaining, out);
                }
            }
        }

        fn data_blocks(&self, index: u32) -> Vec<u32> {
            let mut remaining = (self.size(index) as usize).div_ceil(BLOCK_SIZE as usize);
            let mut out = Vec::new();
            for slot in 0..DIRECT_BLOCKS as usize {
                if remaining == 0 {
                    return out;
                }
                out.push(self.ptr(index, slot));
                remaining -= 1;
            }
            for (slot, level) in [(IND_BLOCK, 1), (DIND_BLOCK, 2), (TIND_BLOCK, 3)] {
                if remaining == 0 {
                    break;
                }
                self.walk(self.ptr(index, slot), level, &mut remaining, &mut out);
            }
            out
        }

        fn content(&self, index: u32) -> Vec<u8> {
            let size = self.size(index) as usize;
            let mut out: Vec<u8> = self
                .data_blocks(index)
                .into_iter()
                .flat_map(|b| self.image[block_offset(b)..block_offset(b + 1)].to_vec())
                .collect();
            out.truncate(size);
            out
        }

        fn entries(&self, index: u32) -> Vec<(String, u32, u8)> {
            let raw = self.content(index);
            let mut out = Vec::new();
            let mut off = 0;
            while off < raw.len() {
                let inode = u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
                let rec_len = u16::from_le_bytes(raw[off + 4..off + 6].try_into().unwrap());
                let name_len = raw[off + 6] as usize;
                let name = String::from_utf8(raw[off + 8..off + 8 + name_len].to_vec()).unwrap();
                out.push((name, inode, raw[off + 7]));
                off += rec_len as usize;
            }
            out
        }

        fn lookup(&self, path: &str) -> u32 {
            let mut ino = ROOT_INO;
            for part in path.split('/').filter(|p| !p.is_empty()) {
                ino = self
                    .entries(ino)
                    .into_iter()
                    .find(|(name, _, _)| name == part)
                    .map(|(_, i, _)| i)
                    .unwrap_or_else(|| panic!("{part} not found"));
            }
            ino
        }

        fn block_bit(&self, block: u32) -> bool {
            let group = (block - FIRST_DATA_BLOCK) / BLOCKS_PER_GROUP;
            let gd = 2 * BLOCK_SIZE as usize + (group * GROUP_DESCRIPTOR_SIZE) as usize;
            let bitmap = self.u32_at(gd);
            let bit = block - FIRST_DATA_BLOCK - group * BLOCKS_PER_GROUP;
            self.image[block_offset(bitmap) + (bit / 8) as usize] & (1 << (bit % 8)) != 0
        }
    }

    fn with_root(disk_size: u64) -> Ext2FsBuilder {
        let mut fs = Ext2FsBuilder::with_timestamp(disk_size, 1_700_000_000).unwrap();
        fs.directory("/", 0, 0, 0o755).unwrap();
        fs
    }

    /// Content of `blocks` full blocks, each tagged with its block number.
    fn tagged_content(blocks: u32) -> Vec<u8> {
        let mut content = vec![0u8; (blocks * BLOCK_SIZE) as usize];
        for i in 0..blocks {
            let off = (i * BLOCK_SIZE) as usize;
            content[off..off + 4].copy_from_slice(&i.to_le_bytes());
        }
        content
    }

    #[test]
    fn test_geometry() {
        let geometry = Geometry::for_disk_size(8 * MIB).unwrap();
        assert_eq!(geometry.group_count, 1);
        assert_eq!(geometry.blocks_count, 8192);
        assert_eq!(geometry.overhead(), 317);
        assert_eq!(geometry.inode_table(0), 5);

        let geometry = Geometry::for_disk_size(64 * MIB).unwrap();
        assert_eq!(geometry.group_count, 8);
        assert_eq!(geometry.group_start(1), 8193);

        // 8193 + 100 blocks: the second group would be too small
        let geometry = Geometry::for_disk_size((8193 + 100) * 1024).unwrap();
        assert_eq!(geometry.group_count, 1);
        assert_eq!(geometry.blocks_count, 8193);
    }

    #[test]
    fn test_too_small_image() {
        let err = Ext2FsBuilder::with_timestamp(256 * 1024, 0).err().unwrap();
        assert!(matches!(err, FsBuildError::InvalidGeometry(_)));
    }

    #[test]
    fn test_end_to_end() {
        let mut fs = with_root(8 * MIB);
        fs.directory("/etc", 0, 0, 0o755).unwrap();
        fs.file("/etc/hostname", b"node1", 0, 0, 0o644).unwrap();
        fs.char_device("/console", 5, 1, 0, 0, 0o600).unwrap();
        let image = fs.get_filesystem_image().unwrap();

        let r = Reader { image: &image };
        assert_eq!(image.len(), 8 * MIB as usize);
        assert_eq!(r.u16_at(SUPERBLOCK_OFFSET + 56), EXT2_MAGIC);
        let inodes_count = r.sb(0);
        assert_eq!(inodes_count, 2504);
        // root is pre-counted: etc, hostname and console decrement
        assert_eq!(r.sb(16), inodes_count - 3);

        let hostname = r.lookup("/etc/hostname");
        assert_eq!(hostname, 12);
        assert_eq!(r.size(hostname), 5);
        assert_eq!(r.content(hostname), b"node1");
        assert_eq!(r.mode(hostname), 0o100644);

        let console = r.lookup("/console");
        assert_eq!(r.mode(console), 0o020600);
        assert_eq!(r.ptr(console, 0), 0x0501);
    }

    #[test]
    fn test_dev_console_under_dev() {
        let mut fs = with_root(8 * MIB);
        fs.directory("/etc", 0, 0, 0o755).unwrap();
        fs.file("/etc/hostname", b"node1", 0, 0, 0o644).unwrap();
        fs.directory("/dev", 0, 0, 0o755).unwrap();
        fs.char_device("/dev/console", 5, 1, 0, 0, 0o600).unwrap();
        let image = fs.get_filesystem_image().unwrap();

        let r = Reader { image: &image };
        assert_eq!(r.sb(16), r.sb(0) - 4);
        let console = r.lookup("/dev/console");
        assert_eq!(r.ptr(console, 0), (5 << 8) | 1);
        assert_eq!(r.content(r.lookup("/etc/hostname")), b"node1");
    }

    #[test]
    fn test_group_descriptor_counts() {
        let mut fs = with_root(8 * MIB);
        fs.directory("/etc", 0, 0, 0o755).unwrap();
        fs.file("/etc/motd", &[7u8; 3000], 0, 0, 0o644).unwrap();
        let image = fs.get_filesystem_image().unwrap();

        let r = Reader { image: &image };
        let gd = 2 * BLOCK_SIZE as usize;
        let free_blocks = r.u16_at(gd + 12) as u32;
        let free_inodes = r.u16_at(gd + 14) as u32;
        let used_dirs = r.u16_at(gd + 16);

        // motd: 3 blocks, root and etc: 1 block each
        assert_eq!(free_blocks, 8191 - 317 - 5);
        assert_eq!(r.sb(12), free_blocks);
        assert_eq!(free_inodes, 2504 - 10 - 2);
        assert_eq!(used_dirs, 2);
    }

    #[test]
    fn test_reserved_inodes_marked() {
        let mut fs = with_root(8 * MIB);
        fs.file("/a", b"x", 0, 0, 0o644).unwrap();
        let image = fs.get_filesystem_image().unwrap();

        let r = Reader { image: &image };
        let gd = 2 * BLOCK_SIZE as usize;
        let bitmap = block_offset(r.u32_at(gd + 4));
        // inodes 1..=11 used
        assert_eq!(image[bitmap], 0xff);
        assert_eq!(image[bitmap + 1], 0b0000_0111);
        // padding past 2504 inodes
        assert_eq!(image[bitmap + 313], 0xff);
        assert_eq!(image[bitmap + 1023], 0xff);
    }

    #[test]
    fn test_parent_required() {
        let mut fs = with_root(8 * MIB);
        let err = fs.file("/etc/hostname", b"x", 0, 0, 0o644).unwrap_err();
        assert!(matches!(err, FsBuildError::NoParentDirectory { .. }));
        assert!(err.to_string().contains("/etc/hostname"));

        fs.directory("/etc", 0, 0, 0o755).unwrap();
        fs.file("/etc/hostname", b"x", 0, 0, 0o644).unwrap();
    }

    #[test]
    fn test_root_twice() {
        let mut fs = with_root(8 * MIB);
        let err = fs.directory("/", 0, 0, 0o755).unwrap_err();
        assert!(matches!(err, FsBuildError::RootAlreadyExists));
    }

    #[test]
    fn test_duplicate_name() {
        let mut fs = with_root(8 * MIB);
        fs.file("/init", b"#!/bin/sh", 0, 0, 0o755).unwrap();
        let err = fs.fifo("/init", 0, 0, 0o644).unwrap_err();
        assert!(matches!(err, FsBuildError::AlreadyExists { .. }));
    }

    #[test]
    fn test_build_once() {
        let mut fs = with_root(8 * MIB);
        fs.get_filesystem_image().unwrap();
        assert!(matches!(
            fs.get_filesystem_image().unwrap_err(),
            FsBuildError::AlreadyBuilt
        ));
    }

    #[test]
    fn test_indirect_thresholds() {
        // direct, first single-indirect, single-indirect, last single-indirect,
        // first double-indirect
        for blocks in [11u32, 12, 13, 268, 269, 600] {
            let mut fs = with_root(8 * MIB);
            let content = tagged_content(blocks);
            fs.file("/data", &content, 0, 0, 0o644).unwrap();
            let image = fs.get_filesystem_image().unwrap();

            let r = Reader { image: &image };
            let ino = r.lookup("/data");
            assert_eq!(r.size(ino), blocks * BLOCK_SIZE);
            assert_eq!(r.content(ino), content, "{blocks} blocks");

            let tables = match blocks {
                0..=12 => 0,
                13..=268 => 1,
                // single table, double root, and one sub-table per 256 blocks
                _ => 1 + 1 + (blocks - 268).div_ceil(POINTERS_PER_BLOCK),
            };
            assert_eq!(r.sectors(ino), (blocks + tables) * SECTORS_PER_BLOCK, "{blocks} blocks");
            if blocks <= 12 {
                assert_eq!(r.ptr(ino, IND_BLOCK), 0);
            }
            if blocks <= 268 {
                assert_eq!(r.ptr(ino, DIND_BLOCK), 0);
            } else {
                assert_ne!(r.ptr(ino, DIND_BLOCK), 0);
            }
        }
    }

    #[test]
    fn test_triple_indirect() {
        let blocks = 12 + 256 + 256 * 256 + 3;
        let mut fs = with_root(96 * MIB);
        let content = tagged_content(blocks);
        fs.file("/big", &content, 0, 0, 0o644).unwrap();
        let image = fs.get_filesystem_image().unwrap();

        let r = Reader { image: &image };
        let ino = r.lookup("/big");
        assert_ne!(r.ptr(ino, TIND_BLOCK), 0);
        let data = r.data_blocks(ino);
        assert_eq!(data.len(), blocks as usize);
        for (i, block) in data.iter().enumerate() {
            assert_eq!(r.u32_at(block_offset(*block)), i as u32);
        }
    }

    #[test]
    fn test_blocks_never_double_allocated() {
        let mut fs = with_root(16 * MIB);
        fs.directory("/lib", 0, 0, 0o755).unwrap();
        for i in 0..20 {
            fs.file(&format!("/lib/f{i}"), &tagged_content(i * 20 + 1), 0, 0, 0o644)
                .unwrap();
        }
        let image = fs.get_filesystem_image().unwrap();
        let r = Reader { image: &image };

        let mut seen = HashSet::new();
        for i in 0..20 {
            let ino = r.lookup(&format!("/lib/f{i}"));
            for block in r.data_blocks(ino) {
                assert!(block >= 318, "block {block} overlaps metadata");
                assert!(r.block_bit(block), "block {block} not marked busy");
                assert!(seen.insert(block), "block {block} allocated twice");
            }
        }
    }

    #[test]
    fn test_out_of_blocks() {
        let mut fs = with_root(MIB);
        let err = fs.file("/big", &vec![1u8; 800 * 1024], 0, 0, 0o644).unwrap_err();
        assert!(matches!(err, FsBuildError::OutOfBlocks));
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhaustion);
    }

    #[test]
    fn test_failed_file_leaves_no_trace() {
        let mut fs = with_root(MIB);
        fs.file("/before", b"kept", 0, 0, 0o644).unwrap();
        let free_blocks = fs.disk.superblock.free_blocks_count;
        let free_inodes = fs.disk.superblock.free_inodes_count;

        let err = fs.file("/big", &vec![1u8; 800 * 1024], 0, 0, 0o644).unwrap_err();
        assert!(matches!(err, FsBuildError::OutOfBlocks));

        let root = &fs.dirs["/"];
        let names: Vec<&str> = root.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "before"]);
        assert!(!root.names.contains("big"));
        assert_eq!(fs.disk.superblock.free_blocks_count, free_blocks);
        assert_eq!(fs.disk.superblock.free_inodes_count, free_inodes);

        // the name and the inode are usable again
        fs.file("/big", b"small after all", 0, 0, 0o644).unwrap();
        assert_eq!(fs.dirs["/"].entries.last().unwrap().inode, FIRST_INO + 1);
        let image = fs.get_filesystem_image().unwrap();
        assert_eq!(image.len() as u64, MIB);
    }

    #[test]
    fn test_out_of_inodes() {
        let mut fs = with_root(MIB);
        for i in 0..(INODES_PER_GROUP - 10) {
            fs.fifo(&format!("/p{i}"), 0, 0, 0o644).unwrap();
        }
        let err = fs.fifo("/one-too-many", 0, 0, 0o644).unwrap_err();
        assert!(matches!(err, FsBuildError::OutOfInodes));
    }

    #[test]
    fn test_directory_round_trip() {
        let mut fs = with_root(8 * MIB);
        fs.directory("/usr", 0, 0, 0o755).unwrap();
        fs.directory("/usr/share", 0, 0, 0o755).unwrap();
        let names: Vec<String> = (0..120).map(|i| format!("entry-with-a-long-name-{i}")).collect();
        for name in &names {
            fs.file(&format!("/usr/share/{name}"), b"", 0, 0, 0o644).unwrap();
        }
        let image = fs.get_filesystem_image().unwrap();
        let r = Reader { image: &image };

        let share = r.lookup("/usr/share");
        let usr = r.lookup("/usr");
        let entries = r.entries(share);
        assert_eq!(entries.len(), 122);
        assert_eq!(entries[0], (".".to_string(), share, 2));
        assert_eq!(entries[1], ("..".to_string(), usr, 2));
        let listed: Vec<String> = entries[2..].iter().map(|e| e.0.clone()).collect();
        assert_eq!(listed, names);
        assert!(r.size(share) > BLOCK_SIZE);
        assert_eq!(r.size(share) % BLOCK_SIZE, 0);
        assert_eq!(r.links(share), 122);
        assert_eq!(r.mode(share), 0o040755);
    }

    #[test]
    fn test_symlinks() {
        let long_target = format!("/{}", "x".repeat(100));
        let mut fs = with_root(8 * MIB);
        fs.symlink("/sh", "/bin/busybox", 0, 0, 0o777).unwrap();
        fs.symlink("/long", &long_target, 0, 0, 0o777).unwrap();
        let image = fs.get_filesystem_image().unwrap();
        let r = Reader { image: &image };

        let sh = r.lookup("/sh");
        assert_eq!(r.sectors(sh), 0);
        let off = r.inode_offset(sh) + 40;
        assert_eq!(&image[off..off + 12], b"/bin/busybox");

        let long = r.lookup("/long");
        assert_eq!(r.sectors(long), 2);
        assert_eq!(r.content(long), long_target.as_bytes());
    }

    #[test]
    fn test_backup_superblock() {
        let mut fs = with_root(16 * MIB);
        fs.file("/a", b"a", 0, 0, 0o644).unwrap();
        let image = fs.get_filesystem_image().unwrap();
        let r = Reader { image: &image };

        let backup = block_offset(BLOCKS_PER_GROUP + 1);
        assert_eq!(r.u16_at(backup + 56), EXT2_MAGIC);
        assert_eq!(r.u16_at(backup + 90), 1);
        assert_eq!(r.u32_at(backup + 12), r.sb(12));
    }
}
