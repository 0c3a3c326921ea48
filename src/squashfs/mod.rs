//! SquashFs 4.0 image builder.
//!
//! Nodes are collected in memory and only serialized by
//! [`get_filesystem_image`](FilesystemBuilder::get_filesystem_image), which
//! runs a fixed sequence of passes:
//!
//! 1. resolve uid/gid values to id table indices and group the tree into
//!    inode blocks (at most 180 inodes each, one block per group)
//! 2. pack file tails into fragment blocks
//! 3. append full data blocks, then the fragment blocks
//! 4. write the inode table (stored uncompressed)
//! 5. write the directory table and patch the directory inodes with the
//!    location of their listings
//! 6. append the fragment, export and id tables
//! 7. rewrite the superblock with the final offsets
//!
//! # Example
//!
//! ```rust
//! use fsimage::builder::FilesystemBuilder;
//! use fsimage::compression::CompressionKind;
//! use fsimage::squashfs::SquashFsBuilder;
//!
//! # fn main() -> fsimage::error::Result<()> {
//! let mut fs = SquashFsBuilder::new(CompressionKind::Gzip)?;
//! fs.directory("/", 0, 0, 0o755)?;
//! fs.file("/init", b"#!/bin/sh\n", 0, 0, 0o755)?;
//! let image = fs.get_filesystem_image()?;
//! assert_eq!(&image[..4], b"hsqs");
//! assert_eq!(image.len() % 4096, 0);
//! # Ok(())
//! # }
//! ```

pub mod fragment;
pub mod inode;
pub mod metadata;
pub mod node;
pub mod superblock;
pub mod table;

use std::collections::{HashMap, VecDeque};

use log::{debug, info};

use crate::builder::{encode_device, now_timestamp, FilesystemBuilder, NodeKind};
use crate::codec::ByteArena;
use crate::compression::{create_compressor, CompressionKind, Compressor, NoneCompressor};
use crate::error::{FsBuildError, Result};
use crate::path;

use fragment::{pack_data_block, FragmentBlock, FragmentPacker};
use inode::{dir_fields, Inode, InodeBody, NO_FRAGMENT};
use metadata::{read_uncompressed, write_uncompressed, MetadataWriter};
use node::{Node, NodeData};
use superblock::{Superblock, SuperblockFlags, SUPERBLOCK_SIZE};
use table::{append_lookup_table, build_listing, worst_case_listing_size, IdTable, ListingEntry};

pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;
pub const MIN_BLOCK_SIZE: u32 = 4096;
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;
/// Inodes written per inode-table group.
pub const MAX_NODES_PER_GROUP: usize = 180;
/// Images are padded to this multiple; `bytes_used` excludes the padding.
pub const DEVICE_BLOCK_SIZE: usize = 4096;

const ROOT: usize = 0;
/// The root directory's parent inode number.
const ROOT_PARENT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SquashFsOptions {
    pub compression: CompressionKind,
    /// Data block size, a power of two between 4 KiB and 1 MiB.
    pub block_size: u32,
    /// Modification time for every node and the superblock; now if unset.
    pub timestamp: Option<u32>,
}

impl Default for SquashFsOptions {
    fn default() -> Self {
        Self {
            compression: CompressionKind::Gzip,
            block_size: DEFAULT_BLOCK_SIZE,
            timestamp: None,
        }
    }
}

pub struct SquashFsBuilder {
    compressor: Box<dyn Compressor>,
    block_size: u32,
    timestamp: u32,
    nodes: Vec<Node>,
    by_path: HashMap<String, usize>,
    built: bool,
}

impl SquashFsBuilder {
    pub fn new(compression: CompressionKind) -> Result<Self> {
        Self::with_options(SquashFsOptions {
            compression,
            ..Default::default()
        })
    }

    pub fn with_options(options: SquashFsOptions) -> Result<Self> {
        let block_size = options.block_size;
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(FsBuildError::InvalidGeometry(format!(
                "squashfs block size {block_size} must be a power of two between 4K and 1M"
            )));
        }
        Ok(Self {
            compressor: create_compressor(options.compression, block_size)?,
            block_size,
            timestamp: options.timestamp.unwrap_or_else(now_timestamp),
            nodes: Vec::new(),
            by_path: HashMap::new(),
            built: false,
        })
    }

    fn add_node(&mut self, path: &str, kind: NodeKind, user: u32, group: u32, mode: u32) -> Result<usize> {
        if self.built {
            return Err(FsBuildError::AlreadyBuilt);
        }
        let path = path::normalize(path)?;
        let id = self.nodes.len();

        match path::parent_dir_path(&path) {
            None => {
                if kind != NodeKind::Directory {
                    return Err(FsBuildError::InvalidPath { path });
                }
                if !self.nodes.is_empty() {
                    return Err(FsBuildError::RootAlreadyExists);
                }
                self.nodes.push(Node::new(&path, "", kind, mode, user, group));
            }
            Some(parent_path) => {
                let name = path::file_name(&path);
                if name.len() > table::MAX_NAME_LEN {
                    return Err(FsBuildError::NameTooLong {
                        name: name.to_string(),
                    });
                }
                let parent = match self.by_path.get(parent_path) {
                    Some(parent) if self.nodes[*parent].is_directory() => *parent,
                    _ => return Err(FsBuildError::no_parent(&path)),
                };
                if self.by_path.contains_key(&path) {
                    return Err(FsBuildError::AlreadyExists { path });
                }
                let mut node = Node::new(&path, name, kind, mode, user, group);
                node.parent = parent;
                self.nodes.push(node);
                if let NodeData::Directory { children, .. } = &mut self.nodes[parent].data {
                    children.push(id);
                }
            }
        }

        debug!("node {id}: {} {path}", kind.name());
        self.by_path.insert(path, id);
        Ok(id)
    }

    /// Resolve every node's owner and group, in creation order.
    fn build_id_table(&self) -> Result<IdTable> {
        let mut ids = IdTable::default();
        for node in &self.nodes {
            ids.insert(node.uid)?;
            ids.insert(node.gid)?;
        }
        Ok(ids)
    }

    /// Sort directory children by name, pack them into inode groups and
    /// number inodes in group order. The root is alone in the first group and
    /// gets inode number 1. Children of successive directories share a group
    /// while the group stays within `MAX_NODES_PER_GROUP`; a directory that
    /// does not fit starts a new group and is split every
    /// `MAX_NODES_PER_GROUP` children.
    fn group_nodes(&mut self) -> Vec<Vec<usize>> {
        let mut groups = vec![vec![ROOT]];
        let mut current: Vec<usize> = Vec::new();
        let mut queue = VecDeque::from([ROOT]);

        while let Some(dir) = queue.pop_front() {
            let mut children = self.nodes[dir].children().to_vec();
            children.sort_by(|a, b| self.nodes[*a].name.cmp(&self.nodes[*b].name));

            let worst = worst_case_listing_size(children.iter().map(|c| self.nodes[*c].name.as_str()));
            if let NodeData::Directory {
                children: sorted,
                extended,
                ..
            } = &mut self.nodes[dir].data
            {
                *sorted = children.clone();
                *extended = worst + 3 > u16::MAX as usize;
            }

            if current.len() + children.len() > MAX_NODES_PER_GROUP && !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            for chunk in children.chunks(MAX_NODES_PER_GROUP) {
                if current.len() + chunk.len() > MAX_NODES_PER_GROUP {
                    groups.push(std::mem::take(&mut current));
                }
                current.extend_from_slice(chunk);
            }
            queue.extend(children.into_iter().filter(|c| self.nodes[*c].is_directory()));
        }
        if !current.is_empty() {
            groups.push(current);
        }

        for (number, id) in groups.iter().flatten().enumerate() {
            self.nodes[*id].inode_number = number as u32 + 1;
        }
        groups
    }

    fn prepare_fragments(&mut self, groups: &[Vec<usize>]) -> Result<Vec<FragmentBlock>> {
        let block_size = self.block_size as usize;
        let mut packer = FragmentPacker::new(self.compressor.as_ref(), self.block_size);
        for id in groups.iter().flatten() {
            let node = &mut self.nodes[*id];
            if let NodeData::File {
                content, fragment, ..
            } = &mut node.data
            {
                let tail = content.len() % block_size;
                if tail > 0 {
                    let placed = packer.add(&node.path, &content[content.len() - tail..])?;
                    *fragment = Some(placed);
                }
            }
        }
        packer.finish()
    }

    /// Append every file's full blocks, then the fragment blocks. Fragment
    /// starts become absolute.
    fn append_data(
        &mut self,
        image: &mut ByteArena,
        groups: &[Vec<usize>],
        fragments: &mut [FragmentBlock],
    ) -> Result<()> {
        let block_size = self.block_size as usize;
        for id in groups.iter().flatten() {
            if let NodeData::File {
                content,
                blocks_start,
                block_sizes,
                ..
            } = &mut self.nodes[*id].data
            {
                *blocks_start = image.len() as u64;
                let full = content.len() / block_size * block_size;
                for chunk in content[..full].chunks(block_size) {
                    let (stored, size) = pack_data_block(self.compressor.as_ref(), chunk)?;
                    image.append(&stored);
                    block_sizes.push(size);
                }
            }
        }

        let region = image.len() as u64;
        for fragment in fragments.iter_mut() {
            fragment.start += region;
            image.append(&fragment.stored);
        }
        debug!(
            "data: {} bytes, fragment region at {region:#x} ({} blocks)",
            image.len() - SUPERBLOCK_SIZE,
            fragments.len()
        );
        Ok(())
    }

    fn inode_record(&self, id: usize, ids: &IdTable) -> Result<Inode> {
        let node = &self.nodes[id];
        let body = match &node.data {
            NodeData::Directory {
                children,
                listing,
                listing_size,
                extended,
            } => InodeBody::Directory {
                extended: *extended,
                start_block: listing.block as u32,
                nlink: 2 + children
                    .iter()
                    .filter(|c| self.nodes[**c].is_directory())
                    .count() as u32,
                file_size: *listing_size,
                block_offset: listing.offset,
                parent_inode: if id == ROOT {
                    ROOT_PARENT
                } else {
                    self.nodes[node.parent].inode_number
                },
            },
            NodeData::File {
                content,
                blocks_start,
                block_sizes,
                fragment,
            } => InodeBody::File {
                blocks_start: *blocks_start,
                file_size: content.len() as u64,
                fragment_index: fragment.map_or(NO_FRAGMENT, |f| f.index),
                fragment_offset: fragment.map_or(0, |f| f.offset),
                block_sizes: block_sizes.clone(),
            },
            NodeData::SymLink { target } => InodeBody::SymLink {
                target: target.as_bytes().to_vec(),
            },
            NodeData::Device { rdev } => InodeBody::Device { rdev: *rdev },
            NodeData::Ipc => InodeBody::Ipc,
        };
        Ok(Inode {
            kind: node.kind,
            permissions: node.permissions,
            uid_index: ids.index_of(node.uid)?,
            gid_index: ids.index_of(node.gid)?,
            mtime: self.timestamp,
            inode_number: node.inode_number,
            body,
        })
    }

    /// Serialize the inode table, one padded block run per group.
    fn write_inode_table(&mut self, groups: &[Vec<usize>], ids: &IdTable) -> Result<Vec<u8>> {
        let none = NoneCompressor;
        let mut writer = MetadataWriter::new(&none).padded();
        for group in groups {
            for id in group {
                let record = self.inode_record(*id, ids)?.to_bytes();
                self.nodes[*id].inode_ref = writer.write(&record)?;
            }
            writer.flush()?;
        }
        Ok(writer.finish()?.bytes)
    }

    /// Serialize every directory listing and record where each one starts.
    fn write_directory_table(&mut self, groups: &[Vec<usize>]) -> Result<Vec<u8>> {
        let dirs: Vec<usize> = groups
            .iter()
            .flatten()
            .copied()
            .filter(|id| self.nodes[*id].is_directory())
            .collect();

        let mut writer = MetadataWriter::new(self.compressor.as_ref());
        for dir in dirs {
            let listing = {
                let entries: Vec<ListingEntry> = self.nodes[dir]
                    .children()
                    .iter()
                    .map(|c| {
                        let child = &self.nodes[*c];
                        ListingEntry {
                            name: &child.name,
                            kind: child.kind,
                            inode_ref: child.inode_ref,
                            inode_number: child.inode_number,
                        }
                    })
                    .collect();
                build_listing(&entries)
            };
            let at = writer.write(&listing)?;
            if let NodeData::Directory {
                listing: location,
                listing_size,
                ..
            } = &mut self.nodes[dir].data
            {
                *location = at;
                *listing_size = listing.len() as u32 + 3;
            }
        }
        Ok(writer.finish()?.bytes)
    }

    /// Rewrite the listing location fields of every directory inode inside
    /// the uncompressed inode table.
    fn patch_directory_inodes(&self, inode_table: &mut [u8]) {
        for node in &self.nodes {
            let NodeData::Directory {
                listing,
                listing_size,
                extended,
                ..
            } = &node.data
            else {
                continue;
            };
            let (len, start, size, offset) = if *extended {
                (
                    inode::EXTENDED_DIRECTORY_SIZE,
                    dir_fields::EXT_START_BLOCK,
                    dir_fields::EXT_FILE_SIZE,
                    dir_fields::EXT_OFFSET,
                )
            } else {
                (
                    inode::BASIC_DIRECTORY_SIZE,
                    dir_fields::BASIC_START_BLOCK,
                    dir_fields::BASIC_FILE_SIZE,
                    dir_fields::BASIC_OFFSET,
                )
            };

            let mut raw = read_uncompressed(inode_table, node.inode_ref, len);
            raw[start..start + 4].copy_from_slice(&(listing.block as u32).to_le_bytes());
            if *extended {
                raw[size..size + 4].copy_from_slice(&listing_size.to_le_bytes());
            } else {
                raw[size..size + 2].copy_from_slice(&(*listing_size as u16).to_le_bytes());
            }
            raw[offset..offset + 2].copy_from_slice(&listing.offset.to_le_bytes());
            write_uncompressed(inode_table, node.inode_ref, &raw);
        }
    }

    fn export_records(&self) -> Vec<u8> {
        let mut refs = vec![0u64; self.nodes.len()];
        for node in &self.nodes {
            refs[node.inode_number as usize - 1] = node.inode_ref.to_inode_ref();
        }
        refs.iter().flat_map(|r| r.to_le_bytes()).collect()
    }

    fn superblock_flags(&self) -> SuperblockFlags {
        let mut value = SuperblockFlags::UNCOMPRESSED_INODES
            | SuperblockFlags::EXPORTABLE
            | SuperblockFlags::NO_XATTRS;
        if self.compressor.kind() == CompressionKind::None {
            value |= SuperblockFlags::UNCOMPRESSED_DATA | SuperblockFlags::UNCOMPRESSED_FRAGMENTS;
        }
        if self.compressor.options().is_some() {
            value |= SuperblockFlags::COMPRESSOR_OPTIONS;
        }
        value
    }
}

impl FilesystemBuilder for SquashFsBuilder {
    fn directory(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.add_node(path, NodeKind::Directory, user, group, mode)?;
        Ok(())
    }

    fn file(&mut self, path: &str, content: &[u8], user: u32, group: u32, mode: u32) -> Result<()> {
        let id = self.add_node(path, NodeKind::File, user, group, mode)?;
        if let NodeData::File { content: data, .. } = &mut self.nodes[id].data {
            *data = content.to_vec();
        }
        Ok(())
    }

    fn symlink(&mut self, path: &str, target: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        let id = self.add_node(path, NodeKind::SymLink, user, group, mode)?;
        if let NodeData::SymLink { target: data } = &mut self.nodes[id].data {
            *data = target.to_string();
        }
        Ok(())
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
        let id = self.add_node(path, NodeKind::BlockDevice, user, group, mode)?;
        self.nodes[id].data = NodeData::Device {
            rdev: encode_device(major, minor),
        };
        Ok(())
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
        let id = self.add_node(path, NodeKind::CharDevice, user, group, mode)?;
        self.nodes[id].data = NodeData::Device {
            rdev: encode_device(major, minor),
        };
        Ok(())
    }

    fn fifo(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.add_node(path, NodeKind::Fifo, user, group, mode)?;
        Ok(())
    }

    fn socket(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.add_node(path, NodeKind::Socket, user, group, mode)?;
        Ok(())
    }

    fn get_filesystem_image(&mut self) -> Result<Vec<u8>> {
        if self.built {
            return Err(FsBuildError::AlreadyBuilt);
        }
        if self.nodes.is_empty() {
            return Err(FsBuildError::no_parent("/"));
        }
        self.built = true;

        let mut sb = Superblock::new(
            self.block_size,
            self.compressor.kind().squashfs_id(),
            self.timestamp,
        );
        sb.flags = self.superblock_flags();
        let mut image = ByteArena::zeroed(SUPERBLOCK_SIZE);

        let ids = self.build_id_table()?;
        let groups = self.group_nodes();

        if let Some(options) = self.compressor.options() {
            let none = NoneCompressor;
            let mut writer = MetadataWriter::new(&none);
            writer.write(&options)?;
            image.append(&writer.finish()?.bytes);
        }

        let mut fragments = self.prepare_fragments(&groups)?;
        self.append_data(&mut image, &groups, &mut fragments)?;

        let mut inode_table = self.write_inode_table(&groups, &ids)?;
        let directory_table = self.write_directory_table(&groups)?;
        self.patch_directory_inodes(&mut inode_table);

        sb.inode_table_start = image.append(&inode_table) as u64;
        sb.directory_table_start = image.append(&directory_table) as u64;
        debug!(
            "inode table at {:#x} ({} bytes), directory table at {:#x} ({} bytes)",
            sb.inode_table_start,
            inode_table.len(),
            sb.directory_table_start,
            directory_table.len()
        );

        let fragment_records: Vec<u8> = fragments.iter().flat_map(|f| f.entry_bytes()).collect();
        let compressor = self.compressor.as_ref();
        sb.fragment_table_start =
            append_lookup_table(&mut image, compressor, "fragment", &fragment_records)?;
        sb.export_table_start =
            append_lookup_table(&mut image, compressor, "export", &self.export_records())?;
        sb.id_table_start = append_lookup_table(&mut image, compressor, "id", &ids.to_bytes())?;

        sb.inode_count = self.nodes.len() as u32;
        sb.fragment_count = fragments.len() as u32;
        sb.id_count = ids.len() as u16;
        sb.root_inode = self.nodes[ROOT].inode_ref.to_inode_ref();
        sb.bytes_used = image.len() as u64;
        image.write_bytes(0, &sb.to_bytes());
        image.pad_to(DEVICE_BLOCK_SIZE);

        info!(
            "squashfs: {} inodes, {} fragments, {} ids, {} bytes used ({} padded)",
            sb.inode_count,
            sb.fragment_count,
            sb.id_count,
            sb.bytes_used,
            image.len()
        );
        Ok(image.into_vec())
    }
}
