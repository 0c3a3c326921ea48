//! In-memory node graph collected before serialization.

use crate::builder::NodeKind;

use super::metadata::MetadataRef;

/// Placement of a file tail inside a fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    pub index: u32,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub enum NodeData {
    Directory {
        /// Child node ids in insertion order.
        children: Vec<usize>,
        /// Listing location in the directory table, known after it is written.
        listing: MetadataRef,
        listing_size: u32,
        extended: bool,
    },
    File {
        content: Vec<u8>,
        blocks_start: u64,
        block_sizes: Vec<u32>,
        fragment: Option<FragmentRef>,
    },
    SymLink {
        target: String,
    },
    Device {
        rdev: u32,
    },
    Ipc,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
    pub permissions: u16,
    pub uid: u32,
    pub gid: u32,
    pub parent: usize,
    pub inode_number: u32,
    pub inode_ref: MetadataRef,
    pub data: NodeData,
}

impl Node {
    pub fn new(path: &str, name: &str, kind: NodeKind, mode: u32, uid: u32, gid: u32) -> Self {
        let data = match kind {
            NodeKind::Directory => NodeData::Directory {
                children: Vec::new(),
                listing: MetadataRef::default(),
                listing_size: 0,
                extended: false,
            },
            NodeKind::File => NodeData::File {
                content: Vec::new(),
                blocks_start: 0,
                block_sizes: Vec::new(),
                fragment: None,
            },
            NodeKind::SymLink => NodeData::SymLink {
                target: String::new(),
            },
            NodeKind::BlockDevice | NodeKind::CharDevice => NodeData::Device { rdev: 0 },
            NodeKind::Fifo | NodeKind::Socket => NodeData::Ipc,
        };
        Self {
            path: path.to_string(),
            name: name.to_string(),
            kind,
            permissions: (mode & crate::builder::PERMISSION_MASK) as u16,
            uid,
            gid,
            parent: 0,
            inode_number: 0,
            inode_ref: MetadataRef::default(),
            data,
        }
    }

    pub fn children(&self) -> &[usize] {
        match &self.data {
            NodeData::Directory { children, .. } => children,
            _ => &[],
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}
