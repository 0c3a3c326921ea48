//! Tail packing: file tails shorter than a block share fragment blocks.

use log::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::compression::Compressor;
use crate::error::Result;

use super::inode::DATA_UNCOMPRESSED;
use super::node::FragmentRef;

/// One fragment table entry.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct FragmentEntry {
    pub start: U64,
    pub size: U32,
    pub unused: U32,
}

pub const FRAGMENT_ENTRY_SIZE: usize = std::mem::size_of::<FragmentEntry>();

/// Compress one data or fragment block, falling back to the raw bytes when
/// compression does not help. Returns the stored bytes and the on-disk size
/// field.
pub fn pack_data_block(compressor: &dyn Compressor, data: &[u8]) -> Result<(Vec<u8>, u32)> {
    let packed = compressor.compress(data)?;
    if packed.len() < data.len() {
        let size = packed.len() as u32;
        Ok((packed, size))
    } else {
        Ok((data.to_vec(), data.len() as u32 | DATA_UNCOMPRESSED))
    }
}

/// One closed fragment block.
#[derive(Debug, Clone)]
pub struct FragmentBlock {
    /// First file packed into the block, for diagnostics.
    pub path: String,
    /// Offset of the stored block. Relative to the fragment region until
    /// the region is placed in the image.
    pub start: u64,
    pub size: u32,
    pub stored: Vec<u8>,
}

impl FragmentBlock {
    pub fn entry_bytes(&self) -> Vec<u8> {
        let entry = FragmentEntry {
            start: U64::new(self.start),
            size: U32::new(self.size),
            unused: U32::new(0),
        };
        entry.as_bytes().to_vec()
    }
}

pub struct FragmentPacker<'a> {
    compressor: &'a dyn Compressor,
    block_size: usize,
    current: Vec<u8>,
    current_path: String,
    region_len: u64,
    blocks: Vec<FragmentBlock>,
}

impl<'a> FragmentPacker<'a> {
    pub fn new(compressor: &'a dyn Compressor, block_size: u32) -> Self {
        Self {
            compressor,
            block_size: block_size as usize,
            current: Vec::new(),
            current_path: String::new(),
            region_len: 0,
            blocks: Vec::new(),
        }
    }

    /// Place `tail` into the open fragment block, closing it first when the
    /// tail does not fit in the space left.
    pub fn add(&mut self, path: &str, tail: &[u8]) -> Result<FragmentRef> {
        if self.current.len() + tail.len() > self.block_size {
            self.close()?;
        }
        if self.current.is_empty() {
            self.current_path = path.to_string();
        }
        let placed = FragmentRef {
            index: self.blocks.len() as u32,
            offset: self.current.len() as u32,
        };
        self.current.extend_from_slice(tail);
        Ok(placed)
    }

    fn close(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let (stored, size) = pack_data_block(self.compressor, &self.current)?;
        debug!(
            "fragment block {}: {} bytes of tails from {} onwards, stored {}",
            self.blocks.len(),
            self.current.len(),
            self.current_path,
            stored.len()
        );
        let start = self.region_len;
        self.region_len += stored.len() as u64;
        self.blocks.push(FragmentBlock {
            path: std::mem::take(&mut self.current_path),
            start,
            size,
            stored,
        });
        self.current.clear();
        Ok(())
    }

    pub fn finish(mut self) -> Result<Vec<FragmentBlock>> {
        self.close()?;
        Ok(self.blocks)
    }
}
