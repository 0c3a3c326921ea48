//! Metadata block framing.
//!
//! Metadata (inodes, directory listings, lookup tables) is stored as a
//! sequence of blocks holding at most 8 KiB of payload each. Every block is
//! prefixed with a 2-byte header: the stored length, with bit 15 set when the
//! payload is stored raw. Records may span block boundaries.

use log::debug;

use crate::compression::Compressor;
use crate::error::Result;

pub const METADATA_SIZE: usize = 8192;
pub const METADATA_UNCOMPRESSED: u16 = 0x8000;
const HEADER_SIZE: usize = 2;

/// Location of a byte inside a metadata region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataRef {
    /// Offset of the containing block's header, relative to the region start
    /// (or absolute when the writer has a base).
    pub block: u64,
    /// Offset inside the block's decompressed payload, always `< 8192`.
    pub offset: u16,
}

impl MetadataRef {
    /// Packed 48/16-bit form used by inode references.
    pub fn to_inode_ref(self) -> u64 {
        (self.block << 16) | self.offset as u64
    }
}

/// Finished output of a [`MetadataWriter`].
#[derive(Debug, Default)]
pub struct MetadataOutput {
    pub bytes: Vec<u8>,
    /// Start of each emitted block, base applied.
    pub block_starts: Vec<u64>,
}

pub struct MetadataWriter<'a> {
    compressor: &'a dyn Compressor,
    base: u64,
    pad_to_full: bool,
    output: Vec<u8>,
    current: Vec<u8>,
    block_starts: Vec<u64>,
}

impl<'a> MetadataWriter<'a> {
    /// A writer whose references are relative to the start of its output.
    pub fn new(compressor: &'a dyn Compressor) -> Self {
        Self {
            compressor,
            base: 0,
            pad_to_full: false,
            output: Vec::new(),
            current: Vec::with_capacity(METADATA_SIZE),
            block_starts: Vec::new(),
        }
    }

    /// Offset every reference and block start by `base`.
    pub fn with_base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    /// Zero-pad partial blocks to the full 8 KiB on flush.
    pub fn padded(mut self) -> Self {
        self.pad_to_full = true;
        self
    }

    /// Reference of the next byte to be written.
    pub fn position(&self) -> MetadataRef {
        MetadataRef {
            block: self.base + self.output.len() as u64,
            offset: self.current.len() as u16,
        }
    }

    /// Free payload space left in the current block.
    pub fn current_block_free(&self) -> usize {
        METADATA_SIZE - self.current.len()
    }

    /// Append `data`, returning the reference of its first byte.
    pub fn write(&mut self, data: &[u8]) -> Result<MetadataRef> {
        let at = self.position();
        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(self.current_block_free());
            self.current.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.current.len() == METADATA_SIZE {
                self.emit_block()?;
            }
        }
        Ok(at)
    }

    /// Emit the partially filled block, if any.
    pub fn flush(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        if self.pad_to_full {
            self.current.resize(METADATA_SIZE, 0);
        }
        self.emit_block()
    }

    pub fn finish(mut self) -> Result<MetadataOutput> {
        self.flush()?;
        Ok(MetadataOutput {
            bytes: self.output,
            block_starts: self.block_starts,
        })
    }

    fn emit_block(&mut self) -> Result<()> {
        let start = self.base + self.output.len() as u64;
        let packed = self.compressor.compress(&self.current)?;
        let (header, payload) = if packed.len() < self.current.len() {
            (packed.len() as u16, packed.as_slice())
        } else {
            (
                self.current.len() as u16 | METADATA_UNCOMPRESSED,
                self.current.as_slice(),
            )
        };
        self.output.extend_from_slice(&header.to_le_bytes());
        self.output.extend_from_slice(payload);
        debug!(
            "metadata block at {start:#x}: {} -> {} bytes",
            self.current.len(),
            payload.len()
        );
        self.block_starts.push(start);
        self.current.clear();
        Ok(())
    }
}

/// Map a position in a region of full, uncompressed metadata blocks to its
/// byte offset in the region.
fn physical_offset(at: MetadataRef, rel: usize) -> usize {
    let block_index = at.block as usize / (HEADER_SIZE + METADATA_SIZE);
    let logical = block_index * METADATA_SIZE + at.offset as usize + rel;
    (logical / METADATA_SIZE) * (HEADER_SIZE + METADATA_SIZE)
        + HEADER_SIZE
        + logical % METADATA_SIZE
}

/// Read `len` payload bytes at `at` from a region written by a padded writer
/// with a pass-through compressor.
pub fn read_uncompressed(region: &[u8], at: MetadataRef, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| region.get(physical_offset(at, i)).copied().unwrap_or(0))
        .collect()
}

/// Overwrite payload bytes at `at` in an uncompressed, padded region.
pub fn write_uncompressed(region: &mut [u8], at: MetadataRef, data: &[u8]) {
    for (i, byte) in data.iter().enumerate() {
        if let Some(slot) = region.get_mut(physical_offset(at, i)) {
            *slot = *byte;
        }
    }
}
