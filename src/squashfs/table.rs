//! Id table, directory listings and the metadata-backed lookup tables.

use std::collections::HashMap;

use log::debug;

use zerocopy::little_endian::{I16, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::builder::NodeKind;
use crate::codec::ByteArena;
use crate::compression::Compressor;
use crate::error::{FsBuildError, Result};

use super::inode::basic_type;
use super::metadata::{MetadataRef, MetadataWriter};

/// Entries one directory header may describe.
pub const MAX_ENTRIES_PER_HEADER: usize = 256;
pub const DIR_HEADER_SIZE: usize = std::mem::size_of::<DirHeader>();
pub const DIR_ENTRY_SIZE: usize = std::mem::size_of::<DirEntryRecord>();
/// Longest name a directory entry can hold.
pub const MAX_NAME_LEN: usize = 256;

/// Starts a run of entries whose inodes share one metadata block.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct DirHeader {
    /// Number of entries minus one.
    pub count: U32,
    pub start: U32,
    pub inode_number: U32,
}

/// Followed by `name_size + 1` name bytes.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct DirEntryRecord {
    pub offset: U16,
    pub inode_offset: I16,
    pub inode_type: U16,
    pub name_size: U16,
}

/// De-duplicated uid/gid values, in first-seen order.
#[derive(Debug, Default)]
pub struct IdTable {
    ids: Vec<u32>,
    index: HashMap<u32, u16>,
}

impl IdTable {
    /// Add `id` if unseen and return its index.
    pub fn insert(&mut self, id: u32) -> Result<u16> {
        if let Some(idx) = self.index.get(&id) {
            return Ok(*idx);
        }
        if self.ids.len() >= u16::MAX as usize {
            return Err(FsBuildError::TooManyIds);
        }
        let idx = self.ids.len() as u16;
        self.ids.push(id);
        self.index.insert(id, idx);
        Ok(idx)
    }

    pub fn index_of(&self, id: u32) -> Result<u16> {
        self.index
            .get(&id)
            .copied()
            .ok_or(FsBuildError::UnknownId(id))
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.ids.iter().flat_map(|id| id.to_le_bytes()).collect()
    }
}

/// A child as it appears in its parent's listing.
#[derive(Debug, Clone)]
pub struct ListingEntry<'a> {
    pub name: &'a str,
    pub kind: NodeKind,
    pub inode_ref: MetadataRef,
    pub inode_number: u32,
}

/// Upper bound of the listing size: one header per entry.
pub fn worst_case_listing_size<'a>(names: impl Iterator<Item = &'a str>) -> usize {
    names
        .map(|name| DIR_HEADER_SIZE + DIR_ENTRY_SIZE + name.len())
        .sum()
}

/// Serialize a directory listing. `entries` must already be sorted by name.
///
/// A new header starts whenever the child's inode lives in a different
/// metadata block, its inode number is out of i16 range of the header base,
/// or the header already describes 256 entries.
pub fn build_listing(entries: &[ListingEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    // (header position, entries under it, inode block, base inode number)
    let mut header: Option<(usize, usize, u64, u32)> = None;

    for entry in entries {
        let delta = entry.inode_number as i64;
        let start_new = match header {
            None => true,
            Some((_, count, block, base)) => {
                let delta = delta - base as i64;
                count == MAX_ENTRIES_PER_HEADER
                    || block != entry.inode_ref.block
                    || delta < i16::MIN as i64
                    || delta > i16::MAX as i64
            }
        };
        if start_new {
            if let Some((pos, count, _, _)) = header {
                close_header(&mut out, pos, count);
            }
            let record = DirHeader {
                count: U32::new(0),
                start: U32::new(entry.inode_ref.block as u32),
                inode_number: U32::new(entry.inode_number),
            };
            header = Some((out.len(), 0, entry.inode_ref.block, entry.inode_number));
            out.extend_from_slice(record.as_bytes());
        }

        if let Some((_, count, _, base)) = header.as_mut() {
            let record = DirEntryRecord {
                offset: U16::new(entry.inode_ref.offset),
                inode_offset: I16::new((entry.inode_number as i64 - *base as i64) as i16),
                inode_type: U16::new(basic_type(entry.kind)),
                name_size: U16::new((entry.name.len() - 1) as u16),
            };
            out.extend_from_slice(record.as_bytes());
            out.extend_from_slice(entry.name.as_bytes());
            *count += 1;
        }
    }
    if let Some((pos, count, _, _)) = header {
        close_header(&mut out, pos, count);
    }
    out
}

fn close_header(out: &mut [u8], pos: usize, count: usize) {
    out[pos..pos + 4].copy_from_slice(&((count - 1) as u32).to_le_bytes());
}

/// Append a table of fixed-size records as metadata blocks followed by the
/// list of block start offsets. Returns the offset of that list, which is
/// what the superblock points at.
pub fn append_lookup_table(
    image: &mut ByteArena,
    compressor: &dyn Compressor,
    name: &str,
    records: &[u8],
) -> Result<u64> {
    let base = image.len() as u64;
    let mut writer = MetadataWriter::new(compressor).with_base(base);
    writer.write(records)?;
    let out = writer.finish()?;
    image.append(&out.bytes);

    let list_start = image.len() as u64;
    for start in &out.block_starts {
        image.append(&start.to_le_bytes());
    }
    debug!(
        "{name} table: {} bytes in {} blocks at {base:#x}, index at {list_start:#x}",
        records.len(),
        out.block_starts.len()
    );
    Ok(list_start)
}
