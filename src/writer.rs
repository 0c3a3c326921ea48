//! Builder selection: map a filesystem type and options to a builder.

use std::fmt;
use std::str::FromStr;

use log::debug;

use crate::builder::FilesystemBuilder;
use crate::codec::align_up;
use crate::compression::CompressionKind;
use crate::cpio::CpioFsBuilder;
use crate::error::{FsBuildError, Result};
use crate::ext2::Ext2FsBuilder;
use crate::squashfs::{SquashFsBuilder, SquashFsOptions, DEFAULT_BLOCK_SIZE};

/// ext2 images sized automatically are rounded up to this.
pub const DISK_SIZE_ALIGNMENT: u64 = 0x80_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsType {
    Cpio,
    Ext2,
    SquashFs,
    CramFs,
    RomFs,
}

impl FromStr for FsType {
    type Err = FsBuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpio" | "initramfs" => Ok(FsType::Cpio),
            "ext2" => Ok(FsType::Ext2),
            "squashfs" | "squash" => Ok(FsType::SquashFs),
            "cramfs" => Ok(FsType::CramFs),
            "romfs" => Ok(FsType::RomFs),
            other => Err(FsBuildError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsType::Cpio => "cpio",
            FsType::Ext2 => "ext2",
            FsType::SquashFs => "squashfs",
            FsType::CramFs => "cramfs",
            FsType::RomFs => "romfs",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// SquashFs only.
    pub compression: CompressionKind,
    /// SquashFs data block size.
    pub block_size: u32,
    /// ext2 image size; derived from the content size when unset.
    pub disk_size: Option<u64>,
    /// Fixed node timestamp for reproducible images.
    pub timestamp: Option<u32>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            compression: CompressionKind::Gzip,
            block_size: DEFAULT_BLOCK_SIZE,
            disk_size: None,
            timestamp: None,
        }
    }
}

/// Image size for `content_size` bytes of payload: half again as much,
/// rounded up to 8 MiB.
pub fn detect_disk_size(content_size: u64) -> u64 {
    let wanted = content_size.saturating_mul(3) / 2;
    (align_up(wanted as usize, DISK_SIZE_ALIGNMENT as usize) as u64).max(DISK_SIZE_ALIGNMENT)
}

/// Create an empty builder for `fs_type`.
///
/// `content_size` is the total payload the caller is about to add; it only
/// matters for ext2 images without an explicit disk size.
pub fn create_builder(
    fs_type: FsType,
    options: &BuildOptions,
    content_size: u64,
) -> Result<Box<dyn FilesystemBuilder>> {
    match fs_type {
        FsType::Cpio => Ok(Box::new(match options.timestamp {
            Some(ts) => CpioFsBuilder::with_timestamp(ts),
            None => CpioFsBuilder::new(),
        })),
        FsType::Ext2 => {
            let disk_size = options
                .disk_size
                .unwrap_or_else(|| detect_disk_size(content_size));
            debug!("ext2 disk size {disk_size} for {content_size} bytes of content");
            let builder = match options.timestamp {
                Some(ts) => Ext2FsBuilder::with_timestamp(disk_size, ts)?,
                None => Ext2FsBuilder::new(disk_size)?,
            };
            Ok(Box::new(builder))
        }
        FsType::SquashFs => Ok(Box::new(SquashFsBuilder::with_options(SquashFsOptions {
            compression: options.compression,
            block_size: options.block_size,
            timestamp: options.timestamp,
        })?)),
        FsType::CramFs | FsType::RomFs => Err(FsBuildError::UnsupportedFormat(fs_type.to_string())),
    }
}
