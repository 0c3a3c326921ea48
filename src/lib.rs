//! Filesystem image builders for bootable Linux images.
//!
//! Callers describe a filesystem as a sequence of node-creation calls and
//! receive the finished image bytes. Every format implements the same
//! [`FilesystemBuilder`] contract:
//!
//! - **ext2** - block-addressed image with bitmaps, inode tables and
//!   multi-level indirect blocks ([`ext2::Ext2FsBuilder`])
//! - **SquashFs** - compressed read-only image with metadata blocks,
//!   fragments and lookup tables ([`squashfs::SquashFsBuilder`])
//! - **cpio** - newc archive for initramfs ([`cpio::CpioFsBuilder`])
//!
//! # Architecture
//!
//! ```text
//! fsimage
//!     │
//!     ├── builder      FilesystemBuilder trait, node kinds, mode bits
//!     ├── codec        offset-addressed little-endian byte arena
//!     ├── compression  squashfs codecs (gzip, lzma, xz, lz4, zstd)
//!     ├── ext2 / squashfs / cpio
//!     ├── writer       FsType + BuildOptions -> Box<dyn FilesystemBuilder>
//!     ├── config       TOML image manifests
//!     └── source       import a host directory tree
//! ```
//!
//! # Example
//!
//! ```rust
//! use fsimage::{create_builder, BuildOptions, FsType};
//!
//! let options = BuildOptions { timestamp: Some(0), ..Default::default() };
//! let mut builder = create_builder(FsType::SquashFs, &options, 0)?;
//! builder.directory("/", 0, 0, 0o755)?;
//! builder.directory("/dev", 0, 0, 0o755)?;
//! builder.char_device("/dev/console", 5, 1, 0, 0, 0o600)?;
//! builder.file("/init", b"#!/bin/sh\n", 0, 0, 0o755)?;
//! let image = builder.get_filesystem_image()?;
//! assert_eq!(&image[..4], b"hsqs");
//! # Ok::<(), fsimage::FsBuildError>(())
//! ```

pub mod builder;
pub mod codec;
pub mod compression;
pub mod config;
pub mod cpio;
pub mod error;
pub mod ext2;
pub mod path;
pub mod source;
pub mod squashfs;
pub mod writer;

pub use builder::{FilesystemBuilder, NodeKind};
pub use compression::CompressionKind;
pub use config::ImageManifest;
pub use error::{ErrorKind, FsBuildError};
pub use writer::{create_builder, BuildOptions, FsType};
