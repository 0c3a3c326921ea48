//! Block compressors used by the SquashFs builder.
//!
//! Every compressor works on whole, independent blocks: one call compresses
//! one data block, fragment block or metadata block. The output is the raw
//! codec stream the kernel expects for the corresponding SquashFs
//! compression id (zlib for "gzip", legacy `.lzma` for "lzma", `.xz` with a
//! CRC32 check for "xz", LZO1X for "lzo", raw LZ4 blocks for "lz4", zstd
//! frames for "zstd").

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use xz2::stream::{Check, Filters, LzmaOptions, Stream};

use crate::error::{FsBuildError, Result};

/// Largest block any compressor is asked to restore (the SquashFs maximum).
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

const GZIP_LEVEL: u32 = 9;
const XZ_PRESET: u32 = 6;
const ZSTD_LEVEL: i32 = 15;

/// LZ4 compressor option block: version 1 ("legacy" frame-less blocks), no flags.
const LZ4_LEGACY_VERSION: u32 = 1;

/// Compression algorithm selected for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionKind {
    /// Store everything raw.
    None,
    Gzip,
    Lzma,
    Lzo,
    Xz,
    Lz4,
    Zstd,
}

impl CompressionKind {
    /// Compression id written into the SquashFs superblock.
    ///
    /// `None` reuses the gzip id: the reader never invokes the codec because
    /// every block carries the "uncompressed" marker.
    pub fn squashfs_id(self) -> u16 {
        match self {
            CompressionKind::None | CompressionKind::Gzip => 1,
            CompressionKind::Lzma => 2,
            CompressionKind::Lzo => 3,
            CompressionKind::Xz => 4,
            CompressionKind::Lz4 => 5,
            CompressionKind::Zstd => 6,
        }
    }
}

impl FromStr for CompressionKind {
    type Err = FsBuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "raw" => Ok(CompressionKind::None),
            "gzip" | "gz" | "zlib" => Ok(CompressionKind::Gzip),
            "lzma" => Ok(CompressionKind::Lzma),
            "lzo" => Ok(CompressionKind::Lzo),
            "xz" => Ok(CompressionKind::Xz),
            "lz4" => Ok(CompressionKind::Lz4),
            "zstd" | "zst" => Ok(CompressionKind::Zstd),
            other => Err(FsBuildError::UnsupportedCompression(other.to_string())),
        }
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionKind::None => "none",
            CompressionKind::Gzip => "gzip",
            CompressionKind::Lzma => "lzma",
            CompressionKind::Lzo => "lzo",
            CompressionKind::Xz => "xz",
            CompressionKind::Lz4 => "lz4",
            CompressionKind::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// A block codec.
pub trait Compressor {
    fn kind(&self) -> CompressionKind;

    /// Compress one block.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Restore one block produced by [`Compressor::compress`].
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Compressor-specific option block stored after the superblock, if any.
    fn options(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Instantiate the compressor for `kind`.
///
/// `block_size` is the image data block size; xz uses it as the dictionary
/// size so the kernel decoder can run with its preallocated dictionary.
pub fn create_compressor(kind: CompressionKind, block_size: u32) -> Result<Box<dyn Compressor>> {
    match kind {
        CompressionKind::None => Ok(Box::new(NoneCompressor)),
        CompressionKind::Gzip => Ok(Box::new(GzipCompressor)),
        CompressionKind::Lzma => Ok(Box::new(LzmaCompressor)),
        CompressionKind::Lzo => Ok(Box::new(LzoCompressor)),
        CompressionKind::Xz => Ok(Box::new(XzCompressor {
            dict_size: block_size.max(8192),
        })),
        CompressionKind::Lz4 => Ok(Box::new(Lz4Compressor)),
        CompressionKind::Zstd => Ok(Box::new(ZstdCompressor)),
    }
}

fn codec_error(err: impl fmt::Display) -> FsBuildError {
    FsBuildError::Compression(err.to_string())
}

pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// zlib stream, which is what SquashFs calls "gzip".
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::new(GZIP_LEVEL));
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(codec_error)?;
        Ok(out)
    }
}

/// Legacy `.lzma` ("LZMA alone") stream.
pub struct LzmaCompressor;

impl Compressor for LzmaCompressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lzma
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let options = LzmaOptions::new_preset(XZ_PRESET).map_err(codec_error)?;
        let stream = Stream::new_lzma_encoder(&options).map_err(codec_error)?;
        let mut encoder = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let stream = Stream::new_lzma_decoder(u64::MAX).map_err(codec_error)?;
        let mut out = Vec::new();
        xz2::read::XzDecoder::new_stream(data, stream)
            .read_to_end(&mut out)
            .map_err(codec_error)?;
        Ok(out)
    }
}

/// Raw LZO1X stream, no header and no option block.
pub struct LzoCompressor;

impl Compressor for LzoCompressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lzo
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lzokay_native::compress(data)
            .map_err(|err| FsBuildError::Compression(format!("lzo: {err:?}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lzokay_native::decompress_all(data, None)
            .map_err(|err| FsBuildError::Compression(format!("lzo: {err:?}")))
    }
}

/// `.xz` stream with a single LZMA2 filter and CRC32 check.
pub struct XzCompressor {
    dict_size: u32,
}

impl Compressor for XzCompressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Xz
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut options = LzmaOptions::new_preset(XZ_PRESET).map_err(codec_error)?;
        options.dict_size(self.dict_size);
        let mut filters = Filters::new();
        filters.lzma2(&options);
        let stream = Stream::new_stream_encoder(&filters, Check::Crc32).map_err(codec_error)?;
        let mut encoder = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        xz2::read::XzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(codec_error)?;
        Ok(out)
    }
}

/// Raw LZ4 block format (no frame, no size prefix).
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::block::compress(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::block::decompress(data, MAX_BLOCK_SIZE).map_err(codec_error)
    }

    fn options(&self) -> Option<Vec<u8>> {
        let mut raw = Vec::with_capacity(8);
        raw.extend_from_slice(&LZ4_LEGACY_VERSION.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());
        Some(raw)
    }
}

pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Zstd
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = zstd::stream::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = zstd::stream::Decoder::new(data)?;
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(codec_error)?;
        Ok(out)
    }
}
