//! Compression filter registry.
//!
//! A compressed block records the filters applied to it by name, in
//! application order, inside its [`BlockHeader`](crate::layout::BlockHeader)
//! (four 8-byte slots).  A reader that does not recognise a name MUST fail;
//! it never guesses.
//!
//! Two kinds of filter exist:
//! - the byte-shuffle pre-filter (`"shuffle"`), which transposes the bytes of
//!   fixed-size elements so that equally significant bytes sit together;
//! - one terminal codec ([`CodecId`]) that does the actual compression.

use std::io::{self, Read, Write};
use thiserror::Error;

/// Name of the byte-shuffle pre-filter.
pub const FILTER_SHUFFLE: &str = "shuffle";

// ── CodecId enum ─────────────────────────────────────────────────────────────

/// Terminal compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Zstd,
    Lz4,
    Brotli,
    Lzma,
}

impl CodecId {
    /// Name written into block headers (at most 8 bytes).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None   => "none",
            CodecId::Zstd   => "zstd",
            CodecId::Lz4    => "lz4",
            CodecId::Brotli => "brotli",
            CodecId::Lzma   => "lzma",
        }
    }

    /// Parse a codec name from a block header, the environment or the CLI.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"   => Some(CodecId::None),
            "zstd"   => Some(CodecId::Zstd),
            "lz4"    => Some(CodecId::Lz4),
            "brotli" => Some(CodecId::Brotli),
            "lzma"   => Some(CodecId::Lzma),
            _        => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    /// The block names a filter this build does not provide.
    #[error("Unknown filter {name:?} — cannot decode without it")]
    UnknownFilter { name: String },
    #[error("Decompressed {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    /// Compress `data`, made of `item_size`-byte elements.
    fn compress(&self, data: &[u8], level: i32, item_size: usize) -> Result<Vec<u8>, CodecError>;
    /// Decompress into exactly `expected_len` bytes.
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError>;
}

fn check_len(out: Vec<u8>, expected: usize) -> Result<Vec<u8>, CodecError> {
    if out.len() != expected {
        return Err(CodecError::LengthMismatch { expected, actual: out.len() });
    }
    Ok(out)
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8], _: i32, _: usize) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        check_len(data.to_vec(), expected_len)
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32, _: usize) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let out = zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))?;
        check_len(out, expected_len)
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, data: &[u8], _: i32, _: usize) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let out = lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        check_len(out, expected_len)
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId { CodecId::Brotli }
    fn compress(&self, data: &[u8], level: i32, _: usize) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(expected_len);
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        check_len(out, expected_len)
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lzma }
    fn compress(&self, data: &[u8], _: i32, _: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(expected_len);
        lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        check_len(out, expected_len)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a CodecId to a built-in codec.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None   => Box::new(NoneCodec),
        CodecId::Zstd   => Box::new(ZstdCodec),
        CodecId::Lz4    => Box::new(Lz4Codec),
        CodecId::Brotli => Box::new(BrotliCodec),
        CodecId::Lzma   => Box::new(LzmaCodec),
    }
}

/// Resolve a filter name read from disk.
///
/// Returns `Err(CodecError::UnknownFilter)` if the name is not a codec of
/// this build.  The caller MUST NOT fall back to any other codec.
pub fn get_codec_by_name(name: &str) -> Result<Box<dyn Codec>, CodecError> {
    CodecId::from_name(name)
        .map(get_codec)
        .ok_or_else(|| CodecError::UnknownFilter { name: name.to_owned() })
}

// ── Byte shuffle ─────────────────────────────────────────────────────────────

/// Group byte `k` of every `item_size`-byte element together.
///
/// Trailing bytes that do not form a whole element are copied unchanged.
pub fn shuffle(data: &[u8], item_size: usize) -> Vec<u8> {
    if item_size < 2 || data.len() < item_size {
        return data.to_vec();
    }
    let n = data.len() / item_size;
    let mut out = vec![0u8; data.len()];
    for (i, elem) in data.chunks_exact(item_size).enumerate() {
        for (k, &b) in elem.iter().enumerate() {
            out[k * n + i] = b;
        }
    }
    out[n * item_size..].copy_from_slice(&data[n * item_size..]);
    out
}

/// Inverse of [`shuffle`].
pub fn unshuffle(data: &[u8], item_size: usize) -> Vec<u8> {
    if item_size < 2 || data.len() < item_size {
        return data.to_vec();
    }
    let n = data.len() / item_size;
    let mut out = vec![0u8; data.len()];
    for (i, elem) in out.chunks_exact_mut(item_size).enumerate() {
        for (k, b) in elem.iter_mut().enumerate() {
            *b = data[k * n + i];
        }
    }
    out[n * item_size..].copy_from_slice(&data[n * item_size..]);
    out
}
