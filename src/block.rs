//! Block framing for files that carry a block table.
//!
//! Each (rank, variable) payload becomes one block at the offset named by its
//! [`BlockHeader`].  An unfiltered block is the payload itself.  A filtered
//! block is
//!
//! ```text
//! [ original CRC-64 (8 B, file byte order) | filtered bytes ]
//! ```
//!
//! and either kind is followed on disk by the usual inverted CRC-64 trailer
//! over the stored bytes.  The original CRC lets a reader check the
//! decompressed payload independently of the stored bytes.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::codec::{get_codec, get_codec_by_name, shuffle, unshuffle, CodecError, CodecId, FILTER_SHUFFLE};
use crate::crc64::crc64;
use crate::endian::Endianness;
use crate::error::Result;
use crate::layout::BlockHeader;

/// Bytes of the original-CRC prefix of a filtered block.
pub const COMPRESS_HEADER_SIZE: usize = 8;

/// How payloads are compressed when a block table is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    pub codec:   CodecId,
    pub level:   i32,
    pub shuffle: bool,
}

/// Stored form of one block.
#[derive(Debug)]
pub enum BlockBody {
    /// The payload is stored as-is, straight from the caller's buffer.
    Raw,
    /// Original-CRC prefix followed by filtered bytes.
    Filtered(Vec<u8>),
}

#[derive(Debug)]
pub struct EncodedBlock {
    /// Filters and size filled in; `start` is assigned by the writing root.
    pub header: BlockHeader,
    pub body:   BlockBody,
    /// CRC-64 of the stored bytes, for the trailer.
    pub crc:    u64,
}

/// Frame `payload` (already in file byte order) as a block.
///
/// Falls back to a raw block when filtering does not make it smaller.
pub fn encode_block(
    payload:   &[u8],
    item_size: usize,
    settings:  Option<&CompressionSettings>,
    endian:    Endianness,
) -> Result<EncodedBlock> {
    let raw = || -> Result<EncodedBlock> {
        let mut header = BlockHeader::with_filters(&[])?;
        header.size = payload.len() as u64;
        Ok(EncodedBlock { header, body: BlockBody::Raw, crc: crc64(payload) })
    };

    let settings = match settings {
        Some(s) if s.codec != CodecId::None && !payload.is_empty() => s,
        _ => return raw(),
    };

    let use_shuffle = settings.shuffle && item_size > 1;
    let staged;
    let input: &[u8] = if use_shuffle {
        staged = shuffle(payload, item_size);
        &staged
    } else {
        payload
    };
    let packed = get_codec(settings.codec).compress(input, settings.level, item_size)?;
    if packed.len() + COMPRESS_HEADER_SIZE >= payload.len() {
        return raw();
    }

    let mut stored = vec![0u8; COMPRESS_HEADER_SIZE + packed.len()];
    let orig_crc = crc64(payload);
    match endian {
        Endianness::Little => LittleEndian::write_u64(&mut stored[..COMPRESS_HEADER_SIZE], orig_crc),
        Endianness::Big    => BigEndian::write_u64(&mut stored[..COMPRESS_HEADER_SIZE], orig_crc),
    }
    stored[COMPRESS_HEADER_SIZE..].copy_from_slice(&packed);

    let names: Vec<&str> = if use_shuffle {
        vec![FILTER_SHUFFLE, settings.codec.name()]
    } else {
        vec![settings.codec.name()]
    };
    let mut header = BlockHeader::with_filters(&names)?;
    header.size = stored.len() as u64;
    let crc = crc64(&stored);
    Ok(EncodedBlock { header, body: BlockBody::Filtered(stored), crc })
}

/// Result of decoding a filtered block whose stored bytes passed their CRC.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockCheck {
    Intact,
    /// Decoded bytes do not reproduce the original payload.
    Corrupt(String),
}

/// Undo the filters of a block into `out`, which must be exactly the payload size.
///
/// `stored` excludes the CRC trailer.  An unknown filter name is an error;
/// a decoded payload that fails its original CRC is [`BlockCheck::Corrupt`].
pub fn decode_block(
    header:    &BlockHeader,
    stored:    &[u8],
    out:       &mut [u8],
    item_size: usize,
    endian:    Endianness,
) -> std::result::Result<BlockCheck, CodecError> {
    if stored.len() < COMPRESS_HEADER_SIZE {
        return Ok(BlockCheck::Corrupt(format!("filtered block of {} bytes has no CRC prefix", stored.len())));
    }
    let (prefix, body) = stored.split_at(COMPRESS_HEADER_SIZE);
    let orig_crc = match endian {
        Endianness::Little => LittleEndian::read_u64(prefix),
        Endianness::Big    => BigEndian::read_u64(prefix),
    };

    let mut staged: Option<Vec<u8>> = None;
    for name in header.filter_names().iter().rev() {
        let input: &[u8] = staged.as_deref().unwrap_or(body);
        let next = if name == FILTER_SHUFFLE {
            unshuffle(input, item_size)
        } else {
            match get_codec_by_name(name)?.decompress(input, out.len()) {
                Ok(v) => v,
                Err(e @ CodecError::UnknownFilter { .. }) => return Err(e),
                Err(e) => return Ok(BlockCheck::Corrupt(e.to_string())),
            }
        };
        staged = Some(next);
    }
    let decoded = staged.as_deref().unwrap_or(body);

    if decoded.len() != out.len() {
        return Ok(BlockCheck::Corrupt(format!(
            "decoded {} bytes, expected {}",
            decoded.len(),
            out.len()
        )));
    }
    let actual = crc64(decoded);
    if actual != orig_crc {
        return Ok(BlockCheck::Corrupt(format!(
            "original CRC {orig_crc:016x} does not match decoded CRC {actual:016x}"
        )));
    }
    out.copy_from_slice(decoded);
    Ok(BlockCheck::Intact)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Vec<u8> {
        (0..8192u32).flat_map(|i| (i / 7).to_le_bytes()).collect()
    }

    fn settings(codec: CodecId, shuffle: bool) -> CompressionSettings {
        CompressionSettings { codec, level: 3, shuffle }
    }

    #[test]
    fn filtered_blocks_decode_for_every_codec() {
        let data = payload();
        for codec in [CodecId::Zstd, CodecId::Lz4, CodecId::Brotli] {
            for shuffle in [false, true] {
                let block = encode_block(&data, 4, Some(&settings(codec, shuffle)), Endianness::Big).unwrap();
                let stored = match &block.body {
                    BlockBody::Filtered(b) => b.clone(),
                    BlockBody::Raw => panic!("{} should compress this payload", codec.name()),
                };
                assert_eq!(block.header.size, stored.len() as u64);
                assert_eq!(block.crc, crc64(&stored));
                let mut out = vec![0u8; data.len()];
                let check = decode_block(&block.header, &stored, &mut out, 4, Endianness::Big).unwrap();
                assert_eq!(check, BlockCheck::Intact);
                assert_eq!(out, data);
            }
        }
    }

    #[test]
    fn incompressible_payload_stays_raw() {
        let data: Vec<u8> = (0..64u64).map(|i| (i.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 56) as u8).collect();
        let block = encode_block(&data, 1, Some(&settings(CodecId::Zstd, false)), Endianness::Little).unwrap();
        assert!(matches!(block.body, BlockBody::Raw));
        assert!(!block.header.is_filtered());
        assert_eq!(block.crc, crc64(&data));
    }

    #[test]
    fn tampered_prefix_is_reported_corrupt() {
        let data = payload();
        let block = encode_block(&data, 4, Some(&settings(CodecId::Zstd, true)), Endianness::Little).unwrap();
        let BlockBody::Filtered(mut stored) = block.body else { panic!("expected a filtered block") };
        stored[0] ^= 1;
        let mut out = vec![0u8; data.len()];
        let check = decode_block(&block.header, &stored, &mut out, 4, Endianness::Little).unwrap();
        assert!(matches!(check, BlockCheck::Corrupt(_)));
    }

    #[test]
    fn unknown_filter_is_an_error() {
        let data = payload();
        let block = encode_block(&data, 4, Some(&settings(CodecId::Zstd, false)), Endianness::Little).unwrap();
        let BlockBody::Filtered(stored) = block.body else { panic!("expected a filtered block") };
        let header = BlockHeader::with_filters(&["blosc"]).unwrap();
        let mut out = vec![0u8; data.len()];
        assert!(decode_block(&header, &stored, &mut out, 4, Endianness::Little).is_err());
    }
}
