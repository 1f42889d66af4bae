//! On-disk header layout.
//!
//! ```text
//! 0                 GlobalHeader            (GlobalHeaderSize bytes)
//! VarsStart         VariableHeader × NVars  (VarsSize bytes each)
//! RanksStart        RankHeader × NRanks     (RanksSize bytes each)
//! BlocksStart       BlockHeader × NRanks·NVars  (optional, BlocksSize each)
//! HeaderSize - 8    CRC-64 trailer over the whole header
//! HeaderSize        payload of rank 0 ...
//! ```
//!
//! # Endianness
//! Every multi-byte field is stored in the byte order named by the magic
//! string (`HACC01B` / `HACC01L`).  Encoding and decoding are written once,
//! generic over [`byteorder::ByteOrder`]; the [`Endianness`] value picked at
//! open time selects the instantiation.
//!
//! # Versioned optional fields
//! Older writers produced shorter global and rank headers.  Fields added
//! later are described by an [`OptionalField`] and only decoded when the
//! declared struct size (`GlobalHeaderSize`, `RanksSize`) covers them.

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use serde::Serialize;

use crate::crc64::{crc64, crc64_trailer, CRC_SIZE};
use crate::endian::Endianness;
use crate::error::{GioError, Result};

// ── Magic ────────────────────────────────────────────────────────────────────

pub const MAGIC_SIZE: usize   = 8;
pub const MAGIC_BE: &[u8; 8] = b"HACC01B\0";
pub const MAGIC_LE: &[u8; 8] = b"HACC01L\0";

pub fn magic_for(endian: Endianness) -> &'static [u8; MAGIC_SIZE] {
    match endian {
        Endianness::Big    => MAGIC_BE,
        Endianness::Little => MAGIC_LE,
    }
}

pub fn endianness_from_magic(bytes: &[u8]) -> Result<Endianness> {
    match bytes.get(..MAGIC_SIZE) {
        Some(m) if m == MAGIC_BE => Ok(Endianness::Big),
        Some(m) if m == MAGIC_LE => Ok(Endianness::Little),
        Some(m) => Err(GioError::Format(format!(
            "invalid magic {:?}",
            String::from_utf8_lossy(m).trim_end_matches('\0')
        ))),
        None => Err(GioError::Format("file too short for a magic string".into())),
    }
}

// ── Sizes ────────────────────────────────────────────────────────────────────

pub const GLOBAL_HEADER_SIZE:   usize = 168;
pub const VARIABLE_HEADER_SIZE: usize = 272;
pub const RANK_HEADER_SIZE:     usize = 48;
pub const BLOCK_HEADER_SIZE:    usize = 48;

/// Smallest global header any writer produced (everything before PhysOrigin).
pub const MIN_GLOBAL_HEADER_SIZE: usize = 104;
/// Smallest rank header any writer produced (everything before GlobalRank).
pub const MIN_RANK_HEADER_SIZE:   usize = 40;

/// Bytes of a variable name slot, including at least one NUL.
pub const NAME_SIZE:        usize = 256;
pub const FILTER_NAME_SIZE: usize = 8;
pub const MAX_FILTERS:      usize = 4;

// Global header field offsets.
const GH_HEADER_SIZE:        usize = 8;
const GH_NELEMS:             usize = 16;
const GH_DIMS:               usize = 24;
const GH_NVARS:              usize = 48;
const GH_VARS_SIZE:          usize = 56;
const GH_VARS_START:         usize = 64;
const GH_NRANKS:             usize = 72;
const GH_RANKS_SIZE:         usize = 80;
const GH_RANKS_START:        usize = 88;
const GH_GLOBAL_HEADER_SIZE: usize = 96;

// Rank header field offsets.
const RH_COORDS: usize = 0;
const RH_NELEMS: usize = 24;
const RH_START:  usize = 32;

// Variable header field offsets.
const VH_FLAGS: usize = NAME_SIZE;
const VH_SIZE:  usize = NAME_SIZE + 8;

// Block header field offsets.
const BH_START: usize = MAX_FILTERS * FILTER_NAME_SIZE;
const BH_SIZE:  usize = BH_START + 8;

// ── Variable flags ───────────────────────────────────────────────────────────

pub const VAR_FLAG_FLOAT:       u64 = 1 << 0;
pub const VAR_FLAG_SIGNED:      u64 = 1 << 1;
pub const VAR_FLAG_PHYS_X:      u64 = 1 << 2;
pub const VAR_FLAG_PHYS_Y:      u64 = 1 << 3;
pub const VAR_FLAG_PHYS_Z:      u64 = 1 << 4;
pub const VAR_FLAG_MAYBE_GHOST: u64 = 1 << 5;

// ── Versioned optional fields ────────────────────────────────────────────────

/// A field appended to a header struct after its first version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalField {
    pub offset: usize,
    pub len:    usize,
}

impl OptionalField {
    /// Smallest declared struct size that guarantees the field is present.
    pub const fn min_struct_size(&self) -> u64 {
        (self.offset + self.len) as u64
    }

    pub fn present_in(&self, declared_size: u64) -> bool {
        declared_size >= self.min_struct_size()
    }
}

pub const PHYS_ORIGIN:  OptionalField = OptionalField { offset: 104, len: 24 };
pub const PHYS_SCALE:   OptionalField = OptionalField { offset: 128, len: 24 };
pub const BLOCKS_SIZE:  OptionalField = OptionalField { offset: 152, len: 8 };
pub const BLOCKS_START: OptionalField = OptionalField { offset: 160, len: 8 };
pub const GLOBAL_RANK:  OptionalField = OptionalField { offset: 40,  len: 8 };

// ── Bounds-checked cursor ────────────────────────────────────────────────────

/// Read-only view of one header struct inside the header bytes.
///
/// Offsets are relative to the struct start and may not reach past the
/// declared struct size, so a truncated or lying header surfaces as
/// [`GioError::Format`] instead of a panic.
#[derive(Debug, Clone, Copy)]
pub struct HeaderCursor<'a> {
    buf:  &'a [u8],
    what: &'static str,
}

impl<'a> HeaderCursor<'a> {
    pub fn new(header: &'a [u8], start: u64, size: u64, what: &'static str) -> Result<Self> {
        let end = start.checked_add(size).filter(|&e| e <= header.len() as u64).ok_or_else(|| {
            GioError::Format(format!(
                "{what} at {start}+{size} lies outside the {}-byte header",
                header.len()
            ))
        })?;
        Ok(Self { buf: &header[start as usize..end as usize], what })
    }

    pub fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        self.buf.get(offset..offset + len).ok_or_else(|| {
            GioError::Format(format!(
                "{} field at {offset}+{len} exceeds its {}-byte record",
                self.what,
                self.buf.len()
            ))
        })
    }

    pub fn u64<E: ByteOrder>(&self, offset: usize) -> Result<u64> {
        Ok(E::read_u64(self.bytes(offset, 8)?))
    }

    pub fn u64x3<E: ByteOrder>(&self, offset: usize) -> Result<[u64; 3]> {
        Ok([
            self.u64::<E>(offset)?,
            self.u64::<E>(offset + 8)?,
            self.u64::<E>(offset + 16)?,
        ])
    }

    pub fn f64x3<E: ByteOrder>(&self, offset: usize) -> Result<[f64; 3]> {
        let raw = self.bytes(offset, 24)?;
        Ok([E::read_f64(&raw[0..8]), E::read_f64(&raw[8..16]), E::read_f64(&raw[16..24])])
    }

    /// Decode an optional field only when the record is large enough to hold it.
    pub fn optional<T>(
        &self,
        field: OptionalField,
        read: impl FnOnce(&Self, usize) -> Result<T>,
    ) -> Result<Option<T>> {
        if field.present_in(self.size()) {
            read(self, field.offset).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn c_string(&self, offset: usize, len: usize) -> Result<String> {
        let raw = self.bytes(offset, len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

// ── Header structs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GlobalHeader {
    /// Total header bytes including the trailing CRC.
    pub header_size:        u64,
    pub nelems:             u64,
    pub dims:               [u64; 3],
    pub nvars:              u64,
    pub vars_size:          u64,
    pub vars_start:         u64,
    pub nranks:             u64,
    pub ranks_size:         u64,
    pub ranks_start:        u64,
    pub global_header_size: u64,
    pub phys_origin:        [f64; 3],
    pub phys_scale:         [f64; 3],
    pub blocks_size:        u64,
    pub blocks_start:       u64,
}

impl GlobalHeader {
    pub fn has_block_table(&self) -> bool {
        self.blocks_size > 0 && self.blocks_start > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableHeader {
    pub name:  String,
    pub flags: u64,
    pub size:  u64,
}

impl VariableHeader {
    pub fn is_float(&self) -> bool  { self.flags & VAR_FLAG_FLOAT != 0 }
    pub fn is_signed(&self) -> bool { self.flags & VAR_FLAG_SIGNED != 0 }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RankHeader {
    pub coords:      [u64; 3],
    pub nelems:      u64,
    /// Absolute byte offset of this rank's first payload.
    pub start:       u64,
    pub global_rank: u64,
}

/// Where one (rank, variable) block lives and how it was filtered.
///
/// `size` counts the stored bytes without the CRC trailer that follows them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub filters: [[u8; FILTER_NAME_SIZE]; MAX_FILTERS],
    pub start:   u64,
    pub size:    u64,
}

impl BlockHeader {
    pub fn with_filters(names: &[&str]) -> Result<Self> {
        if names.len() > MAX_FILTERS {
            return Err(GioError::Format(format!(
                "at most {MAX_FILTERS} filters per block, got {}",
                names.len()
            )));
        }
        let mut filters = [[0u8; FILTER_NAME_SIZE]; MAX_FILTERS];
        for (slot, name) in filters.iter_mut().zip(names) {
            let bytes = name.as_bytes();
            if bytes.len() > FILTER_NAME_SIZE {
                return Err(GioError::Format(format!("filter name {name:?} is too long")));
            }
            slot[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(Self { filters, start: 0, size: 0 })
    }

    /// Names of the filters applied to this block, in application order.
    pub fn filter_names(&self) -> Vec<String> {
        self.filters
            .iter()
            .map(|slot| {
                let end = slot.iter().position(|&b| b == 0).unwrap_or(FILTER_NAME_SIZE);
                String::from_utf8_lossy(&slot[..end]).into_owned()
            })
            .filter(|name| !name.is_empty())
            .collect()
    }

    pub fn is_filtered(&self) -> bool {
        self.filters[0][0] != 0
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

fn decode_global_as<E: ByteOrder>(header: &[u8]) -> Result<GlobalHeader> {
    // The declared size lives inside the struct, so peek at it first.
    let prefix = HeaderCursor::new(header, 0, MIN_GLOBAL_HEADER_SIZE as u64, "global header")?;
    let declared = prefix.u64::<E>(GH_GLOBAL_HEADER_SIZE)?;
    if declared < MIN_GLOBAL_HEADER_SIZE as u64 {
        return Err(GioError::Format(format!("global header size {declared} is too small")));
    }
    let c = HeaderCursor::new(header, 0, declared, "global header")?;

    Ok(GlobalHeader {
        header_size:        c.u64::<E>(GH_HEADER_SIZE)?,
        nelems:             c.u64::<E>(GH_NELEMS)?,
        dims:               c.u64x3::<E>(GH_DIMS)?,
        nvars:              c.u64::<E>(GH_NVARS)?,
        vars_size:          c.u64::<E>(GH_VARS_SIZE)?,
        vars_start:         c.u64::<E>(GH_VARS_START)?,
        nranks:             c.u64::<E>(GH_NRANKS)?,
        ranks_size:         c.u64::<E>(GH_RANKS_SIZE)?,
        ranks_start:        c.u64::<E>(GH_RANKS_START)?,
        global_header_size: declared,
        phys_origin:        c.optional(PHYS_ORIGIN, |c, o| c.f64x3::<E>(o))?.unwrap_or_default(),
        phys_scale:         c.optional(PHYS_SCALE, |c, o| c.f64x3::<E>(o))?.unwrap_or_default(),
        blocks_size:        c.optional(BLOCKS_SIZE, |c, o| c.u64::<E>(o))?.unwrap_or(0),
        blocks_start:       c.optional(BLOCKS_START, |c, o| c.u64::<E>(o))?.unwrap_or(0),
    })
}

fn decode_variable_as<E: ByteOrder>(c: &HeaderCursor<'_>) -> Result<VariableHeader> {
    Ok(VariableHeader {
        name:  c.c_string(0, NAME_SIZE)?,
        flags: c.u64::<E>(VH_FLAGS)?,
        size:  c.u64::<E>(VH_SIZE)?,
    })
}

fn decode_rank_as<E: ByteOrder>(c: &HeaderCursor<'_>, index: u64) -> Result<RankHeader> {
    Ok(RankHeader {
        coords:      c.u64x3::<E>(RH_COORDS)?,
        nelems:      c.u64::<E>(RH_NELEMS)?,
        start:       c.u64::<E>(RH_START)?,
        global_rank: c.optional(GLOBAL_RANK, |c, o| c.u64::<E>(o))?.unwrap_or(index),
    })
}

fn decode_block_as<E: ByteOrder>(c: &HeaderCursor<'_>) -> Result<BlockHeader> {
    let mut filters = [[0u8; FILTER_NAME_SIZE]; MAX_FILTERS];
    for (i, slot) in filters.iter_mut().enumerate() {
        slot.copy_from_slice(c.bytes(i * FILTER_NAME_SIZE, FILTER_NAME_SIZE)?);
    }
    Ok(BlockHeader {
        filters,
        start: c.u64::<E>(BH_START)?,
        size:  c.u64::<E>(BH_SIZE)?,
    })
}

pub fn decode_global(header: &[u8], endian: Endianness) -> Result<GlobalHeader> {
    match endian {
        Endianness::Little => decode_global_as::<LittleEndian>(header),
        Endianness::Big    => decode_global_as::<BigEndian>(header),
    }
}

/// Read just `HeaderSize` from the leading bytes of a file.
pub fn peek_header_size(prefix: &[u8], endian: Endianness) -> Result<u64> {
    let c = HeaderCursor::new(prefix, 0, (GH_HEADER_SIZE + 8) as u64, "global header")?;
    match endian {
        Endianness::Little => c.u64::<LittleEndian>(GH_HEADER_SIZE),
        Endianness::Big    => c.u64::<BigEndian>(GH_HEADER_SIZE),
    }
}

/// Bytes needed to learn the magic and `HeaderSize`.
pub const HEADER_PREFIX_SIZE: usize = GH_HEADER_SIZE + 8;

fn record_offset(start: u64, index: u64, size: u64) -> Result<u64> {
    index
        .checked_mul(size)
        .and_then(|o| o.checked_add(start))
        .ok_or_else(|| GioError::Format(format!("record {index} of size {size} overflows")))
}

pub fn decode_variable(header: &[u8], gh: &GlobalHeader, index: u64, endian: Endianness) -> Result<VariableHeader> {
    let at = record_offset(gh.vars_start, index, gh.vars_size)?;
    let c = HeaderCursor::new(header, at, gh.vars_size, "variable header")?;
    match endian {
        Endianness::Little => decode_variable_as::<LittleEndian>(&c),
        Endianness::Big    => decode_variable_as::<BigEndian>(&c),
    }
}

pub fn decode_rank(header: &[u8], gh: &GlobalHeader, index: u64, endian: Endianness) -> Result<RankHeader> {
    let at = record_offset(gh.ranks_start, index, gh.ranks_size)?;
    let c = HeaderCursor::new(header, at, gh.ranks_size, "rank header")?;
    match endian {
        Endianness::Little => decode_rank_as::<LittleEndian>(&c, index),
        Endianness::Big    => decode_rank_as::<BigEndian>(&c, index),
    }
}

pub fn decode_block(header: &[u8], gh: &GlobalHeader, rank: u64, var: u64, endian: Endianness) -> Result<BlockHeader> {
    let index = rank
        .checked_mul(gh.nvars)
        .and_then(|i| i.checked_add(var))
        .ok_or_else(|| GioError::Format(format!("block ({rank}, {var}) overflows")))?;
    let at = record_offset(gh.blocks_start, index, gh.blocks_size)?;
    let c = HeaderCursor::new(header, at, gh.blocks_size, "block header")?;
    match endian {
        Endianness::Little => decode_block_as::<LittleEndian>(&c),
        Endianness::Big    => decode_block_as::<BigEndian>(&c),
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Complete header contents, assembled by the writing root.
#[derive(Debug, Clone, Default)]
pub struct HeaderTables {
    pub global:    GlobalHeader,
    pub variables: Vec<VariableHeader>,
    pub ranks:     Vec<RankHeader>,
    /// One entry per (rank, variable), rank-major; `None` for flat files.
    pub blocks:    Option<Vec<BlockHeader>>,
}

impl HeaderTables {
    /// Fill in table offsets, counts and `HeaderSize` (trailer included).
    pub fn lay_out(&mut self) {
        let g = &mut self.global;
        g.global_header_size = GLOBAL_HEADER_SIZE as u64;
        g.nvars       = self.variables.len() as u64;
        g.vars_size   = VARIABLE_HEADER_SIZE as u64;
        g.vars_start  = g.global_header_size;
        g.nranks      = self.ranks.len() as u64;
        g.ranks_size  = RANK_HEADER_SIZE as u64;
        g.ranks_start = g.vars_start + g.nvars * g.vars_size;
        let mut end = g.ranks_start + g.nranks * g.ranks_size;
        match &self.blocks {
            Some(blocks) => {
                g.blocks_size  = BLOCK_HEADER_SIZE as u64;
                g.blocks_start = end;
                end += blocks.len() as u64 * g.blocks_size;
            }
            None => {
                g.blocks_size  = 0;
                g.blocks_start = 0;
            }
        }
        g.header_size = end + CRC_SIZE as u64;
    }

    /// Serialize the header in `endian` order, CRC trailer included.
    pub fn encode(&self, endian: Endianness) -> Result<Vec<u8>> {
        let mut out = match endian {
            Endianness::Little => self.encode_as::<LittleEndian>()?,
            Endianness::Big    => self.encode_as::<BigEndian>()?,
        };
        debug_assert_eq!(out.len() as u64 + CRC_SIZE as u64, self.global.header_size);
        let trailer = crc64_trailer(crc64(&out));
        out.extend_from_slice(&trailer);
        Ok(out)
    }

    fn encode_as<E: ByteOrder>(&self) -> Result<Vec<u8>> {
        let g = &self.global;
        let mut w: Vec<u8> = Vec::with_capacity(g.header_size as usize);

        w.extend_from_slice(magic_for(endianness_of::<E>()));
        w.write_u64::<E>(g.header_size)?;
        w.write_u64::<E>(g.nelems)?;
        for d in g.dims {
            w.write_u64::<E>(d)?;
        }
        w.write_u64::<E>(g.nvars)?;
        w.write_u64::<E>(g.vars_size)?;
        w.write_u64::<E>(g.vars_start)?;
        w.write_u64::<E>(g.nranks)?;
        w.write_u64::<E>(g.ranks_size)?;
        w.write_u64::<E>(g.ranks_start)?;
        w.write_u64::<E>(g.global_header_size)?;
        for v in g.phys_origin {
            w.write_f64::<E>(v)?;
        }
        for v in g.phys_scale {
            w.write_f64::<E>(v)?;
        }
        w.write_u64::<E>(g.blocks_size)?;
        w.write_u64::<E>(g.blocks_start)?;

        for var in &self.variables {
            let name = var.name.as_bytes();
            if name.len() >= NAME_SIZE {
                return Err(GioError::Format(format!(
                    "variable name {:?} exceeds {} bytes",
                    var.name,
                    NAME_SIZE - 1
                )));
            }
            let mut slot = [0u8; NAME_SIZE];
            slot[..name.len()].copy_from_slice(name);
            w.extend_from_slice(&slot);
            w.write_u64::<E>(var.flags)?;
            w.write_u64::<E>(var.size)?;
        }

        for rank in &self.ranks {
            for c in rank.coords {
                w.write_u64::<E>(c)?;
            }
            w.write_u64::<E>(rank.nelems)?;
            w.write_u64::<E>(rank.start)?;
            w.write_u64::<E>(rank.global_rank)?;
        }

        if let Some(blocks) = &self.blocks {
            for block in blocks {
                for slot in &block.filters {
                    w.extend_from_slice(slot);
                }
                w.write_u64::<E>(block.start)?;
                w.write_u64::<E>(block.size)?;
            }
        }

        Ok(w)
    }
}

fn endianness_of<E: ByteOrder>() -> Endianness {
    let mut marker = [0u8; 2];
    E::write_u16(&mut marker, 1);
    if marker[0] == 1 { Endianness::Little } else { Endianness::Big }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc64::verify_framed;

    fn sample_tables(with_blocks: bool) -> HeaderTables {
        let mut t = HeaderTables {
            global: GlobalHeader {
                nelems:      30,
                dims:        [2, 1, 1],
                phys_origin: [0.0, 0.5, 1.0],
                phys_scale:  [64.0, 64.0, 64.0],
                ..Default::default()
            },
            variables: vec![
                VariableHeader { name: "x".into(),  flags: VAR_FLAG_FLOAT | VAR_FLAG_SIGNED | VAR_FLAG_PHYS_X, size: 4 },
                VariableHeader { name: "id".into(), flags: VAR_FLAG_SIGNED, size: 8 },
            ],
            ranks: vec![
                RankHeader { coords: [0, 0, 0], nelems: 10, start: 0, global_rank: 0 },
                RankHeader { coords: [1, 0, 0], nelems: 20, start: 0, global_rank: 1 },
            ],
            blocks: None,
        };
        if with_blocks {
            let mut b = BlockHeader::with_filters(&["shuffle", "zstd"]).unwrap();
            b.start = 1234;
            b.size = 99;
            t.blocks = Some(vec![b; 4]);
        }
        t.lay_out();
        t
    }

    #[test]
    fn header_round_trips_in_both_orders() {
        for endian in [Endianness::Little, Endianness::Big] {
            let tables = sample_tables(true);
            let bytes = tables.encode(endian).unwrap();
            assert_eq!(bytes.len() as u64, tables.global.header_size);
            assert!(verify_framed(&bytes));
            assert_eq!(endianness_from_magic(&bytes).unwrap(), endian);

            let gh = decode_global(&bytes, endian).unwrap();
            assert_eq!(gh, tables.global);
            assert_eq!(decode_variable(&bytes, &gh, 1, endian).unwrap(), tables.variables[1]);
            assert_eq!(decode_rank(&bytes, &gh, 1, endian).unwrap(), tables.ranks[1]);
            let block = decode_block(&bytes, &gh, 1, 1, endian).unwrap();
            assert_eq!(block.filter_names(), vec!["shuffle", "zstd"]);
            assert_eq!((block.start, block.size), (1234, 99));
        }
    }

    #[test]
    fn flat_header_has_no_block_table() {
        let tables = sample_tables(false);
        let bytes = tables.encode(Endianness::Little).unwrap();
        let gh = decode_global(&bytes, Endianness::Little).unwrap();
        assert!(!gh.has_block_table());
        assert_eq!(gh.header_size, (GLOBAL_HEADER_SIZE + 2 * VARIABLE_HEADER_SIZE + 2 * RANK_HEADER_SIZE + CRC_SIZE) as u64);
    }

    #[test]
    fn optional_fields_default_on_short_headers() {
        let tables = sample_tables(false);
        let mut bytes = tables.encode(Endianness::Little).unwrap();
        // Pretend an older writer declared a 104-byte global header.
        LittleEndian::write_u64(&mut bytes[GH_GLOBAL_HEADER_SIZE..], MIN_GLOBAL_HEADER_SIZE as u64);
        let gh = decode_global(&bytes, Endianness::Little).unwrap();
        assert_eq!(gh.phys_origin, [0.0; 3]);
        assert_eq!(gh.phys_scale, [0.0; 3]);
        assert!(!gh.has_block_table());
        assert_eq!(gh.nelems, 30);
    }

    #[test]
    fn global_rank_defaults_to_index_on_short_rank_headers() {
        let tables = sample_tables(false);
        let bytes = tables.encode(Endianness::Little).unwrap();
        let mut gh = decode_global(&bytes, Endianness::Little).unwrap();
        gh.ranks_size = MIN_RANK_HEADER_SIZE as u64;
        let rank = decode_rank(&bytes, &gh, 1, Endianness::Little).unwrap();
        assert_eq!(rank.global_rank, 1);
    }

    #[test]
    fn cursor_rejects_out_of_range_records() {
        let tables = sample_tables(false);
        let bytes = tables.encode(Endianness::Little).unwrap();
        let gh = decode_global(&bytes, Endianness::Little).unwrap();
        assert!(matches!(decode_rank(&bytes, &gh, 5_000, Endianness::Little), Err(GioError::Format(_))));
        assert!(matches!(decode_global(&bytes[..50], Endianness::Little), Err(GioError::Format(_))));
    }

    #[test]
    fn bad_magic_is_a_format_error() {
        assert!(matches!(endianness_from_magic(b"HACC02L\0"), Err(GioError::Format(_))));
        assert!(matches!(endianness_from_magic(b"HA"), Err(GioError::Format(_))));
    }

    #[test]
    fn long_variable_names_are_rejected() {
        let mut tables = sample_tables(false);
        tables.variables[0].name = "v".repeat(NAME_SIZE);
        tables.lay_out();
        assert!(tables.encode(Endianness::Little).is_err());
    }
}
