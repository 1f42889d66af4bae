//! Shared state of an open container file.
//!
//! A reader caches one [`OpenFile`] behind an `Arc`.  Cursor copies of a
//! reader share it, and the underlying file closes when the last copy lets
//! go of it.

use crate::backend::FileHandle;
use crate::endian::Endianness;
use crate::error::{GioError, Result};
use crate::layout::{
    decode_block, decode_global, decode_rank, decode_variable, endianness_from_magic, BlockHeader,
    GlobalHeader, RankHeader, VariableHeader,
};

/// Header bytes of one file plus the decoded global header.
#[derive(Debug, Clone)]
pub struct HeaderSnapshot {
    bytes:  Vec<u8>,
    endian: Endianness,
    global: GlobalHeader,
}

impl HeaderSnapshot {
    /// Decode the global header and check that the tables it declares fit.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let endian = endianness_from_magic(&bytes)?;
        let global = decode_global(&bytes, endian)?;
        if global.header_size != bytes.len() as u64 {
            return Err(GioError::Format(format!(
                "header declares {} bytes but {} were read",
                global.header_size,
                bytes.len()
            )));
        }
        let snapshot = Self { bytes, endian, global };
        // Touch the last entry of every table so a lying header fails here.
        if snapshot.global.nvars > 0 {
            snapshot.variable(snapshot.global.nvars - 1)?;
        }
        if snapshot.global.nranks > 0 {
            snapshot.rank(snapshot.global.nranks - 1)?;
            if snapshot.global.has_block_table() && snapshot.global.nvars > 0 {
                snapshot.block(snapshot.global.nranks - 1, snapshot.global.nvars - 1)?;
            }
        }
        Ok(snapshot)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    pub fn global(&self) -> &GlobalHeader {
        &self.global
    }

    pub fn num_ranks(&self) -> u64 {
        self.global.nranks
    }

    pub fn variable(&self, index: u64) -> Result<VariableHeader> {
        decode_variable(&self.bytes, &self.global, index, self.endian)
    }

    pub fn variables(&self) -> Result<Vec<VariableHeader>> {
        (0..self.global.nvars).map(|i| self.variable(i)).collect()
    }

    pub fn rank(&self, index: u64) -> Result<RankHeader> {
        if index >= self.global.nranks {
            return Err(GioError::InvalidRank { rank: index as usize, nranks: self.global.nranks });
        }
        decode_rank(&self.bytes, &self.global, index, self.endian)
    }

    /// Block descriptor of (`rank`, `var`), or `None` for flat files.
    pub fn block(&self, rank: u64, var: u64) -> Result<Option<BlockHeader>> {
        if !self.global.has_block_table() {
            return Ok(None);
        }
        decode_block(&self.bytes, &self.global, rank, var, self.endian).map(Some)
    }
}

/// An open file and its cached header.
#[derive(Debug)]
pub struct OpenFile {
    pub file:   FileHandle,
    pub name:   String,
    pub header: HeaderSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HeaderTables;

    fn tables() -> HeaderTables {
        let mut t = HeaderTables {
            variables: vec![VariableHeader { name: "id".into(), flags: 2, size: 8 }],
            ranks: vec![RankHeader { nelems: 3, ..Default::default() }; 2],
            ..Default::default()
        };
        t.lay_out();
        t
    }

    #[test]
    fn snapshot_decodes_tables() {
        let bytes = tables().encode(Endianness::Big).unwrap();
        let snap = HeaderSnapshot::parse(bytes).unwrap();
        assert_eq!(snap.endian(), Endianness::Big);
        assert_eq!(snap.num_ranks(), 2);
        assert_eq!(snap.variables().unwrap()[0].name, "id");
        assert_eq!(snap.rank(1).unwrap().nelems, 3);
        assert!(snap.block(0, 0).unwrap().is_none());
        assert!(matches!(snap.rank(2), Err(GioError::InvalidRank { rank: 2, nranks: 2 })));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let mut bytes = tables().encode(Endianness::Little).unwrap();
        bytes.truncate(bytes.len() - 30);
        assert!(matches!(HeaderSnapshot::parse(bytes), Err(GioError::Format(_))));
    }
}
