use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::comm::CommError;

#[derive(Error, Debug)]
pub enum GioError {
    #[error("Unable to open {path}: {source}")]
    Open {
        path:   String,
        #[source]
        source: io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid file format: {0}")]
    Format(String),
    #[error("Header CRC mismatch in {path}")]
    HeaderCrc { path: String },
    /// Header validation failed on the split root; raised on the other ranks.
    #[error("Header of {path} rejected by the reading root: {message}")]
    RemoteHeader { path: String, message: String },
    #[error("{path} was written by {file_ranks} rank(s) but is being read by {comm_ranks}")]
    RankMismatch {
        path:       String,
        file_ranks: u64,
        comm_ranks: usize,
    },
    #[error("Variable {name} not found in {path}")]
    VariableNotFound { name: String, path: String },
    #[error("Variable {name} does not match the file: {detail}")]
    SchemaMismatch { name: String, detail: String },
    #[error("Buffer for {name} holds {have} bytes but {need} are required")]
    BufferTooSmall { name: String, have: usize, need: usize },
    #[error("Variable {name} was registered with a read-only buffer")]
    ReadOnlyVariable { name: String },
    #[error("Rank {rank} is out of range (file has {nranks} rank(s))")]
    InvalidRank { rank: usize, nranks: u64 },
    #[error("No file is open")]
    NotOpen,
    #[error(
        "Read of {path} failed: {io} I/O error(s), {crc} CRC error(s), \
         {decompress_crc} decompression CRC error(s), {rejected} rank(s) rejected the request"
    )]
    ReadFailed {
        path:           String,
        io:             u64,
        crc:            u64,
        decompress_crc: u64,
        /// Ranks that failed before reading (schema, buffer, rank errors).
        rejected:       u64,
    },
    #[error("Write of {path} failed on {failures} rank(s)")]
    WriteFailed { path: String, failures: u64 },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Comm(#[from] CommError),
}

pub type Result<T> = std::result::Result<T, GioError>;
