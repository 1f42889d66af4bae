//! GenericIO: the self-describing parallel container used by HACC.
//!
//! Every rank of a communicator contributes a slice of each variable; one
//! file (or one file per partition) holds a CRC-protected header followed by
//! the per-rank payloads.

pub mod crc64;
pub mod endian;
pub mod layout;
pub mod codec;
pub mod block;
pub mod variable;
pub mod comm;
pub mod backend;
pub mod handle;
pub mod redistribute;
pub mod diag;
pub mod config;
pub mod error;
pub mod writer;
pub mod reader;

pub use backend::BackendKind;
pub use codec::{CodecId, get_codec};
pub use comm::{Communicator, SelfComm, ThreadComm};
pub use config::GioConfig;
pub use endian::{ByteOrder, Endianness};
pub use error::{GioError, Result};
pub use reader::{GioReader, MismatchPolicy, ReadStats};
pub use variable::{Element, Variable, VariableInfo};
pub use writer::{GioWriter, WriteStats, partition_file_name};
