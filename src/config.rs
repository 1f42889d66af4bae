//! Runtime configuration for readers and writers.
//!
//! One immutable [`GioConfig`] value is handed to each [`GioWriter`] /
//! [`GioReader`] at construction.  `GioConfig::from_env()` reads the
//! `GENERICIO_*` environment variables at call time; the `with_*` setters
//! override single fields afterwards.
//!
//! Defaults:
//! - no compression, flat layout (no block table)
//! - zstd at level 3 with byte-shuffle when compression is on
//! - 300 read retries, 100 ms apart
//! - POSIX backend, 64 MiB collective rounds
//!
//! [`GioWriter`]: crate::writer::GioWriter
//! [`GioReader`]: crate::reader::GioReader

use std::path::PathBuf;
use std::time::Duration;

use log::warn;

use crate::backend::BackendKind;
use crate::block::CompressionSettings;
use crate::codec::CodecId;
use crate::endian::ByteOrder;
use crate::error::{GioError, Result};

pub const DEFAULT_RETRY_COUNT:      u32   = 300;
pub const DEFAULT_RETRY_SLEEP_MS:   u64   = 100;
pub const DEFAULT_COLLECTIVE_CHUNK: usize = 64 * 1024 * 1024;
pub const DEFAULT_COMPRESSION_LEVEL: i32  = 3;

#[derive(Clone, Debug)]
pub struct GioConfig {
    /// Compress every block.
    /// Env: GENERICIO_COMPRESS (default false)
    pub compress: bool,

    /// Write a block table even without compression.
    /// Env: GENERICIO_FORCE_BLOCKS (default false)
    pub force_blocks: bool,

    /// Env: GENERICIO_CODEC (default zstd)
    pub codec: CodecId,

    /// Env: GENERICIO_COMPRESSION_LEVEL (default 3)
    pub compression_level: i32,

    /// Byte-shuffle elements before compressing.
    /// Env: GENERICIO_SHUFFLE (default true)
    pub shuffle: bool,

    /// Threads used to encode the blocks of one rank (0 = rayon default).
    /// Only honoured with the `parallel` feature.
    /// Env: GENERICIO_CODEC_THREADS (default 0)
    pub codec_threads: usize,

    /// Env: GENERICIO_RETRY_COUNT (default 300)
    pub retry_count: u32,

    /// Env: GENERICIO_RETRY_SLEEP in milliseconds (default 100)
    pub retry_sleep: Duration,

    /// Log read / write statistics at info level.
    /// Env: GENERICIO_VERBOSE (default false)
    pub verbose: bool,

    /// Explicit partition of this rank; overrides the two settings below.
    pub partition: Option<u64>,

    /// Partition ranks by processor name.
    /// Env: GENERICIO_PARTITIONS_USE_NAME (default false)
    pub partitions_use_name: bool,

    /// Debugging aid: partition = rank % n.
    /// Env: GENERICIO_RANK_PARTITIONS (default unset)
    pub rank_partitions: Option<u64>,

    /// Env: GENERICIO_BACKEND = posix | independent | collective (default posix)
    pub backend: BackendKind,

    /// Bytes per collective write round.
    /// Env: GENERICIO_COLLECTIVE_CHUNK (default 64 MiB)
    pub collective_chunk: usize,

    /// Where CRC failure dumps and the failure log go.
    /// Env: GENERICIO_DIAG_DIR (default: system temp dir)
    pub diag_dir: PathBuf,

    /// Byte order of newly written files.
    pub byte_order: ByteOrder,
}

impl Default for GioConfig {
    fn default() -> Self {
        Self {
            compress:            false,
            force_blocks:        false,
            codec:               CodecId::Zstd,
            compression_level:   DEFAULT_COMPRESSION_LEVEL,
            shuffle:             true,
            codec_threads:       0,
            retry_count:         DEFAULT_RETRY_COUNT,
            retry_sleep:         Duration::from_millis(DEFAULT_RETRY_SLEEP_MS),
            verbose:             false,
            partition:           None,
            partitions_use_name: false,
            rank_partitions:     None,
            backend:             BackendKind::Posix,
            collective_chunk:    DEFAULT_COLLECTIVE_CHUNK,
            diag_dir:            std::env::temp_dir(),
            byte_order:          ByteOrder::Native,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    let s = v.trim().to_ascii_lowercase();
    Some(matches!(s.as_str(), "1" | "true" | "on" | "yes"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let v = std::env::var(name).ok()?;
    match v.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!("ignoring {name}={v:?}: not a valid number");
            None
        }
    }
}

impl GioConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(on) = env_flag("GENERICIO_COMPRESS") {
            cfg.compress = on;
        }
        if let Some(on) = env_flag("GENERICIO_FORCE_BLOCKS") {
            cfg.force_blocks = on;
        }
        if let Ok(v) = std::env::var("GENERICIO_CODEC") {
            match CodecId::from_name(v.trim()) {
                Some(codec) => cfg.codec = codec,
                None => warn!("ignoring GENERICIO_CODEC={v:?}: unknown codec"),
            }
        }
        if let Some(level) = env_parse("GENERICIO_COMPRESSION_LEVEL") {
            cfg.compression_level = level;
        }
        if let Some(on) = env_flag("GENERICIO_SHUFFLE") {
            cfg.shuffle = on;
        }
        if let Some(n) = env_parse("GENERICIO_CODEC_THREADS") {
            cfg.codec_threads = n;
        }
        if let Some(n) = env_parse("GENERICIO_RETRY_COUNT") {
            cfg.retry_count = n;
        }
        if let Some(ms) = env_parse("GENERICIO_RETRY_SLEEP") {
            cfg.retry_sleep = Duration::from_millis(ms);
        }
        if let Some(on) = env_flag("GENERICIO_VERBOSE") {
            cfg.verbose = on;
        }
        if let Some(on) = env_flag("GENERICIO_PARTITIONS_USE_NAME") {
            cfg.partitions_use_name = on;
        }
        if let Some(n) = env_parse("GENERICIO_RANK_PARTITIONS") {
            cfg.rank_partitions = Some(n);
        }
        if let Ok(v) = std::env::var("GENERICIO_BACKEND") {
            match BackendKind::from_name(&v) {
                Some(kind) => cfg.backend = kind,
                None => warn!("ignoring GENERICIO_BACKEND={v:?}: unknown backend"),
            }
        }
        if let Some(n) = env_parse("GENERICIO_COLLECTIVE_CHUNK") {
            cfg.collective_chunk = n;
        }
        if let Ok(v) = std::env::var("GENERICIO_DIAG_DIR") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.diag_dir = PathBuf::from(s);
            }
        }

        cfg
    }

    /// Reject values no reader or writer can work with.
    pub fn validate(&self) -> Result<()> {
        if self.collective_chunk == 0 {
            return Err(GioError::Config("collective chunk must be at least one byte".into()));
        }
        if self.rank_partitions == Some(0) {
            return Err(GioError::Config("rank partitions must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether files written with this configuration carry a block table.
    pub fn uses_blocks(&self) -> bool {
        self.compress || self.force_blocks
    }

    /// Compression applied to blocks, if any.
    pub fn compression(&self) -> Option<CompressionSettings> {
        (self.compress && self.codec != CodecId::None).then_some(CompressionSettings {
            codec:   self.codec,
            level:   self.compression_level,
            shuffle: self.shuffle,
        })
    }

    pub fn with_compress(mut self, on: bool) -> Self {
        self.compress = on;
        self
    }

    pub fn with_force_blocks(mut self, on: bool) -> Self {
        self.force_blocks = on;
        self
    }

    pub fn with_codec(mut self, codec: CodecId) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_shuffle(mut self, on: bool) -> Self {
        self.shuffle = on;
        self
    }

    pub fn with_codec_threads(mut self, n: usize) -> Self {
        self.codec_threads = n;
        self
    }

    pub fn with_retry(mut self, count: u32, sleep: Duration) -> Self {
        self.retry_count = count;
        self.retry_sleep = sleep;
        self
    }

    pub fn with_verbose(mut self, on: bool) -> Self {
        self.verbose = on;
        self
    }

    pub fn with_partition(mut self, partition: Option<u64>) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_partitions_use_name(mut self, on: bool) -> Self {
        self.partitions_use_name = on;
        self
    }

    pub fn with_rank_partitions(mut self, n: Option<u64>) -> Self {
        self.rank_partitions = n;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_collective_chunk(mut self, bytes: usize) -> Self {
        self.collective_chunk = bytes;
        self
    }

    pub fn with_diag_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.diag_dir = dir.into();
        self
    }

    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }
}
