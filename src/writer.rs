//! Collective write path.
//!
//! Every rank of the communicator calls [`GioWriter::write`] with the same
//! list of variables.  Ranks are grouped by partition; each group writes one
//! file whose header is assembled and written by the group's rank 0:
//!
//! ```text
//! gather rank records ─► root lays out header, computes Starts ─► root writes header
//!                                                               │
//!       every rank writes payload ‖ trailer at its Start  ◄─ scatter Starts
//! ```
//!
//! With more than one partition the group files are named `<path>#<p>` and
//! global rank 0 writes a small rank-map file at `<path>` describing which
//! rank went where.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backend::FileHandle;
use crate::block::{encode_block, BlockBody, EncodedBlock};
use crate::comm::{decode_words, encode_words, Communicator};
use crate::config::GioConfig;
use crate::crc64::{crc64_parallel, crc64_trailer, CRC_SIZE};
use crate::endian::{swap_elements, Endianness};
use crate::error::{GioError, Result};
use crate::layout::{BlockHeader, GlobalHeader, HeaderTables, RankHeader, MAX_FILTERS};
use crate::variable::Variable;

// Rank-map variable names.
pub const MAP_RANK:      &str = "$rank";
pub const MAP_PARTITION: &str = "$partition";
pub const MAP_X:         &str = "$x";
pub const MAP_Y:         &str = "$y";
pub const MAP_Z:         &str = "$z";

/// Name of the file written by one partition.
pub fn partition_file_name(path: &str, partition: u64) -> String {
    format!("{path}#{partition}")
}

/// What one rank did during a write.
#[derive(Debug, Clone, Default)]
pub struct WriteStats {
    pub path:          String,
    pub partition:     u64,
    /// Payload and trailer bytes written by this rank.
    pub bytes_written: u64,
    /// Header bytes (non-zero on the group root only).
    pub header_bytes:  u64,
    pub elapsed:       Duration,
}

pub struct GioWriter {
    comm:        Arc<dyn Communicator>,
    path:        String,
    config:      GioConfig,
    num_elems:   u64,
    dims:        [u64; 3],
    coords:      [u64; 3],
    phys_origin: [f64; 3],
    phys_scale:  [f64; 3],
}

impl GioWriter {
    pub fn new(comm: Arc<dyn Communicator>, path: impl Into<String>, config: GioConfig) -> Self {
        let dims = [comm.size() as u64, 1, 1];
        let coords = [comm.rank() as u64, 0, 0];
        Self {
            comm,
            path: path.into(),
            config,
            num_elems: 0,
            dims,
            coords,
            phys_origin: [0.0; 3],
            phys_scale: [0.0; 3],
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of elements every variable of this rank holds.
    pub fn set_num_elems(&mut self, n: u64) {
        self.num_elems = n;
    }

    /// Global process grid and this rank's position in it.
    pub fn set_decomposition(&mut self, dims: [u64; 3], coords: [u64; 3]) {
        self.dims = dims;
        self.coords = coords;
    }

    pub fn set_phys_origin(&mut self, origin: [f64; 3]) {
        self.phys_origin = origin;
    }

    pub fn set_phys_scale(&mut self, scale: [f64; 3]) {
        self.phys_scale = scale;
    }

    /// Write `vars` collectively.  Fails on every rank if any rank failed.
    pub fn write(&self, vars: &mut [Variable<'_>]) -> Result<WriteStats> {
        self.config.validate()?;
        let started = Instant::now();

        // Reject bad buffers before anyone touches the file.
        let checked = self.check_variables(vars);
        let rejected = self.comm.all_reduce_sum(u64::from(checked.is_err()))?;
        checked?;
        if rejected > 0 {
            return Err(GioError::WriteFailed { path: self.path.clone(), failures: rejected });
        }

        let partition = self.select_partition()?;
        let group = self.comm.split(partition, self.comm.rank())?;
        let partitioned = group.size() != self.comm.size();
        let file_name = if partitioned { partition_file_name(&self.path, partition) } else { self.path.clone() };

        let mut stats = WriteStats { path: file_name.clone(), partition, ..Default::default() };
        let mut local_error = self.write_group(&group, &file_name, vars, &mut stats).err();

        if partitioned {
            if let Err(e) = self.write_rank_map(partition) {
                local_error.get_or_insert(e);
            }
        }

        let failures = self.comm.all_reduce_sum(u64::from(local_error.is_some()))?;
        stats.elapsed = started.elapsed();
        if let Some(e) = local_error {
            return Err(e);
        }
        if failures > 0 {
            return Err(GioError::WriteFailed { path: self.path.clone(), failures });
        }

        if self.config.verbose {
            let secs = stats.elapsed.as_secs_f64().max(f64::EPSILON);
            info!(
                "Wrote {} variable(s), {} bytes to {} in {:.3} s ({:.1} MB/s)",
                vars.len(),
                stats.bytes_written + stats.header_bytes,
                file_name,
                secs,
                (stats.bytes_written + stats.header_bytes) as f64 / secs / 1e6
            );
        }
        Ok(stats)
    }

    fn check_variables(&self, vars: &[Variable<'_>]) -> Result<()> {
        for var in vars {
            let need = (self.num_elems as usize)
                .checked_mul(var.elem_size())
                .ok_or_else(|| GioError::Format(format!("{} elements overflow", self.num_elems)))?;
            if var.payload_capacity() < need {
                return Err(GioError::BufferTooSmall {
                    name: var.name().to_owned(),
                    have: var.payload_capacity(),
                    need,
                });
            }
        }
        Ok(())
    }

    fn select_partition(&self) -> Result<u64> {
        if let Some(p) = self.config.partition {
            return Ok(p);
        }
        if self.config.partitions_use_name {
            let names = self.comm.all_gather(self.comm.processor_name().as_bytes())?;
            let mut distinct: Vec<&[u8]> = Vec::new();
            for name in &names {
                if !distinct.contains(&name.as_slice()) {
                    distinct.push(name.as_slice());
                }
            }
            let mine = names[self.comm.rank()].as_slice();
            let index = distinct.iter().position(|n| *n == mine).unwrap_or(0);
            return Ok(index as u64);
        }
        if let Some(n) = self.config.rank_partitions {
            return Ok(self.comm.rank() as u64 % n.max(1));
        }
        Ok(0)
    }

    // ── Group write ──────────────────────────────────────────────────────────

    fn write_group(
        &self,
        group:     &Arc<dyn Communicator>,
        file_name: &str,
        vars:      &mut [Variable<'_>],
        stats:     &mut WriteStats,
    ) -> Result<()> {
        let endian = self.config.byte_order.resolve();
        let mut local_error: Option<GioError> = None;

        let file = match FileHandle::open(self.config.backend, group, file_name, false, self.config.collective_chunk) {
            Ok(f) => Some(f),
            Err(e) => {
                local_error = Some(e);
                None
            }
        };

        // Byte-swapped copies of the payloads when the file is not host-endian.
        let len_of = |var: &Variable<'_>| self.num_elems as usize * var.elem_size();
        let swapped: Vec<Option<Vec<u8>>> = vars
            .iter()
            .map(|var| {
                (!endian.is_host() && var.elem_size() > 1).then(|| {
                    let mut copy = var.bytes()[..len_of(var)].to_vec();
                    swap_elements(&mut copy, var.elem_size());
                    copy
                })
            })
            .collect();

        let blocks = if self.config.uses_blocks() {
            let payloads: Vec<&[u8]> = vars
                .iter()
                .zip(&swapped)
                .map(|(var, copy)| copy.as_deref().unwrap_or(&var.bytes()[..len_of(var)]))
                .collect();
            let sizes: Vec<usize> = vars.iter().map(|v| v.elem_size()).collect();
            match self.encode_blocks(&payloads, &sizes, endian) {
                Ok(blocks) => Some(blocks),
                // The root rejects the short record, so the whole group fails.
                Err(e) => {
                    local_error.get_or_insert(e);
                    None
                }
            }
        } else {
            None
        };

        // Rank record: coords, nelems, global rank, then (size, filters) per block.
        let mut record = Vec::with_capacity(5 + vars.len() * (1 + MAX_FILTERS));
        record.extend_from_slice(&self.coords);
        record.push(self.num_elems);
        record.push(self.comm.rank() as u64);
        if let Some(blocks) = &blocks {
            for block in blocks {
                record.push(block.header.size);
                record.extend(block.header.filters.iter().map(|slot| u64::from_le_bytes(*slot)));
            }
        }

        let parts = match group.gather(&encode_words(&record), 0)? {
            None => None,
            Some(records) => Some(match self.plan_file(vars, &records, blocks.is_some(), endian) {
                Ok(plan) => {
                    if let Some(file) = &file {
                        match file.set_size(plan.file_size).and_then(|_| file.write_at(&plan.header, 0)) {
                            Ok(()) => {
                                stats.header_bytes = plan.header.len() as u64;
                                debug!("{file_name}: {} header bytes, {} file bytes", plan.header.len(), plan.file_size);
                            }
                            Err(e) => {
                                local_error.get_or_insert(e.into());
                            }
                        }
                    }
                    plan.starts.iter().map(|s| encode_words(s)).collect()
                }
                Err(e) => {
                    local_error.get_or_insert(e);
                    vec![Vec::new(); group.size()]
                }
            }),
        };
        let mine = decode_words(&group.scatter(parts, 0)?).unwrap_or_default();

        // An empty part means the root could not lay out the file.
        let (file, start, block_starts) = match (file, mine.split_first()) {
            (Some(file), Some((&start, rest))) => (file, start, rest.to_vec()),
            _ => return local_error.map_or(Ok(()), Err),
        };

        let mut offset = start;
        for (i, var) in vars.iter_mut().enumerate() {
            let len = self.num_elems as usize * var.elem_size();
            let at = match &blocks {
                Some(_) => block_starts.get(i).copied().unwrap_or(offset),
                None => offset,
            };
            let written = match &blocks {
                Some(blocks) => {
                    let block = &blocks[i];
                    let trailer = crc64_trailer(block.crc);
                    let body: &[u8] = match &block.body {
                        BlockBody::Filtered(bytes) => bytes,
                        BlockBody::Raw => swapped[i].as_deref().unwrap_or(&var.bytes()[..len]),
                    };
                    file.write_parts_at(&[body, &trailer], at).map(|_| body.len())
                }
                None => write_payload(&file, var, swapped[i].as_deref(), len, at).map(|_| len),
            };
            match written {
                Ok(n) => {
                    debug!("{file_name}: {} ({n} bytes) at {at}", var.name());
                    stats.bytes_written += (n + CRC_SIZE) as u64;
                    offset = at + (n + CRC_SIZE) as u64;
                }
                Err(e) => {
                    warn!("{file_name}: writing {} at {at} failed: {e}", var.name());
                    local_error.get_or_insert(e);
                    offset = at + (len + CRC_SIZE) as u64;
                }
            }
        }

        local_error.map_or(Ok(()), Err)
    }

    fn encode_blocks(&self, payloads: &[&[u8]], sizes: &[usize], endian: Endianness) -> Result<Vec<EncodedBlock>> {
        let settings = self.config.compression();
        let encode = |i: usize| -> Result<EncodedBlock> {
            encode_block(payloads[i], sizes[i], settings.as_ref(), endian).or_else(|e| {
                warn!("compression failed ({e}); storing block {i} raw");
                encode_block(payloads[i], sizes[i], None, endian)
            })
        };
        run_encoders(payloads.len(), self.config.codec_threads, encode)
    }

    /// Root only: header bytes, file size and per-rank starts.
    fn plan_file(
        &self,
        vars:       &[Variable<'_>],
        records:    &[Vec<u8>],
        has_blocks: bool,
        endian:     Endianness,
    ) -> Result<FilePlan> {
        let nvars = vars.len();
        let per_rank_words = 5 + if has_blocks { nvars * (1 + MAX_FILTERS) } else { 0 };

        let mut tables = HeaderTables {
            global: GlobalHeader {
                dims:        self.dims,
                phys_origin: self.phys_origin,
                phys_scale:  self.phys_scale,
                ..Default::default()
            },
            variables: vars.iter().map(|v| v.info().to_header()).collect(),
            ranks:     Vec::with_capacity(records.len()),
            blocks:    has_blocks.then(Vec::new),
        };

        for raw in records {
            let words = decode_words(raw)?;
            if words.len() != per_rank_words {
                return Err(GioError::Format(format!(
                    "rank record of {} words, expected {per_rank_words}",
                    words.len()
                )));
            }
            tables.ranks.push(RankHeader {
                coords:      [words[0], words[1], words[2]],
                nelems:      words[3],
                start:       0,
                global_rank: words[4],
            });
            if let Some(blocks) = tables.blocks.as_mut() {
                for entry in words[5..].chunks_exact(1 + MAX_FILTERS) {
                    let mut block = BlockHeader { size: entry[0], ..Default::default() };
                    for (slot, word) in block.filters.iter_mut().zip(&entry[1..]) {
                        *slot = word.to_le_bytes();
                    }
                    blocks.push(block);
                }
            }
        }
        tables.global.nelems = tables.ranks.iter().map(|r| r.nelems).sum();
        tables.lay_out();

        let record_size: u64 = vars.iter().map(|v| v.elem_size() as u64).sum();
        let trailer = CRC_SIZE as u64;
        let mut offset = tables.global.header_size;
        let mut starts = Vec::with_capacity(tables.ranks.len());
        for (r, rank) in tables.ranks.iter_mut().enumerate() {
            rank.start = offset;
            let mut mine = vec![offset];
            match tables.blocks.as_mut() {
                Some(blocks) => {
                    for block in &mut blocks[r * nvars..(r + 1) * nvars] {
                        block.start = offset;
                        mine.push(offset);
                        offset += block.size + trailer;
                    }
                }
                None => offset += rank.nelems * record_size + trailer * nvars as u64,
            }
            starts.push(mine);
        }

        let header = tables.encode(endian)?;
        Ok(FilePlan { header, file_size: offset, starts })
    }

    // ── Rank map ─────────────────────────────────────────────────────────────

    /// Gather every rank's partition and coordinates; global rank 0 writes them.
    fn write_rank_map(&self, partition: u64) -> Result<()> {
        let record = [partition, self.coords[0], self.coords[1], self.coords[2]];
        let gathered = match self.comm.gather(&encode_words(&record), 0)? {
            Some(g) => g,
            None => return Ok(()),
        };

        let n = gathered.len();
        let mut ranks = Vec::with_capacity(n);
        let (mut parts, mut xs, mut ys, mut zs) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        for (rank, raw) in gathered.iter().enumerate() {
            let w = decode_words(raw)?;
            if w.len() != 4 {
                return Err(GioError::Format("malformed rank-map record".into()));
            }
            ranks.push(rank as i32);
            parts.push(w[0] as i32);
            xs.push(w[1] as i32);
            ys.push(w[2] as i32);
            zs.push(w[3] as i32);
        }

        let config = self
            .config
            .clone()
            .with_partition(None)
            .with_rank_partitions(None)
            .with_partitions_use_name(false)
            .with_compress(false)
            .with_force_blocks(false);
        let mut map = GioWriter::new(self.comm.solo(), self.path.clone(), config);
        map.set_num_elems(n as u64);
        map.set_decomposition([1, 1, 1], [0, 0, 0]);
        map.write(&mut [
            Variable::new(MAP_RANK, &ranks),
            Variable::new(MAP_PARTITION, &parts),
            Variable::new(MAP_X, &xs),
            Variable::new(MAP_Y, &ys),
            Variable::new(MAP_Z, &zs),
        ])?;
        debug!("{}: rank map of {n} ranks written", self.path);
        Ok(())
    }
}

struct FilePlan {
    header:    Vec<u8>,
    file_size: u64,
    /// Per rank: payload start, then one start per block.
    starts:    Vec<Vec<u64>>,
}

/// Write one flat payload and its trailer.
///
/// When the caller's buffer carries extra space the trailer is placed there
/// so payload and trailer go out in one call; the caller's bytes are put
/// back afterwards.
fn write_payload(file: &FileHandle, var: &mut Variable<'_>, swapped: Option<&[u8]>, len: usize, at: u64) -> Result<()> {
    if let Some(payload) = swapped {
        let trailer = crc64_trailer(crc64_parallel(payload));
        return file.write_parts_at(&[payload, &trailer], at);
    }

    let trailer = crc64_trailer(crc64_parallel(&var.bytes()[..len]));
    if var.has_extra_space() {
        if let Some(buf) = var.bytes_mut().filter(|b| b.len() >= len + CRC_SIZE) {
            let mut saved = [0u8; CRC_SIZE];
            saved.copy_from_slice(&buf[len..len + CRC_SIZE]);
            buf[len..len + CRC_SIZE].copy_from_slice(&trailer);
            let written = file.write_parts_at(&[&buf[..len + CRC_SIZE]], at);
            buf[len..len + CRC_SIZE].copy_from_slice(&saved);
            return written;
        }
    }
    file.write_parts_at(&[&var.bytes()[..len], &trailer], at)
}

#[cfg(feature = "parallel")]
fn run_encoders<F>(n: usize, threads: usize, encode: F) -> Result<Vec<EncodedBlock>>
where
    F: Fn(usize) -> Result<EncodedBlock> + Sync,
{
    use rayon::prelude::*;

    let run = || (0..n).into_par_iter().map(&encode).collect::<Result<Vec<_>>>();
    if threads == 0 {
        return run();
    }
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(run),
        Err(e) => {
            warn!("could not build a {threads}-thread codec pool ({e}); using the global pool");
            run()
        }
    }
}

#[cfg(not(feature = "parallel"))]
fn run_encoders<F>(n: usize, _threads: usize, encode: F) -> Result<Vec<EncodedBlock>>
where
    F: Fn(usize) -> Result<EncodedBlock>,
{
    (0..n).map(encode).collect()
}
