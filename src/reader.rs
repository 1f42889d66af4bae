//! Collective read path.
//!
//! ```text
//! open_and_read_header ─► [rank-map lookup] ─► split root reads + checks header ─► broadcast
//! read_data            ─► per source rank: locate, read (retry), verify CRC, decode, swap
//!                      ─► one all-reduce of the error counters over the communicator
//! ```
//!
//! A reader is cheap to clone; clones share the open file and its header.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::backend::{BackendKind, FileHandle};
use crate::block::{decode_block, BlockCheck};
use crate::comm::Communicator;
use crate::config::GioConfig;
use crate::crc64::{verify_framed, Crc64, CRC_SENTINEL, CRC_SIZE};
use crate::diag::{record_or_warn, CrcFailure};
use crate::endian::swap_elements;
use crate::error::{GioError, Result};
use crate::handle::{HeaderSnapshot, OpenFile};
use crate::layout::{
    endianness_from_magic, peek_header_size, BlockHeader, HEADER_PREFIX_SIZE, MIN_GLOBAL_HEADER_SIZE,
};
use crate::redistribute::source_ranks;
use crate::variable::{Variable, VariableInfo};
use crate::writer::{partition_file_name, MAP_PARTITION};

/// How a difference between the file's rank count and the reading
/// communicator is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Rank counts must match.
    #[default]
    Disallowed,
    /// Any count; callers name the file rank they read.
    Allowed,
    /// File ranks are spread over the reading ranks.
    Redistribute,
}

/// What one rank read.
#[derive(Debug, Clone, Default)]
pub struct ReadStats {
    pub bytes_read: u64,
    pub elapsed:    Duration,
}

#[derive(Debug, Default)]
struct Counters {
    io:             u64,
    crc:            u64,
    decompress_crc: u64,
    rejected:       u64,
}

/// Where one (rank, variable) payload lives.
struct Location {
    offset:   u64,
    stored:   usize,
    filtered: Option<BlockHeader>,
}

#[derive(Clone)]
pub struct GioReader {
    comm:             Arc<dyn Communicator>,
    /// Ranks reading the same partition file as this one.
    group:            Arc<dyn Communicator>,
    path:             String,
    file_name:        String,
    config:           GioConfig,
    open:             Option<Arc<OpenFile>>,
    policy:           MismatchPolicy,
    source_ranks:     Vec<usize>,
    part_map_checked: bool,
}

impl GioReader {
    pub fn new(comm: Arc<dyn Communicator>, path: impl Into<String>, config: GioConfig) -> Self {
        let path = path.into();
        Self {
            group: comm.clone(),
            comm,
            file_name: path.clone(),
            path,
            config,
            open: None,
            policy: MismatchPolicy::Disallowed,
            source_ranks: Vec::new(),
            part_map_checked: false,
        }
    }

    /// Path the caller asked for.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// File actually read; `<path>#<p>` for partitioned files.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Drop this reader's reference to the open file.
    pub fn close(&mut self) {
        self.open = None;
        self.source_ranks.clear();
    }

    pub fn header(&self) -> Option<&HeaderSnapshot> {
        self.open.as_ref().map(|f| &f.header)
    }

    fn snapshot(&self) -> Result<&HeaderSnapshot> {
        self.header().ok_or(GioError::NotOpen)
    }

    // ── Opening ──────────────────────────────────────────────────────────────

    /// Collectively open the file and fetch its header.
    ///
    /// `eff_rank` replaces this rank's index when file ranks are assigned
    /// under [`MismatchPolicy::Redistribute`].  With `check_part_map` a
    /// rank-map file is followed to this rank's partition file.
    ///
    /// Fails on every rank of the communicator if any rank failed, including
    /// ranks of other partitions.
    pub fn open_and_read_header(
        &mut self,
        policy:         MismatchPolicy,
        eff_rank:       Option<usize>,
        check_part_map: bool,
    ) -> Result<()> {
        self.config.validate()?;
        let local = self.open_local(policy, eff_rank, check_part_map);
        let failures = self.comm.all_reduce_sum(u64::from(local.is_err()))?;
        match local {
            Err(e) => {
                self.close();
                Err(e)
            }
            Ok(()) if failures > 0 => {
                self.close();
                Err(GioError::RemoteHeader {
                    path:    self.file_name.clone(),
                    message: format!("open failed on {failures} other rank(s)"),
                })
            }
            Ok(()) => Ok(()),
        }
    }

    /// Open steps of this rank; collectives run only within the group or
    /// fail on every rank of the communicator alike.
    fn open_local(&mut self, policy: MismatchPolicy, eff_rank: Option<usize>, check_part_map: bool) -> Result<()> {
        if check_part_map && !self.part_map_checked {
            self.follow_rank_map()?;
        }

        let reuse = self.open.as_ref().is_some_and(|f| f.name == self.file_name);
        if !reuse {
            self.close();
            let opened = self.fetch_header()?;
            debug!(
                "{}: {} rank(s), {} variable(s), {} endian",
                opened.name,
                opened.header.num_ranks(),
                opened.header.global().nvars,
                opened.header.endian().name()
            );
            self.open = Some(Arc::new(opened));
        }

        let nranks = self.snapshot()?.num_ranks();
        if policy == MismatchPolicy::Disallowed && nranks != self.group.size() as u64 {
            return Err(GioError::RankMismatch {
                path:       self.file_name.clone(),
                file_ranks: nranks,
                comm_ranks: self.group.size(),
            });
        }

        self.policy = policy;
        self.source_ranks.clear();
        if policy == MismatchPolicy::Redistribute {
            let header = self.snapshot()?;
            let counts = (0..nranks).map(|r| header.rank(r).map(|h| h.nelems)).collect::<Result<Vec<_>>>()?;
            let me = eff_rank.unwrap_or_else(|| self.group.rank());
            self.source_ranks = source_ranks(&counts, me, self.group.size()).collect();
            debug!("{}: rank {me} reads file ranks {:?}", self.file_name, self.source_ranks);
        }
        Ok(())
    }

    /// Look in `path` for a rank map and retarget to this rank's partition.
    fn follow_rank_map(&mut self) -> Result<()> {
        let solo = self.comm.solo();
        let mut scout = self.clone();
        scout.comm = solo.clone();
        scout.group = solo;
        scout.file_name = self.path.clone();

        let scanned = scout.scan_partitions();
        let failures = self.comm.all_reduce_sum(u64::from(scanned.is_err()))?;
        let partitions = scanned?;
        if failures > 0 {
            return Err(GioError::RemoteHeader {
                path:    self.path.clone(),
                message: format!("rank map unreadable on {failures} rank(s)"),
            });
        }
        self.part_map_checked = true;

        let Some(map) = partitions else {
            return Ok(());
        };
        let partition = self.partition_for(&map)?;
        self.file_name = partition_file_name(&self.path, partition);
        self.group = self.comm.split(partition, self.comm.rank())?;
        debug!(
            "{}: rank {} reads partition {partition} ({} rank(s))",
            self.path,
            self.comm.rank(),
            self.group.size()
        );
        Ok(())
    }

    /// The `$partition` column of a rank map, or `None` for a plain file.
    fn scan_partitions(&mut self) -> Result<Option<Vec<i32>>> {
        self.open_and_read_header(MismatchPolicy::Allowed, None, false)?;
        if !self.variable_info()?.iter().any(|v| v.name == MAP_PARTITION) {
            return Ok(None);
        }
        let rows = self.read_num_elems(Some(0))? as usize;
        let mut map = vec![0i32; rows];
        self.read_data(&mut [Variable::new_mut(MAP_PARTITION, &mut map)], Some(0))?;
        Ok(Some(map))
    }

    fn partition_for(&self, map: &[i32]) -> Result<u64> {
        let rank = self.comm.rank();
        let size = self.comm.size();
        if size == map.len() {
            return Ok(map[rank] as u64);
        }
        let mut distinct: Vec<i32> = map.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        if size < distinct.len() {
            return Err(GioError::RankMismatch {
                path:       self.path.clone(),
                file_ranks: distinct.len() as u64,
                comm_ranks: size,
            });
        }
        Ok(distinct[rank * distinct.len() / size] as u64)
    }

    /// Open the file on every rank of the group; the group root reads and
    /// checks the header and shares it.
    fn fetch_header(&self) -> Result<OpenFile> {
        let name = self.file_name.clone();
        let backend = match self.config.backend {
            BackendKind::Posix => BackendKind::Posix,
            _ => BackendKind::Independent,
        };

        let opened = FileHandle::open(backend, &self.group, &name, true, self.config.collective_chunk);
        let open_failures = self.group.all_reduce_sum(u64::from(opened.is_err()))?;
        let file = opened?;
        if open_failures > 0 {
            return Err(GioError::RemoteHeader {
                path:    name,
                message: format!("{open_failures} rank(s) could not open the file"),
            });
        }

        // Status byte 0 and the header, or 1 and the root's error message.
        let mut root_error = None;
        let message = if self.group.rank() == 0 {
            match read_header_bytes(&file, &name) {
                Ok(bytes) => [&[0u8][..], &bytes].concat(),
                Err(e) => {
                    let msg = [&[1u8][..], e.to_string().as_bytes()].concat();
                    root_error = Some(e);
                    msg
                }
            }
        } else {
            Vec::new()
        };
        let message = self.group.broadcast(&message, 0)?;
        if let Some(e) = root_error {
            return Err(e);
        }
        match message.split_first() {
            Some((0, bytes)) => Ok(OpenFile { file, name, header: HeaderSnapshot::parse(bytes.to_vec())? }),
            Some((_, msg)) => Err(GioError::RemoteHeader {
                path:    name,
                message: String::from_utf8_lossy(msg).into_owned(),
            }),
            None => Err(GioError::RemoteHeader { path: name, message: "empty header broadcast".into() }),
        }
    }

    // ── Header queries ───────────────────────────────────────────────────────

    pub fn read_num_ranks(&self) -> Result<u64> {
        Ok(self.snapshot()?.num_ranks())
    }

    pub fn read_dims(&self) -> Result<[u64; 3]> {
        Ok(self.snapshot()?.global().dims)
    }

    pub fn read_coords(&self, rank: usize) -> Result<[u64; 3]> {
        Ok(self.snapshot()?.rank(rank as u64)?.coords)
    }

    /// Rank in the writing communicator of file rank `rank`.
    pub fn read_global_rank_number(&self, rank: usize) -> Result<u64> {
        Ok(self.snapshot()?.rank(rank as u64)?.global_rank)
    }

    /// Elements stored by file rank `rank`.  Without a rank: the elements
    /// this reader will receive from `read_data(None)`.
    pub fn read_num_elems(&self, rank: Option<usize>) -> Result<u64> {
        let header = self.snapshot()?;
        match rank {
            Some(r) => Ok(header.rank(r as u64)?.nelems),
            None if self.policy == MismatchPolicy::Redistribute => {
                self.source_ranks.iter().try_fold(0u64, |total, &r| {
                    let n = header.rank(r as u64)?.nelems;
                    total.checked_add(n).ok_or_else(|| overflow("element count", total, n))
                })
            }
            None => Ok(header.rank(self.group.rank() as u64)?.nelems),
        }
    }

    pub fn read_total_num_elems(&self) -> Result<u64> {
        Ok(self.snapshot()?.global().nelems)
    }

    pub fn read_phys_origin(&self) -> Result<[f64; 3]> {
        Ok(self.snapshot()?.global().phys_origin)
    }

    pub fn read_phys_scale(&self) -> Result<[f64; 3]> {
        Ok(self.snapshot()?.global().phys_scale)
    }

    pub fn variable_info(&self) -> Result<Vec<VariableInfo>> {
        Ok(self.snapshot()?.variables()?.iter().map(VariableInfo::from_header).collect())
    }

    /// File ranks assigned to this reader under `Redistribute`.
    pub fn source_ranks(&self) -> &[usize] {
        &self.source_ranks
    }

    // ── Data ─────────────────────────────────────────────────────────────────

    /// Collectively read `vars`.
    ///
    /// With `eff_rank` the given file rank is read.  Without it, this rank's
    /// own file rank is read, or under `Redistribute` all of its source ranks,
    /// concatenated in order.  Errors seen on any rank fail the call on all
    /// ranks.
    pub fn read_data(&self, vars: &mut [Variable<'_>], eff_rank: Option<usize>) -> Result<ReadStats> {
        let started = Instant::now();
        let mut counters = Counters::default();
        let mut stats = ReadStats::default();

        let local_error = match self.read_local(vars, eff_rank, &mut counters, &mut stats) {
            Ok(()) => None,
            Err(e) => {
                counters.rejected += 1;
                Some(e)
            }
        };

        let totals = self.comm.all_reduce_sum_vec(&[
            counters.io,
            counters.crc,
            counters.decompress_crc,
            counters.rejected,
        ])?;
        stats.elapsed = started.elapsed();

        if let Some(e) = local_error {
            return Err(e);
        }
        if totals.iter().any(|&n| n > 0) {
            error!(
                "{}: read failed ({} I/O, {} CRC, {} decompression CRC error(s), {} rank(s) rejected)",
                self.file_name, totals[0], totals[1], totals[2], totals[3]
            );
            return Err(GioError::ReadFailed {
                path:           self.file_name.clone(),
                io:             totals[0],
                crc:            totals[1],
                decompress_crc: totals[2],
                rejected:       totals[3],
            });
        }

        if self.config.verbose {
            let secs = stats.elapsed.as_secs_f64().max(f64::EPSILON);
            info!(
                "Read {} variable(s), {} bytes from {} in {:.3} s ({:.1} MB/s)",
                vars.len(),
                stats.bytes_read,
                self.file_name,
                secs,
                stats.bytes_read as f64 / secs / 1e6
            );
        }
        Ok(stats)
    }

    /// Everything `read_data` does on this rank before the collective check.
    fn read_local(
        &self,
        vars:     &mut [Variable<'_>],
        eff_rank: Option<usize>,
        counters: &mut Counters,
        stats:    &mut ReadStats,
    ) -> Result<()> {
        let open = self.open.as_ref().ok_or(GioError::NotOpen)?;
        let header = &open.header;

        let ranks: Vec<usize> = match eff_rank {
            Some(r) => vec![r],
            None if self.policy == MismatchPolicy::Redistribute => self.source_ranks.clone(),
            None => vec![self.group.rank()],
        };
        let mut rows = Vec::with_capacity(ranks.len());
        for &r in &ranks {
            rows.push(header.rank(r as u64)?);
        }
        let total_rows = rows.iter().try_fold(0u64, |total, h| {
            total.checked_add(h.nelems).ok_or_else(|| overflow("element count", total, h.nelems))
        })?;

        // Schema and buffer checks for every variable before any I/O.
        let table = header.variables()?;
        let mut plan = Vec::with_capacity(vars.len());
        for var in vars.iter_mut() {
            let mut bytes_before = 0u64;
            let mut found = None;
            for (index, entry) in table.iter().enumerate() {
                if entry.name == var.name() {
                    found = Some(index);
                    break;
                }
                bytes_before += entry.size;
            }
            let index = found.ok_or_else(|| GioError::VariableNotFound {
                name: var.name().to_owned(),
                path: self.file_name.clone(),
            })?;
            check_schema(var.info(), &VariableInfo::from_header(&table[index]))?;

            let extra = if var.has_extra_space() { CRC_SIZE } else { 0 };
            let need = elem_bytes(total_rows, var.elem_size())?
                .checked_add(extra)
                .ok_or_else(|| overflow("buffer size", total_rows, extra as u64))?;
            if var.bytes().len() < need {
                return Err(GioError::BufferTooSmall { name: var.name().to_owned(), have: var.bytes().len(), need });
            }
            if var.bytes_mut().is_none() {
                return Err(GioError::ReadOnlyVariable { name: var.name().to_owned() });
            }
            plan.push((index, bytes_before));
        }

        let host_order = header.endian().is_host();
        for (var, &(index, bytes_before)) in vars.iter_mut().zip(&plan) {
            let elem = var.elem_size();
            let name = var.name().to_owned();
            let extra = var.has_extra_space();
            let buf = var.bytes_mut().ok_or_else(|| GioError::ReadOnlyVariable { name: name.clone() })?;

            let mut row = 0usize;
            for (rank, rh) in ranks.iter().zip(&rows) {
                let len = elem_bytes(rh.nelems, elem)?;
                let at = row * elem;
                let loc = match header.block(*rank as u64, index as u64)? {
                    Some(block) => Location {
                        offset:   block.start,
                        stored:   block.size as usize,
                        filtered: block.is_filtered().then_some(block),
                    },
                    None => Location {
                        offset:   flat_offset(rh.start, rh.nelems, bytes_before, index)?,
                        stored:   len,
                        filtered: None,
                    },
                };
                if loc.filtered.is_none() && loc.stored != len {
                    return Err(GioError::Format(format!(
                        "block of {name} on rank {rank} holds {} bytes, expected {len}",
                        loc.stored
                    )));
                }

                let dest = &mut buf[at..];
                let intact = match &loc.filtered {
                    Some(block) => self.read_filtered(&open.file, &name, *rank, &loc, block, &mut dest[..len], elem, counters)?,
                    None => self.read_raw(&open.file, &name, *rank, &loc, dest, extra, counters),
                };
                if intact {
                    if !host_order {
                        swap_elements(&mut dest[..len], elem);
                    }
                    stats.bytes_read += (loc.stored + CRC_SIZE) as u64;
                }
                debug!("{}: {name} of rank {rank} ({len} bytes) at row {row}", self.file_name);
                row += rh.nelems as usize;
            }
        }
        Ok(())
    }

    fn with_retry<T>(&self, what: &str, mut op: impl FnMut() -> std::io::Result<T>) -> std::io::Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.config.retry_count => {
                    attempt += 1;
                    warn!("{what}: {e}; retry {attempt} of {}", self.config.retry_count);
                    std::thread::sleep(self.config.retry_sleep);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read an unfiltered payload into `dest` and check its trailer.
    ///
    /// With `extra` the trailer lands in the buffer right behind the payload
    /// and both arrive in one read.
    #[allow(clippy::too_many_arguments)]
    fn read_raw(
        &self,
        file:     &FileHandle,
        name:     &str,
        rank:     usize,
        loc:      &Location,
        dest:     &mut [u8],
        extra:    bool,
        counters: &mut Counters,
    ) -> bool {
        let len = loc.stored;
        let what = format!("{} {name} rank {rank}", self.file_name);
        let mut trailer = [0u8; CRC_SIZE];

        let read = if extra && dest.len() >= len + CRC_SIZE {
            self.with_retry(&what, || file.read_at(&mut dest[..len + CRC_SIZE], loc.offset))
                .map(|_| verify_framed(&dest[..len + CRC_SIZE]))
        } else {
            self.with_retry(&what, || {
                file.read_at(&mut dest[..len], loc.offset)?;
                file.read_at(&mut trailer, loc.offset + len as u64)
            })
            .map(|_| {
                let mut crc = Crc64::new();
                crc.update(&dest[..len]);
                crc.update(&trailer);
                crc.finish() == CRC_SENTINEL
            })
        };

        match read {
            Ok(true) => true,
            Ok(false) => {
                counters.crc += 1;
                let stored = if extra && dest.len() >= len + CRC_SIZE {
                    dest[..len + CRC_SIZE].to_vec()
                } else {
                    [&dest[..len], &trailer[..]].concat()
                };
                self.report_crc_failure(name, loc.offset, &stored, "payload CRC mismatch");
                false
            }
            Err(e) => {
                counters.io += 1;
                error!("{what}: giving up after {} retries: {e}", self.config.retry_count);
                false
            }
        }
    }

    /// Read a filtered block, check the stored bytes, then decode into `dest`.
    #[allow(clippy::too_many_arguments)]
    fn read_filtered(
        &self,
        file:     &FileHandle,
        name:     &str,
        rank:     usize,
        loc:      &Location,
        block:    &BlockHeader,
        dest:     &mut [u8],
        elem:     usize,
        counters: &mut Counters,
    ) -> Result<bool> {
        let what = format!("{} {name} rank {rank}", self.file_name);
        let mut stored = vec![0u8; loc.stored + CRC_SIZE];
        if let Err(e) = self.with_retry(&what, || file.read_at(&mut stored, loc.offset)) {
            counters.io += 1;
            error!("{what}: giving up after {} retries: {e}", self.config.retry_count);
            return Ok(false);
        }

        if !verify_framed(&stored) {
            counters.crc += 1;
            self.report_crc_failure(name, loc.offset, &stored, "block CRC mismatch");
            return Ok(false);
        }

        let endian = self.snapshot()?.endian();
        match decode_block(block, &stored[..loc.stored], dest, elem, endian)? {
            BlockCheck::Intact => Ok(true),
            BlockCheck::Corrupt(detail) => {
                counters.decompress_crc += 1;
                self.report_crc_failure(name, loc.offset, &stored, &detail);
                Ok(false)
            }
        }
    }

    fn report_crc_failure(&self, variable: &str, offset: u64, stored: &[u8], detail: &str) {
        record_or_warn(&self.config.diag_dir, &CrcFailure {
            rank: self.comm.rank(),
            path: &self.file_name,
            variable,
            offset,
            stored,
            detail,
        });
    }
}

fn overflow(what: &str, a: u64, b: u64) -> GioError {
    GioError::Format(format!("{what} overflows ({a} and {b})"))
}

/// Bytes of `nelems` elements of `elem` bytes each.
fn elem_bytes(nelems: u64, elem: usize) -> Result<usize> {
    usize::try_from(nelems)
        .ok()
        .and_then(|n| n.checked_mul(elem))
        .ok_or_else(|| overflow("payload size", nelems, elem as u64))
}

/// Start of variable `index` of a rank in a flat (block-less) file.
fn flat_offset(start: u64, nelems: u64, bytes_before: u64, index: usize) -> Result<u64> {
    nelems
        .checked_mul(bytes_before)
        .and_then(|o| o.checked_add(start))
        .and_then(|o| o.checked_add((index * CRC_SIZE) as u64))
        .ok_or_else(|| overflow("payload offset", start, nelems))
}

fn check_schema(mine: &VariableInfo, file: &VariableInfo) -> Result<()> {
    let mismatch = |detail: String| Err(GioError::SchemaMismatch { name: mine.name.clone(), detail });
    if mine.size != file.size {
        return mismatch(format!("element size {} in the file, {} requested", file.size, mine.size));
    }
    if mine.is_float != file.is_float {
        return mismatch(format!("file stores {}, requested {}", file.type_name(), mine.type_name()));
    }
    if mine.is_signed != file.is_signed {
        return mismatch(format!("file stores {}, requested {}", file.type_name(), mine.type_name()));
    }
    Ok(())
}

/// Root only: magic and size first, then the whole header, CRC checked.
fn read_header_bytes(file: &FileHandle, name: &str) -> Result<Vec<u8>> {
    let mut prefix = [0u8; HEADER_PREFIX_SIZE];
    file.read_at(&mut prefix, 0)?;
    let endian = endianness_from_magic(&prefix)?;
    let header_size = peek_header_size(&prefix, endian)?;

    let file_len = file.file_len()?;
    if header_size < (MIN_GLOBAL_HEADER_SIZE + CRC_SIZE) as u64 || header_size > file_len {
        return Err(GioError::Format(format!(
            "header size {header_size} is impossible for a {file_len}-byte file"
        )));
    }
    let mut bytes = vec![0u8; header_size as usize];
    file.read_at(&mut bytes, 0)?;
    if !verify_framed(&bytes) {
        return Err(GioError::HeaderCrc { path: name.to_owned() });
    }
    // Fail here, on the root, for structurally broken headers.
    HeaderSnapshot::parse(bytes.clone())?;
    Ok(bytes)
}
