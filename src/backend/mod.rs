//! Positional file I/O behind one handle type.
//!
//! | Kind          | Open                                  | Payload writes              |
//! |---------------|---------------------------------------|-----------------------------|
//! | `Posix`       | every rank on its own                 | independent                 |
//! | `Independent` | root creates, then the rest; failures summed | independent          |
//! | `Collective`  | as `Independent`                      | rounds of `collective_chunk`|
//!
//! Reads and root-only header writes are always independent.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::sync::Arc;

use crate::comm::Communicator;
use crate::error::{GioError, Result};

// ── BackendKind ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Posix,
    Independent,
    Collective,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Posix       => "posix",
            BackendKind::Independent => "independent",
            BackendKind::Collective  => "collective",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "posix"       => Some(BackendKind::Posix),
            "independent" => Some(BackendKind::Independent),
            "collective" | "mpi" => Some(BackendKind::Collective),
            _             => None,
        }
    }
}

// ── Positional primitives ────────────────────────────────────────────────────

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

/// Read exactly `buf.len()` bytes, retrying interrupted and short reads.
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match pread(file, buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("end of file at byte {offset} with {} bytes still to read", buf.len()),
                ))
            }
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write all of `buf`, retrying interrupted and short writes.
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match pwrite(file, buf, offset) {
            Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, format!("no progress writing at byte {offset}"))),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write bytes `[from, to)` of the concatenation of `parts`, starting at file
/// offset `base + from`.
fn write_span(file: &File, parts: &[&[u8]], base: u64, from: usize, to: usize) -> io::Result<()> {
    let mut part_start = 0usize;
    for part in parts {
        let part_end = part_start + part.len();
        let lo = from.max(part_start);
        let hi = to.min(part_end);
        if lo < hi {
            write_all_at(file, &part[lo - part_start..hi - part_start], base + lo as u64)?;
        }
        part_start = part_end;
    }
    Ok(())
}

// ── FileHandle ───────────────────────────────────────────────────────────────

/// An open container file, one per rank.
pub enum FileHandle {
    Posix {
        file: File,
        path: String,
    },
    Independent {
        file: File,
        path: String,
        comm: Arc<dyn Communicator>,
    },
    Collective {
        file:  File,
        path:  String,
        comm:  Arc<dyn Communicator>,
        chunk: usize,
    },
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("kind", &self.kind().name())
            .field("path", &self.path())
            .finish()
    }
}

fn open_local(path: &str, for_reading: bool, create: bool, truncate: bool) -> io::Result<File> {
    if for_reading {
        File::open(path)
    } else {
        OpenOptions::new().read(true).write(true).create(create).truncate(truncate).open(path)
    }
}

impl FileHandle {
    /// Open `path` on every rank of `comm`.
    ///
    /// `Posix` opens are rank-local.  The coordinated kinds let split rank 0
    /// create and truncate the file before anyone else opens it, and fail on
    /// every rank if any rank failed.
    pub fn open(
        kind:             BackendKind,
        comm:             &Arc<dyn Communicator>,
        path:             &str,
        for_reading:      bool,
        collective_chunk: usize,
    ) -> Result<Self> {
        let open_err = |source: io::Error| GioError::Open { path: path.to_owned(), source };

        if kind == BackendKind::Posix {
            let file = open_local(path, for_reading, true, false).map_err(open_err)?;
            return Ok(FileHandle::Posix { file, path: path.to_owned() });
        }

        let opened = if comm.rank() == 0 {
            let opened = open_local(path, for_reading, true, true);
            comm.barrier()?;
            opened
        } else {
            comm.barrier()?;
            open_local(path, for_reading, false, false)
        };

        let failures = comm.all_reduce_sum(u64::from(opened.is_err()))?;
        let file = match opened {
            Ok(file) if failures == 0 => file,
            Ok(_) => {
                return Err(open_err(io::Error::new(
                    ErrorKind::Other,
                    format!("{failures} other rank(s) failed to open the file"),
                )))
            }
            Err(e) => return Err(open_err(e)),
        };

        let comm = comm.clone();
        let path = path.to_owned();
        Ok(match kind {
            BackendKind::Collective => FileHandle::Collective {
                file,
                path,
                comm,
                chunk: collective_chunk.max(1),
            },
            _ => FileHandle::Independent { file, path, comm },
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            FileHandle::Posix { .. }       => BackendKind::Posix,
            FileHandle::Independent { .. } => BackendKind::Independent,
            FileHandle::Collective { .. }  => BackendKind::Collective,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            FileHandle::Posix { path, .. }
            | FileHandle::Independent { path, .. }
            | FileHandle::Collective { path, .. } => path,
        }
    }

    fn file(&self) -> &File {
        match self {
            FileHandle::Posix { file, .. }
            | FileHandle::Independent { file, .. }
            | FileHandle::Collective { file, .. } => file,
        }
    }

    pub fn file_len(&self) -> io::Result<u64> {
        Ok(self.file().metadata()?.len())
    }

    /// Pre-size or truncate the file.
    pub fn set_size(&self, size: u64) -> io::Result<()> {
        self.file().set_len(size)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        read_exact_at(self.file(), buf, offset)
    }

    /// Independent write, used for the header by the writing root.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        write_all_at(self.file(), buf, offset)
    }

    /// Write the concatenation of `parts` at `offset`.
    ///
    /// On a `Collective` handle every rank of the communicator must call this
    /// the same number of times.  A local I/O error does not stop the rank
    /// from taking part in the remaining rounds; it is returned afterwards.
    pub fn write_parts_at(&self, parts: &[&[u8]], offset: u64) -> Result<()> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let (comm, chunk) = match self {
            FileHandle::Collective { comm, chunk, .. } => (comm, *chunk),
            _ => return Ok(write_span(self.file(), parts, offset, 0, total)?),
        };

        let mut done = 0usize;
        let mut failure: Option<io::Error> = None;
        loop {
            if failure.is_none() && done < total {
                let end = (done + chunk).min(total);
                match write_span(self.file(), parts, offset, done, end) {
                    Ok(()) => done = end,
                    Err(e) => failure = Some(e),
                }
            }
            let left = if failure.is_some() { 0 } else { (total - done) as u64 };
            if comm.all_reduce_max(left)? == 0 {
                break;
            }
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SelfComm, ThreadComm};

    fn solo() -> Arc<dyn Communicator> {
        Arc::new(SelfComm::default())
    }

    #[test]
    fn kinds_parse_by_name() {
        for kind in [BackendKind::Posix, BackendKind::Independent, BackendKind::Collective] {
            assert_eq!(BackendKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(BackendKind::from_name("MPI"), Some(BackendKind::Collective));
        assert_eq!(BackendKind::from_name("nfs"), None);
    }

    #[test]
    fn positional_round_trip_and_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let path = path.to_str().unwrap();
        let h = FileHandle::open(BackendKind::Posix, &solo(), path, false, 0).unwrap();
        h.set_size(16).unwrap();
        h.write_parts_at(&[&b"abc"[..], &[], &b"defg"[..]], 4).unwrap();

        let r = FileHandle::open(BackendKind::Posix, &solo(), path, true, 0).unwrap();
        let mut buf = [0u8; 7];
        r.read_at(&mut buf, 4).unwrap();
        assert_eq!(&buf, b"abcdefg");
        let mut tail = [0u8; 4];
        let err = r.read_at(&mut tail, 14).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.gio");
        let err = FileHandle::open(BackendKind::Posix, &solo(), path.to_str().unwrap(), true, 0).unwrap_err();
        assert!(matches!(err, GioError::Open { .. }));
    }

    #[test]
    fn coordinated_open_fails_on_every_rank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.gio");
        let path = path.to_str().unwrap().to_owned();
        let out = ThreadComm::run(3, |comm| {
            FileHandle::open(BackendKind::Independent, &comm, &path, true, 0).is_err()
        });
        assert_eq!(out, vec![true, true, true]);
    }

    #[test]
    fn collective_rounds_tolerate_uneven_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.bin");
        let path = path.to_str().unwrap().to_owned();
        ThreadComm::run(3, |comm| {
            let h = FileHandle::open(BackendKind::Collective, &comm, &path, false, 5).unwrap();
            assert_eq!(h.kind(), BackendKind::Collective);
            // Rank r writes 10 * r bytes of value r at offset 100 * r.
            let r = comm.rank();
            let payload = vec![r as u8 + 1; 10 * r];
            h.write_parts_at(&[&payload[..payload.len() / 2], &payload[payload.len() / 2..]], 100 * r as u64)
                .unwrap();
        });
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[100..110], &[2u8; 10]);
        assert_eq!(&bytes[200..220], &[3u8; 20]);
        assert_eq!(bytes.len(), 220);
    }
}
