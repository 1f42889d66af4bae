//! Post-mortem material for CRC failures.
//!
//! When a payload fails its CRC the raw bytes as read are dumped to
//! `gio_crc_dump.r<rank>.<file>.<variable>.bin` and one line is appended to
//! `gio_crc_errors.log`, both inside the configured diagnostics directory.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::warn;

pub const CRC_LOG_NAME: &str = "gio_crc_errors.log";

/// Bytes shown in hex in the log line.
const PREVIEW_BYTES: usize = 32;

/// One payload that failed verification.
#[derive(Debug)]
pub struct CrcFailure<'a> {
    pub rank:     usize,
    pub path:     &'a str,
    pub variable: &'a str,
    pub offset:   u64,
    /// Bytes as read from the file, trailer included.
    pub stored:   &'a [u8],
    pub detail:   &'a str,
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '#') { c } else { '_' })
        .collect()
}

pub fn dump_path(dir: &Path, rank: usize, path: &str, variable: &str) -> PathBuf {
    let base = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned());
    dir.join(format!("gio_crc_dump.r{rank}.{}.{}.bin", sanitize(&base), sanitize(variable)))
}

/// Write the dump and the log line.
pub fn record(dir: &Path, failure: &CrcFailure<'_>) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let dump = dump_path(dir, failure.rank, failure.path, failure.variable);
    fs::write(&dump, failure.stored)?;

    let preview = &failure.stored[..failure.stored.len().min(PREVIEW_BYTES)];
    let line = format!(
        "{} rank {} file {} variable {} offset {} length {}: {} [{}]\n",
        Utc::now().to_rfc3339(),
        failure.rank,
        failure.path,
        failure.variable,
        failure.offset,
        failure.stored.len(),
        failure.detail,
        hex::encode(preview),
    );
    let mut log = OpenOptions::new().create(true).append(true).open(dir.join(CRC_LOG_NAME))?;
    log.write_all(line.as_bytes())?;
    Ok(dump)
}

/// [`record`], with failures to write the diagnostics only logged.
pub fn record_or_warn(dir: &Path, failure: &CrcFailure<'_>) {
    match record(dir, failure) {
        Ok(dump) => warn!(
            "CRC failure in {} ({}) on rank {}; raw bytes saved to {}",
            failure.path,
            failure.variable,
            failure.rank,
            dump.display()
        ),
        Err(e) => warn!(
            "CRC failure in {} ({}) on rank {}; could not save diagnostics: {e}",
            failure.path, failure.variable, failure.rank
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_and_log_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let stored: Vec<u8> = (0u8..40).collect();
        let failure = CrcFailure {
            rank:     3,
            path:     "/scratch/run/out.gio#2",
            variable: "vel x",
            offset:   4096,
            stored:   &stored,
            detail:   "payload CRC mismatch",
        };
        let dump = record(dir.path(), &failure).unwrap();
        assert_eq!(dump.file_name().unwrap(), "gio_crc_dump.r3.out.gio#2.vel_x.bin");
        assert_eq!(fs::read(&dump).unwrap(), stored);

        record(dir.path(), &failure).unwrap();
        let log = fs::read_to_string(dir.path().join(CRC_LOG_NAME)).unwrap();
        assert_eq!(log.lines().count(), 2);
        let first = log.lines().next().unwrap();
        assert!(first.contains("rank 3"));
        assert!(first.contains("offset 4096"));
        assert!(first.contains(&hex::encode(&stored[..32])));
        assert!(!first.contains(&hex::encode(&stored[..33])));
    }
}
