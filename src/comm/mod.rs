//! Message-passing abstraction.
//!
//! Every collective the container needs is expressed on top of one
//! primitive, [`Communicator::all_gather`].  A binding to a real
//! message-passing runtime implements that plus `split`, and may override
//! any provided collective with a native one.  Two implementations ship
//! with the crate:
//! - [`SelfComm`], a single-rank communicator;
//! - [`ThreadComm`], one thread per rank inside one process.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

mod local;

pub use local::ThreadComm;

#[derive(Error, Debug)]
pub enum CommError {
    /// A peer went away (panicked or dropped) in the middle of a collective.
    #[error("Communicator aborted: {0}")]
    Aborted(String),
    #[error("Root rank {root} is out of range for a communicator of size {size}")]
    InvalidRoot { root: usize, size: usize },
    #[error("Malformed collective payload: {0}")]
    Payload(String),
}

pub type CommResult<T> = std::result::Result<T, CommError>;

// ── Communicator trait ───────────────────────────────────────────────────────

/// A group of ranks that run the same program and meet in collectives.
///
/// All collectives must be called by every rank of the communicator, in the
/// same order.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Every rank contributes `data`; every rank receives all contributions
    /// in rank order.
    fn all_gather(&self, data: &[u8]) -> CommResult<Vec<Vec<u8>>>;

    /// Partition the communicator by `color`.  Within a color, new ranks are
    /// ordered by `key`, then by the old rank.
    fn split(&self, color: u64, key: usize) -> CommResult<Arc<dyn Communicator>>;

    /// A single-rank communicator holding only this rank.
    fn solo(&self) -> Arc<dyn Communicator> {
        Arc::new(SelfComm::new(self.processor_name()))
    }

    /// Name of the host this rank runs on.
    fn processor_name(&self) -> String {
        default_processor_name()
    }

    // ── Provided collectives ─────────────────────────────────────────────────

    fn barrier(&self) -> CommResult<()> {
        self.all_gather(&[]).map(|_| ())
    }

    /// Every rank receives `root`'s `data`; other ranks' `data` is ignored.
    fn broadcast(&self, data: &[u8], root: usize) -> CommResult<Vec<u8>> {
        check_root(root, self.size())?;
        let send: &[u8] = if self.rank() == root { data } else { &[] };
        let mut all = self.all_gather(send)?;
        Ok(std::mem::take(&mut all[root]))
    }

    /// `root` receives every rank's `data`; the others receive `None`.
    fn gather(&self, data: &[u8], root: usize) -> CommResult<Option<Vec<Vec<u8>>>> {
        check_root(root, self.size())?;
        let all = self.all_gather(data)?;
        Ok((self.rank() == root).then_some(all))
    }

    /// `root` supplies one part per rank; each rank receives its own part.
    fn scatter(&self, parts: Option<Vec<Vec<u8>>>, root: usize) -> CommResult<Vec<u8>> {
        check_root(root, self.size())?;
        let packed = match (self.rank() == root, parts) {
            (true, Some(parts)) if parts.len() == self.size() => pack_parts(&parts),
            (true, Some(parts)) => {
                return Err(CommError::Payload(format!(
                    "scatter root supplied {} parts for {} ranks",
                    parts.len(),
                    self.size()
                )))
            }
            (true, None) => return Err(CommError::Payload("scatter root supplied no parts".into())),
            (false, _) => Vec::new(),
        };
        let packed = self.broadcast(&packed, root)?;
        let mut parts = unpack_parts(&packed)?;
        if parts.len() != self.size() {
            return Err(CommError::Payload(format!("scatter produced {} parts", parts.len())));
        }
        Ok(std::mem::take(&mut parts[self.rank()]))
    }

    fn all_reduce_sum(&self, value: u64) -> CommResult<u64> {
        Ok(self.all_reduce_sum_vec(&[value])?[0])
    }

    /// Element-wise sum of equally long vectors.
    fn all_reduce_sum_vec(&self, values: &[u64]) -> CommResult<Vec<u64>> {
        let all = self.all_gather(&encode_words(values))?;
        let mut acc = vec![0u64; values.len()];
        for contribution in &all {
            let words = decode_words(contribution)?;
            if words.len() != acc.len() {
                return Err(CommError::Payload(format!(
                    "all-reduce of {} values met a contribution of {}",
                    acc.len(),
                    words.len()
                )));
            }
            for (a, w) in acc.iter_mut().zip(words) {
                *a = a.wrapping_add(w);
            }
        }
        Ok(acc)
    }

    fn all_reduce_max(&self, value: u64) -> CommResult<u64> {
        let all = self.all_gather(&value.to_le_bytes())?;
        let mut max = 0;
        for contribution in &all {
            max = max.max(decode_words(contribution)?.first().copied().unwrap_or(0));
        }
        Ok(max)
    }
}

fn check_root(root: usize, size: usize) -> CommResult<()> {
    if root >= size {
        return Err(CommError::InvalidRoot { root, size });
    }
    Ok(())
}

pub(crate) fn default_processor_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

// ── Wire helpers ─────────────────────────────────────────────────────────────

/// Little-endian words, the in-memory message format of collectives.
pub fn encode_words(words: &[u64]) -> Vec<u8> {
    let mut out = vec![0u8; words.len() * 8];
    LittleEndian::write_u64_into(words, &mut out);
    out
}

pub fn decode_words(bytes: &[u8]) -> CommResult<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        return Err(CommError::Payload(format!("{} bytes is not a whole number of words", bytes.len())));
    }
    let mut out = vec![0u64; bytes.len() / 8];
    LittleEndian::read_u64_into(bytes, &mut out);
    Ok(out)
}

fn pack_parts(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut out = encode_words(&[parts.len() as u64]);
    for part in parts {
        out.extend_from_slice(&encode_words(&[part.len() as u64]));
        out.extend_from_slice(part);
    }
    out
}

fn take<'a>(bytes: &mut &'a [u8], n: usize) -> CommResult<&'a [u8]> {
    if bytes.len() < n {
        return Err(CommError::Payload("truncated scatter payload".into()));
    }
    let (head, tail) = bytes.split_at(n);
    *bytes = tail;
    Ok(head)
}

fn unpack_parts(mut bytes: &[u8]) -> CommResult<Vec<Vec<u8>>> {
    let count = LittleEndian::read_u64(take(&mut bytes, 8)?) as usize;
    let mut parts = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let len = LittleEndian::read_u64(take(&mut bytes, 8)?) as usize;
        parts.push(take(&mut bytes, len)?.to_vec());
    }
    Ok(parts)
}

// ── SelfComm ─────────────────────────────────────────────────────────────────

/// The communicator of a single, unaccompanied rank.
#[derive(Debug, Clone)]
pub struct SelfComm {
    name: String,
}

impl SelfComm {
    pub fn new(processor_name: impl Into<String>) -> Self {
        Self { name: processor_name.into() }
    }
}

impl Default for SelfComm {
    fn default() -> Self {
        Self::new(default_processor_name())
    }
}

impl Communicator for SelfComm {
    fn rank(&self) -> usize { 0 }
    fn size(&self) -> usize { 1 }

    fn all_gather(&self, data: &[u8]) -> CommResult<Vec<Vec<u8>>> {
        Ok(vec![data.to_vec()])
    }

    fn split(&self, _color: u64, _key: usize) -> CommResult<Arc<dyn Communicator>> {
        Ok(Arc::new(self.clone()))
    }

    fn processor_name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_comm_collectives_are_identity() {
        let comm = SelfComm::default();
        assert_eq!(comm.broadcast(b"abc", 0).unwrap(), b"abc");
        assert_eq!(comm.all_reduce_sum(7).unwrap(), 7);
        assert_eq!(comm.all_reduce_sum_vec(&[1, 2]).unwrap(), vec![1, 2]);
        assert_eq!(comm.scatter(Some(vec![b"x".to_vec()]), 0).unwrap(), b"x");
        assert_eq!(comm.gather(b"g", 0).unwrap(), Some(vec![b"g".to_vec()]));
        assert!(matches!(comm.broadcast(b"", 1), Err(CommError::InvalidRoot { .. })));
    }

    #[test]
    fn parts_pack_and_unpack() {
        let parts = vec![vec![], b"hello".to_vec(), vec![0u8; 17]];
        assert_eq!(unpack_parts(&pack_parts(&parts)).unwrap(), parts);
        assert!(unpack_parts(&pack_parts(&parts)[..20]).is_err());
    }

    #[test]
    fn ragged_words_are_rejected() {
        assert!(decode_words(&[0u8; 9]).is_err());
        assert_eq!(decode_words(&encode_words(&[3, u64::MAX])).unwrap(), vec![3, u64::MAX]);
    }
}
