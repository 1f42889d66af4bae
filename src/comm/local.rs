//! In-process communicator: one OS thread per rank.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::{default_processor_name, CommError, CommResult, Communicator};

/// How often a waiting rank re-checks whether a peer has aborted.
const ABORT_POLL: Duration = Duration::from_millis(50);

// ── Rendezvous state ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Round {
    slots:      Vec<Option<Vec<u8>>>,
    arrived:    usize,
    generation: u64,
    published:  Option<Arc<Vec<Vec<u8>>>>,
}

/// Shared state of one communicator; every member rank holds an `Arc` to it.
struct World {
    size:     usize,
    names:    Vec<String>,
    round:    Mutex<Round>,
    wake:     Condvar,
    /// Child worlds of pending splits, keyed by (split epoch, color), with
    /// the number of members that have picked theirs up.
    children: Mutex<HashMap<(u64, u64), (Arc<World>, usize)>>,
    /// Shared by the whole tree of worlds of one `run`.
    aborted:  Arc<AtomicBool>,
}

impl World {
    fn new(names: Vec<String>, aborted: Arc<AtomicBool>) -> Self {
        let size = names.len();
        Self {
            size,
            names,
            round: Mutex::new(Round { slots: vec![None; size], ..Default::default() }),
            wake: Condvar::new(),
            children: Mutex::new(HashMap::new()),
            aborted,
        }
    }

    fn lock(&self) -> CommResult<MutexGuard<'_, Round>> {
        self.round.lock().map_err(|_| CommError::Aborted("rendezvous lock poisoned".into()))
    }

    fn check_aborted(&self) -> CommResult<()> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(CommError::Aborted("a peer rank panicked".into()));
        }
        Ok(())
    }

    fn exchange(&self, rank: usize, data: &[u8]) -> CommResult<Arc<Vec<Vec<u8>>>> {
        self.check_aborted()?;
        let mut round = self.lock()?;
        let generation = round.generation;
        round.slots[rank] = Some(data.to_vec());
        round.arrived += 1;

        if round.arrived == self.size {
            let gathered: Vec<Vec<u8>> = round.slots.iter_mut().map(|s| s.take().unwrap_or_default()).collect();
            let gathered = Arc::new(gathered);
            round.published = Some(gathered.clone());
            round.arrived = 0;
            round.generation += 1;
            self.wake.notify_all();
            return Ok(gathered);
        }

        // The next round cannot complete without this rank, so `published`
        // still holds this round's result when the generation moves on.
        while round.generation == generation {
            self.check_aborted()?;
            let (guard, _) = self
                .wake
                .wait_timeout(round, ABORT_POLL)
                .map_err(|_| CommError::Aborted("rendezvous lock poisoned".into()))?;
            round = guard;
        }
        round
            .published
            .clone()
            .ok_or_else(|| CommError::Aborted("collective result missing".into()))
    }

    fn child(&self, epoch: u64, color: u64, names: Vec<String>) -> CommResult<Arc<World>> {
        let mut children = self
            .children
            .lock()
            .map_err(|_| CommError::Aborted("split lock poisoned".into()))?;
        let key = (epoch, color);
        let (world, joined) = children
            .entry(key)
            .or_insert_with(|| (Arc::new(World::new(names, self.aborted.clone())), 0));
        *joined += 1;
        let world = world.clone();
        // Every member calls in exactly once per split.
        if *joined == world.size {
            children.remove(&key);
        }
        Ok(world)
    }
}

// ── ThreadComm ───────────────────────────────────────────────────────────────

/// One rank's handle on an in-process communicator.
pub struct ThreadComm {
    world:  Arc<World>,
    rank:   usize,
    /// Number of splits issued through this handle; identical on every rank
    /// because splits are collective.
    splits: AtomicU64,
}

impl ThreadComm {
    fn new(world: Arc<World>, rank: usize) -> Self {
        Self { world, rank, splits: AtomicU64::new(0) }
    }

    /// Run `f` on `size` ranks, each on its own thread, and collect the
    /// results in rank order.  A panic on any rank aborts the collectives of
    /// the others and is re-raised here.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(Arc<dyn Communicator>) -> R + Sync,
    {
        Self::run_named(&vec![default_processor_name(); size], f)
    }

    /// Like [`ThreadComm::run`], with one processor name per rank.
    pub fn run_named<R, F>(names: &[String], f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(Arc<dyn Communicator>) -> R + Sync,
    {
        let aborted = Arc::new(AtomicBool::new(false));
        let world = Arc::new(World::new(names.to_vec(), aborted.clone()));
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..names.len())
                .map(|rank| {
                    let world = world.clone();
                    let aborted = aborted.clone();
                    let f = &f;
                    s.spawn(move || {
                        let _guard = AbortOnPanic(aborted);
                        f(Arc::new(ThreadComm::new(world, rank)))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

struct AbortOnPanic(Arc<AtomicBool>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize { self.rank }
    fn size(&self) -> usize { self.world.size }

    fn all_gather(&self, data: &[u8]) -> CommResult<Vec<Vec<u8>>> {
        let gathered = self.world.exchange(self.rank, data)?;
        Ok(gathered.as_ref().clone())
    }

    fn split(&self, color: u64, key: usize) -> CommResult<Arc<dyn Communicator>> {
        let epoch = self.splits.fetch_add(1, Ordering::Relaxed);
        let all = self.all_gather(&super::encode_words(&[color, key as u64]))?;

        let mut members = Vec::new();
        for (old_rank, bytes) in all.iter().enumerate() {
            let words = super::decode_words(bytes)?;
            if words.len() != 2 {
                return Err(CommError::Payload("split expects (color, key)".into()));
            }
            if words[0] == color {
                members.push((words[1], old_rank));
            }
        }
        members.sort_unstable();

        let new_rank = members
            .iter()
            .position(|&(_, r)| r == self.rank)
            .ok_or_else(|| CommError::Payload("rank missing from its own split".into()))?;
        let names = members.iter().map(|&(_, r)| self.world.names[r].clone()).collect();
        let world = self.world.child(epoch, color, names)?;
        Ok(Arc::new(ThreadComm::new(world, new_rank)))
    }

    fn processor_name(&self) -> String {
        self.world.names[self.rank].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_gather_orders_by_rank() {
        let out = ThreadComm::run(4, |comm| comm.all_gather(&[comm.rank() as u8]).unwrap());
        for gathered in out {
            assert_eq!(gathered, vec![vec![0], vec![1], vec![2], vec![3]]);
        }
    }

    #[test]
    fn repeated_collectives_stay_in_step() {
        let out = ThreadComm::run(3, |comm| {
            let mut total = 0;
            for i in 0..200u64 {
                total += comm.all_reduce_sum(i + comm.rank() as u64).unwrap();
            }
            total
        });
        let expected: u64 = (0..200u64).map(|i| 3 * i + 3).sum();
        assert!(out.iter().all(|&t| t == expected));
    }

    #[test]
    fn scatter_and_broadcast() {
        let out = ThreadComm::run(3, |comm| {
            let parts = (comm.rank() == 1).then(|| (0..3u8).map(|r| vec![r * 10]).collect());
            let mine = comm.scatter(parts, 1).unwrap();
            let shared = comm.broadcast(&[comm.rank() as u8 + 100], 2).unwrap();
            (mine, shared)
        });
        assert_eq!(out, vec![(vec![0], vec![102]), (vec![10], vec![102]), (vec![20], vec![102])]);
    }

    #[test]
    fn split_groups_by_color_and_orders_by_key() {
        let out = ThreadComm::run(5, |comm| {
            let color = (comm.rank() % 2) as u64;
            let key = 10 - comm.rank();
            let sub = comm.split(color, key).unwrap();
            let sum = sub.all_reduce_sum(comm.rank() as u64).unwrap();
            (sub.rank(), sub.size(), sum)
        });
        // Evens {0, 2, 4} reversed by key, odds {1, 3} reversed by key.
        assert_eq!(out, vec![(2, 3, 6), (1, 2, 4), (1, 3, 6), (0, 2, 4), (0, 3, 6)]);
    }

    #[test]
    fn panicking_rank_aborts_its_peers() {
        let result = std::panic::catch_unwind(|| {
            ThreadComm::run(2, |comm| {
                if comm.rank() == 0 {
                    panic!("rank 0 gives up");
                }
                comm.barrier()
            })
        });
        assert!(result.is_err());
    }

    #[test]
    fn processor_names_follow_ranks_through_splits() {
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let out = ThreadComm::run_named(&names, |comm| {
            let sub = comm.split(u64::from(comm.rank() > 0), comm.rank()).unwrap();
            sub.processor_name()
        });
        assert_eq!(out, names);
    }

    #[test]
    fn finished_splits_are_forgotten() {
        let world = Arc::new(World::new(vec![default_processor_name(); 3], Arc::new(AtomicBool::new(false))));
        std::thread::scope(|s| {
            for rank in 0..3 {
                let comm = ThreadComm::new(world.clone(), rank);
                s.spawn(move || {
                    for i in 0..50u64 {
                        let sub = comm.split((rank as u64 + i) % 2, rank).unwrap();
                        sub.barrier().unwrap();
                    }
                });
            }
        });
        assert!(world.children.lock().unwrap().is_empty());
    }
}
