//! In-process communicators.
//!
//! [`Solo`] is a world of one. [`LocalWorld`] runs several ranks as threads
//! of the current process: each all-gather deposits the caller's buffer in a
//! shared slot table, waits for every rank, copies all slots out, and waits
//! again before the slots may be reused.
//!
//! A rank that panics aborts the world. Ranks waiting in an exchange, and
//! every later exchange, fail instead of blocking.

use super::Communicator;
use anyhow::{Context, Result, anyhow, bail};
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{trace, warn};

/// Single-process communicator: rank 0 of a world of size 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct Solo;

impl Communicator for Solo {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather_varcount<T>(&self, send: &[T], counts: &[usize]) -> Result<Vec<T>>
    where
        T: Clone + Send + 'static,
    {
        if counts != [send.len()] {
            bail!("count mismatch: sending {} elements, counts are {:?}", send.len(), counts);
        }
        Ok(send.to_vec())
    }
}

type Slot = Option<Box<dyn Any + Send>>;

/// Barrier state: arrivals in the current round, completed rounds, and the
/// first rank that aborted the world.
#[derive(Debug, Default)]
struct Rendezvous {
    arrived: usize,
    generation: u64,
    aborted_by: Option<usize>,
}

#[derive(Debug)]
struct Exchange {
    size: usize,
    rendezvous: Mutex<Rendezvous>,
    turn: Condvar,
    slots: Mutex<Vec<Slot>>,
}

impl Exchange {
    fn slots(&self) -> Result<MutexGuard<'_, Vec<Slot>>> {
        self.slots.lock().map_err(|_| anyhow!("exchange lock poisoned by a panicking rank"))
    }

    fn rendezvous(&self) -> Result<MutexGuard<'_, Rendezvous>> {
        self.rendezvous.lock().map_err(|_| anyhow!("rendezvous lock poisoned by a panicking rank"))
    }

    /// Blocks until every rank has arrived, or fails once the world is
    /// aborted.
    fn wait(&self) -> Result<()> {
        let mut state = self.rendezvous()?;
        if let Some(rank) = state.aborted_by {
            bail!("peer rank {rank} aborted the world; exchange abandoned");
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.turn.notify_all();
            return Ok(());
        }

        while state.generation == generation {
            if let Some(rank) = state.aborted_by {
                bail!("peer rank {rank} aborted the world; exchange abandoned");
            }
            state = self
                .turn
                .wait(state)
                .map_err(|_| anyhow!("rendezvous lock poisoned by a panicking rank"))?;
        }
        Ok(())
    }

    /// Marks the world as aborted by `rank` and wakes every waiter.
    fn abort(&self, rank: usize) {
        let mut state = self.rendezvous.lock().unwrap_or_else(PoisonError::into_inner);
        state.aborted_by.get_or_insert(rank);
        drop(state);
        self.turn.notify_all();
    }

    fn aborted_by(&self) -> Option<usize> {
        self.rendezvous.lock().unwrap_or_else(PoisonError::into_inner).aborted_by
    }
}

/// Aborts the world if its rank unwinds.
struct AbortOnPanic<'a> {
    exchange: &'a Exchange,
    rank: usize,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!(rank = self.rank, "ndflat.local.abort");
            self.exchange.abort(self.rank);
        }
    }
}

/// A world of `size` ranks living in one process.
///
/// ```
/// use ndflat_core::{Communicator, LocalWorld};
///
/// let world = LocalWorld::new(3);
/// let gathered = world.run(|comm| comm.all_gather(comm.rank() * 10).unwrap());
///
/// for per_rank in gathered {
///     assert_eq!(per_rank, vec![0, 10, 20]);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LocalWorld {
    size: usize,
    exchange: Arc<Exchange>,
}

impl LocalWorld {
    /// Creates a world with `size` ranks
    #[must_use]
    pub fn new(size: usize) -> Self {
        let exchange = Exchange {
            size,
            rendezvous: Mutex::new(Rendezvous::default()),
            turn: Condvar::new(),
            slots: Mutex::new((0..size).map(|_| None).collect()),
        };
        Self { size, exchange: Arc::new(exchange) }
    }

    /// Number of ranks
    pub fn size(&self) -> usize {
        self.size
    }

    /// One communicator per rank, in rank order. Each must be driven from
    /// its own thread.
    ///
    /// Threads driven this way are not watched for panics; call
    /// [`LocalComm::abort`] when a rank gives up, or prefer
    /// [`LocalWorld::run`].
    pub fn communicators(&self) -> Vec<LocalComm> {
        (0..self.size)
            .map(|rank| LocalComm { rank, size: self.size, exchange: Arc::clone(&self.exchange) })
            .collect()
    }

    /// Runs `f` once per rank on scoped threads and returns the results in
    /// rank order.
    ///
    /// If a rank panics, the world is aborted so the other ranks' exchanges
    /// fail rather than wait, and the first panic is resumed on the caller.
    /// An aborted world stays aborted.
    pub fn run<F, R>(&self, f: F) -> Vec<R>
    where
        F: Fn(LocalComm) -> R + Sync,
        R: Send,
    {
        let f = &f;
        let exchange = &*self.exchange;
        let outcomes: Vec<thread::Result<R>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .communicators()
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let _guard = AbortOnPanic { exchange, rank: comm.rank };
                        f(comm)
                    })
                })
                .collect();

            handles.into_iter().map(|handle| handle.join()).collect()
        });

        if outcomes.iter().any(Result::is_err) {
            let first = exchange.aborted_by().unwrap_or(0);
            let mut panics: Vec<_> = outcomes
                .into_iter()
                .enumerate()
                .filter_map(|(rank, outcome)| outcome.err().map(|payload| (rank, payload)))
                .collect();
            let position = panics.iter().position(|(rank, _)| *rank == first).unwrap_or(0);
            let (_, payload) = panics.swap_remove(position);
            std::panic::resume_unwind(payload);
        }

        outcomes.into_iter().filter_map(Result::ok).collect()
    }
}

/// Handle of one rank in a [`LocalWorld`].
#[derive(Debug, Clone)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    exchange: Arc<Exchange>,
}

impl LocalComm {
    /// Aborts the world this rank belongs to. Pending and later exchanges
    /// on every rank fail.
    pub fn abort(&self) {
        self.exchange.abort(self.rank);
    }

    fn collect<T: Clone + 'static>(&self, counts: &[usize]) -> Result<Vec<T>> {
        let slots = self.exchange.slots()?;
        let mut gathered = Vec::with_capacity(counts.iter().sum());

        for (rank, (slot, &count)) in slots.iter().zip(counts).enumerate() {
            let part = slot
                .as_ref()
                .and_then(|boxed| boxed.downcast_ref::<Vec<T>>())
                .with_context(|| format!("rank {rank} did not contribute a matching buffer"))?;
            if part.len() != count {
                bail!("rank {rank} sent {} elements, expected {count}", part.len());
            }
            gathered.extend_from_slice(part);
        }

        Ok(gathered)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather_varcount<T>(&self, send: &[T], counts: &[usize]) -> Result<Vec<T>>
    where
        T: Clone + Send + 'static,
    {
        // Every rank must reach both rendezvous points, even with bad
        // arguments, or the others would wait forever.
        let valid = counts.len() == self.size && counts.get(self.rank) == Some(&send.len());
        let deposited = self.exchange.slots().map(|mut slots| {
            slots[self.rank] = valid.then(|| Box::new(send.to_vec()) as Box<dyn Any + Send>);
        });

        let gathered = self.exchange.wait().and_then(|()| {
            let gathered = if valid { self.collect(counts) } else { Ok(Vec::new()) };
            self.exchange.wait()?;
            gathered
        });

        trace!(rank = self.rank, sent = send.len(), ok = gathered.is_ok(), "ndflat.local.all_gather");

        deposited?;
        if !valid {
            bail!(
                "rank {} sent {} elements but counts are {:?} for a world of {}",
                self.rank,
                send.len(),
                counts,
                self.size
            );
        }
        gathered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_varcount_concatenates_in_rank_order() {
        let world = LocalWorld::new(3);
        let results = world.run(|comm| {
            let send: Vec<u32> = (0..comm.rank() as u32).collect();
            comm.all_gather_varcount(&send, &[0, 1, 2]).unwrap()
        });

        for gathered in results {
            assert_eq!(gathered, vec![0, 0, 1]);
        }
    }

    #[test]
    fn test_repeated_rounds_do_not_mix() {
        let world = LocalWorld::new(4);
        let results = world.run(|comm| {
            let first = comm.all_gather(comm.rank()).unwrap();
            let second = comm.all_gather(format!("r{}", comm.rank())).unwrap();
            (first, second)
        });

        for (first, second) in results {
            assert_eq!(first, vec![0, 1, 2, 3]);
            assert_eq!(second, vec!["r0", "r1", "r2", "r3"]);
        }
    }

    #[test]
    fn test_bad_counts_fail_without_deadlock() {
        let world = LocalWorld::new(2);
        let results = world.run(|comm| comm.all_gather_varcount(&[1u8, 2], &[1, 1]));

        assert!(results.iter().all(Result::is_err));
    }

    /// Runs `f` on a helper thread and fails the test if it takes longer
    /// than ten seconds.
    fn within_deadline<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
        let (done, outcome) = mpsc::channel();
        thread::spawn(move || {
            let _ = done.send(f());
        });
        outcome.recv_timeout(Duration::from_secs(10)).expect("world did not finish in time")
    }

    #[test]
    fn test_panicking_rank_releases_waiting_peers() {
        let caught = within_deadline(|| {
            panic::catch_unwind(AssertUnwindSafe(|| {
                LocalWorld::new(3).run(|comm| {
                    if comm.rank() == 0 {
                        panic!("rank zero failed");
                    }
                    comm.all_gather(1u8).unwrap()
                })
            }))
        });

        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"rank zero failed"));
    }

    #[test]
    fn test_exchanges_fail_after_abort() {
        let world = LocalWorld::new(2);
        let errors = within_deadline(move || {
            world.run(|comm| {
                if comm.rank() == 1 {
                    comm.abort();
                }
                comm.all_gather(comm.rank()).unwrap_err().to_string()
            })
        });

        for message in errors {
            assert!(message.contains("peer rank 1 aborted the world"), "{message}");
        }
    }

    #[test]
    fn test_abort_after_a_completed_round_keeps_results() {
        let world = LocalWorld::new(2);
        let comms = world.communicators();

        let results = within_deadline(move || {
            thread::scope(|scope| {
                let handles: Vec<_> = comms
                    .iter()
                    .map(|comm| scope.spawn(move || comm.all_gather(comm.rank() * 2)))
                    .collect();
                let gathered: Vec<_> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();

                comms[0].abort();
                (gathered, comms[1].all_gather(5).is_err())
            })
        });

        assert_eq!(results.0, vec![vec![0, 2], vec![0, 2]]);
        assert!(results.1);
    }

    #[test]
    fn test_solo_checks_counts() {
        assert_eq!(Solo.all_gather_varcount(&[1, 2], &[2]).unwrap(), vec![1, 2]);
        assert!(Solo.all_gather_varcount(&[1, 2], &[3]).is_err());
        assert_eq!(Solo.all_gather(7).unwrap(), vec![7]);
    }
}
