//! Assembling per-process structures into one global structure.
//!
//! Every participating process holds a local depth-(K-1) structure. Calling
//! [`Nested::assemble`] on all of them in lock-step produces, on every
//! process, the same depth-K structure whose first index is the rank:
//! `global.at(r)` reads exactly what rank `r` held locally.
//!
//! # Protocol
//!
//! 1. **Counts.** Every layer all-gathers its local node count, outermost
//!    first. The global layer size is the sum over ranks.
//! 2. **Allocate.** Every global buffer is reserved from the summed counts.
//! 3. **Buffers.** Every layer all-gathers its offsets (without the leading
//!    zero) or its values, placed rank after rank.
//! 4. **Rebase.** Offsets from rank `r` are relative to rank `r`'s own lower
//!    buffer; they are shifted by the lower-layer length of ranks `0..r`.
//!
//! All ranks must call `assemble` (and `refresh_from`) with structures of
//! the same depth, or the exchange deadlocks. This is not checked.

mod local;

pub use local::{LocalComm, LocalWorld, Solo};

use crate::error::{NdError, Result};
use crate::layer::private::TOKEN;
use crate::layer::{Layer, Nested};
use crate::offset::Offset;
use tracing::{debug, warn};

/// The collective-communication substrate.
///
/// This is the only capability assembly needs: an all-gather with a
/// per-rank element count, plus the caller's rank and the world size.
/// The element type stands in for a wire datatype tag.
pub trait Communicator {
    /// Rank of the calling process, in `0..size()`
    fn rank(&self) -> usize;

    /// Number of participating processes
    fn size(&self) -> usize;

    /// Gathers `counts[r]` elements from every rank `r`, concatenated in
    /// rank order. `send` is this rank's contribution and must hold exactly
    /// `counts[self.rank()]` elements.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails or the counts disagree with
    /// what was sent.
    fn all_gather_varcount<T>(&self, send: &[T], counts: &[usize]) -> anyhow::Result<Vec<T>>
    where
        T: Clone + Send + 'static;

    /// Gathers one value from every rank.
    ///
    /// # Errors
    ///
    /// See [`Communicator::all_gather_varcount`].
    fn all_gather<T>(&self, value: T) -> anyhow::Result<Vec<T>>
    where
        T: Clone + Send + 'static,
    {
        let ones = vec![1; self.size()];
        self.all_gather_varcount(std::slice::from_ref(&value), &ones)
    }
}

impl<C: Communicator + ?Sized> Communicator for &C {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn all_gather_varcount<T>(&self, send: &[T], counts: &[usize]) -> anyhow::Result<Vec<T>>
    where
        T: Clone + Send + 'static,
    {
        (**self).all_gather_varcount(send, counts)
    }
}

impl<L: Layer, I: Offset> Nested<L, I>
where
    L::Data: Clone + Send + 'static,
{
    /// Builds the global structure from this rank's local one.
    ///
    /// Must be called by every rank of `comm` at the same time.
    ///
    /// # Errors
    ///
    /// - [`NdError::Communication`] if the communicator fails
    /// - [`NdError::IndexOverflow`] if a global offset does not fit `I`
    pub fn assemble<C: Communicator>(comm: &C, local: &L) -> Result<Self> {
        let mut global = Self::default();
        global.assemble_into(comm, local)?;
        Ok(global)
    }

    /// As [`Nested::assemble`], into an existing uninitialized structure.
    ///
    /// On failure the structure is reset to empty.
    ///
    /// # Errors
    ///
    /// - [`NdError::AlreadyInitialized`] if the buffers already exist
    /// - [`NdError::Communication`] if the communicator fails
    /// - [`NdError::IndexOverflow`] if a global offset does not fit `I`
    pub fn assemble_into<C: Communicator>(&mut self, comm: &C, local: &L) -> Result<()> {
        if self.is_initialized() {
            return Err(NdError::AlreadyInitialized);
        }

        let result = self.gather_all(comm, local);
        if result.is_err() {
            *self = Self::default();
        }
        result
    }

    fn gather_all<C: Communicator>(&mut self, comm: &C, local: &L) -> Result<()> {
        let mut counts = Vec::with_capacity(L::DEPTH);
        self.lower.gather_counts(TOKEN, comm, local, &mut counts)?;

        // One node per rank on top
        self.nodes = comm.size();
        self.allocate(TOKEN);

        let per_rank = counts.first().cloned().unwrap_or_default();
        for count in per_rank {
            let end = self.last_offset() + count;
            self.push_offset(end)?;
        }

        self.lower.gather_buffers(TOKEN, comm, local, &counts)?;

        debug!(
            depth = Self::DEPTH,
            rank = comm.rank(),
            ranks = comm.size(),
            shape = ?self.shape(),
            "ndflat.assemble"
        );
        Ok(())
    }

    /// Re-gathers the values, keeping every offsets buffer.
    ///
    /// Only the innermost layer is exchanged. Each rank's value count is
    /// checked against the range that rank occupies in this structure
    /// before anything is overwritten; every rank sees the same counts, so
    /// all of them accept or reject together.
    ///
    /// Only the total is compared. A rank that regroups its values into
    /// differently sized sub-lists while keeping the same count is not
    /// detected: its values are written under the offsets recorded at
    /// assembly time. Re-assemble into a fresh structure when a local
    /// shape may have changed.
    ///
    /// # Errors
    ///
    /// - [`NdError::Uninitialized`] if the structure was never assembled
    /// - [`NdError::StructureChanged`] if a rank's value count changed
    /// - [`NdError::Communication`] if the communicator fails
    pub fn refresh_from<C: Communicator>(&mut self, comm: &C, local: &L) -> Result<()> {
        if !self.is_initialized() {
            return Err(NdError::Uninitialized);
        }

        let rank_counts = comm.all_gather(local.values().len())?;
        if rank_counts.len() != self.nodes {
            return Err(NdError::StructureChanged {
                depth: Self::DEPTH,
                position: 0,
                expected: self.nodes,
                found: rank_counts.len(),
            });
        }

        for (rank, &found) in rank_counts.iter().enumerate() {
            let expected = self.value_range(rank, rank + 1).len();
            if found != expected {
                let err = NdError::StructureChanged { depth: 1, position: rank, expected, found };
                warn!(rank = comm.rank(), error = %err, "ndflat.refresh_from.rejected");
                return Err(err);
            }
        }

        let gathered = comm.all_gather_varcount(local.values(), &rank_counts)?;
        for (slot, value) in self.values_mut().iter_mut().zip(gathered) {
            *slot = value;
        }

        debug!(rank = comm.rank(), values = self.values().len(), "ndflat.refresh_from");
        Ok(())
    }

    /// Assembles on first use, refreshes afterwards.
    ///
    /// # Errors
    ///
    /// See [`Nested::assemble_into`] and [`Nested::refresh_from`].
    pub fn assemble_or_refresh<C: Communicator>(&mut self, comm: &C, local: &L) -> Result<()> {
        if self.is_initialized() {
            self.refresh_from(comm, local)
        } else {
            self.assemble_into(comm, local)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Values;
    use crate::{Flat2, Flat3};
    use std::cell::Cell;

    #[test]
    fn test_solo_assembly_wraps_local() {
        let local: Flat2<i32> = Flat2::from_generator(&vec![vec![1, 2], vec![10, 20, 30]]).unwrap();
        let global: Flat3<i32> = Nested::assemble(&Solo, &local).unwrap();

        assert_eq!(global.len(), 1);
        assert_eq!(global.offsets(), &[0, 2]);
        assert_eq!(global.to_string(), "[[[1, 2], [10, 20, 30]]]");
    }

    #[test]
    fn test_refresh_requires_assembly() {
        let local: Flat2<i32> = Flat2::from_generator(&vec![vec![1]]).unwrap();
        let mut global: Flat3<i32> = Flat3::new();

        assert!(matches!(global.refresh_from(&Solo, &local), Err(NdError::Uninitialized)));

        global.assemble_or_refresh(&Solo, &local).unwrap();
        assert!(matches!(global.assemble_into(&Solo, &local), Err(NdError::AlreadyInitialized)));
    }

    #[test]
    fn test_refresh_keeps_assembled_grouping_when_count_matches() {
        let local: Flat2<i32> = Flat2::from_generator(&vec![vec![1, 2], vec![3]]).unwrap();
        let mut global: Flat3<i32> = Nested::assemble(&Solo, &local).unwrap();

        let regrouped: Flat2<i32> = Flat2::from_generator(&vec![vec![4], vec![5, 6]]).unwrap();
        global.refresh_from(&Solo, &regrouped).unwrap();

        assert_eq!(global.lower().offsets(), &[0, 2, 3]);
        assert_eq!(global.to_string(), "[[[4, 5], [6]]]");
    }

    /// Solo that starts failing after `healthy` successful exchanges
    struct FailsAfter {
        healthy: usize,
        calls: Cell<usize>,
    }

    impl Communicator for FailsAfter {
        fn rank(&self) -> usize {
            0
        }

        fn size(&self) -> usize {
            1
        }

        fn all_gather_varcount<T>(&self, send: &[T], counts: &[usize]) -> anyhow::Result<Vec<T>>
        where
            T: Clone + Send + 'static,
        {
            let call = self.calls.get();
            self.calls.set(call + 1);
            if call >= self.healthy {
                anyhow::bail!("link dropped on exchange {call}");
            }
            Solo.all_gather_varcount(send, counts)
        }
    }

    #[test]
    fn test_data_round_failure_keeps_transport_error() {
        let local: Flat2<i32> = Flat2::from_generator(&vec![vec![1, 2], vec![10]]).unwrap();

        // Two count exchanges succeed, the offsets exchange fails
        let comm = FailsAfter { healthy: 2, calls: Cell::new(0) };
        let mut global: Flat3<i32> = Flat3::new();
        let err = global.assemble_into(&comm, &local).unwrap_err();

        assert!(matches!(err, NdError::Communication(_)));
        assert!(err.to_string().contains("link dropped on exchange 2"));
        assert!(!global.is_initialized());

        // The values exchange fails
        let comm = FailsAfter { healthy: 3, calls: Cell::new(0) };
        let err = global.assemble_into(&comm, &local).unwrap_err();
        assert!(err.to_string().contains("link dropped on exchange 3"));
    }

    #[test]
    fn test_depth_two_assembly_from_flat_lists() {
        let local: Values<i32> = Values::from_generator(&vec![7, 8]).unwrap();
        let global: Flat2<i32> = Nested::assemble(&Solo, &local).unwrap();

        assert_eq!(global.offsets(), &[0, 2]);
        assert_eq!(global.to_string(), "[[7, 8]]");
    }

    #[test]
    fn test_refresh_rejects_changed_count() {
        let local: Flat2<i32> = Flat2::from_generator(&vec![vec![1, 2]]).unwrap();
        let mut global: Flat3<i32> = Nested::assemble(&Solo, &local).unwrap();

        let grown: Flat2<i32> = Flat2::from_generator(&vec![vec![1, 2, 3]]).unwrap();
        let err = global.refresh_from(&Solo, &grown).unwrap_err();

        assert!(matches!(
            err,
            NdError::StructureChanged { depth: 1, position: 0, expected: 2, found: 3 }
        ));
        assert_eq!(global.values(), &[1, 2]);
    }
}
