//! Flat storage for K-deep nested arrays.
//!
//! # Layout
//!
//! A depth-K structure is a chain of K layers. The innermost layer,
//! [`Values`], stores every element in lexicographic order of its index
//! tuple. Each outer layer, [`Nested`], stores one offsets buffer whose
//! entries delimit the sub-lists of the layer directly below it:
//!
//! ```text
//! [[1, 2], [], [10, 20, 30]]
//!
//! depth 2  offsets: [0, 2, 2, 5]
//! depth 1  values:  [1, 2, 10, 20, 30]
//! ```
//!
//! Empty sub-lists show up as repeated offsets. This is compressed sparse
//! row storage generalized to any number of dimensions.
//!
//! # Invariants
//!
//! For every initialized [`Nested`] layer:
//! - `offsets[0] == 0`
//! - `offsets` is non-decreasing
//! - `offsets[len] == lower.len()`
//!
//! The topology is fixed once a structure is initialized; `refresh` only
//! rewrites the values buffer. The passes that build the buffers are not
//! reachable from outside this crate:
//!
//! ```compile_fail
//! use ndflat_core::{Flat2, Layer};
//!
//! let mut nd: Flat2<i32> = Flat2::from_generator(&vec![vec![1, 2]]).unwrap();
//! Layer::allocate(&mut nd);
//! ```

use crate::collective::Communicator;
use crate::cursor::{Cursor, CursorMut};
use crate::checked::{Checked, CheckedMut};
use crate::error::{NdError, Result};
use crate::generator::Generator;
use crate::offset::Offset;
use std::fmt;
use std::ops::{Index, IndexMut, Range};
use tracing::{debug, warn};

pub(crate) mod private {
    pub trait Sealed {}

    /// Capability required by the internal passes. It cannot be built
    /// outside this crate, so those passes cannot be called from outside.
    #[derive(Debug, Clone, Copy)]
    pub struct Token(());

    pub(crate) const TOKEN: Token = Token(());
}

use private::{TOKEN, Token};

/// One layer of a flattened structure, together with everything below it.
///
/// Implemented by [`Values`] (depth 1) and [`Nested`] (depth > 1). The trait
/// carries the operations that recurse through the layer chain; lookups live
/// on the concrete types because their result type changes with depth.
pub trait Layer: Default + private::Sealed {
    /// Element type stored in the values buffer
    type Data;

    /// Number of indices needed to reach a single element
    const DEPTH: usize;

    /// Number of nodes in this layer.
    ///
    /// For the outermost layer this is the extent of the first index.
    fn len(&self) -> usize;

    /// Returns `true` if this layer has no nodes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the buffers have been built
    fn is_initialized(&self) -> bool;

    /// All elements, in lexicographic order of their index tuples
    fn values(&self) -> &[Self::Data];

    /// All elements, mutably. The topology cannot be changed through this.
    fn values_mut(&mut self) -> &mut [Self::Data];

    /// Maps the node range `from..to` of this layer to the range of the
    /// values buffer it covers.
    fn value_range(&self, from: usize, to: usize) -> Range<usize>;

    /// Node counts per layer, outermost first
    fn shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(Self::DEPTH);
        self.collect_shape(TOKEN, &mut shape);
        shape
    }

    /// Position in the values buffer of the element at `index`, starting
    /// from node `start` of this layer. No range checks beyond slice
    /// indexing.
    #[doc(hidden)]
    fn locate(&self, token: Token, start: usize, index: &[usize]) -> usize;

    /// As `locate`, but every index is checked against the sub-list
    /// `start..end` it applies to.
    #[doc(hidden)]
    fn locate_checked(&self, token: Token, start: usize, end: usize, index: &[usize]) -> Option<usize>;

    #[doc(hidden)]
    fn collect_shape(&self, token: Token, shape: &mut Vec<usize>);

    /// Reserves every buffer once the counts are known.
    #[doc(hidden)]
    fn allocate(&mut self, token: Token);

    /// Writes nodes `from..to` in bracketed list form.
    #[doc(hidden)]
    fn render(&self, token: Token, f: &mut fmt::Formatter<'_>, from: usize, to: usize) -> fmt::Result
    where
        Self::Data: fmt::Display;

    /// Count round of collective assembly: gathers `local.len()` from every
    /// rank into `counts`, one entry per layer from this one down.
    #[doc(hidden)]
    fn gather_counts<C: Communicator>(
        &mut self,
        token: Token,
        comm: &C,
        local: &Self,
        counts: &mut Vec<Vec<usize>>,
    ) -> Result<()>;

    /// Data round of collective assembly. `counts` holds one entry per
    /// layer from this one down, exactly as recorded by `gather_counts`.
    #[doc(hidden)]
    fn gather_buffers<C: Communicator>(
        &mut self,
        token: Token,
        comm: &C,
        local: &Self,
        counts: &[Vec<usize>],
    ) -> Result<()>
    where
        Self::Data: Clone + Send + 'static;

    /// Builds a new structure from a generator.
    ///
    /// # Errors
    ///
    /// Returns [`NdError::IndexOverflow`] if an offset does not fit the
    /// index type.
    fn from_generator<G>(generator: &G) -> Result<Self>
    where
        G: Generator<Self> + ?Sized,
    {
        let mut layer = Self::default();
        layer.initialize(generator)?;
        Ok(layer)
    }

    /// Builds the buffers from a generator: a count pass, an allocation,
    /// then a fill pass.
    ///
    /// The generator is walked twice and must report the same shape both
    /// times. On failure the structure is reset to empty.
    ///
    /// # Errors
    ///
    /// - [`NdError::AlreadyInitialized`] if the buffers already exist
    /// - [`NdError::IndexOverflow`] if an offset does not fit the index type
    fn initialize<G>(&mut self, generator: &G) -> Result<()>
    where
        G: Generator<Self> + ?Sized,
    {
        if self.is_initialized() {
            return Err(NdError::AlreadyInitialized);
        }

        generator.count(TOKEN, self);
        self.allocate(TOKEN);

        if let Err(err) = generator.fill(TOKEN, self) {
            *self = Self::default();
            return Err(err);
        }

        debug!(depth = Self::DEPTH, shape = ?self.shape(), "ndflat.initialize");
        Ok(())
    }

    /// Overwrites the values from a generator with the same shape.
    ///
    /// The whole generator is checked against the existing offsets before
    /// any value is written, so a rejected refresh leaves the structure
    /// untouched.
    ///
    /// # Errors
    ///
    /// - [`NdError::Uninitialized`] if `initialize` has not run
    /// - [`NdError::StructureChanged`] if any sub-list length differs
    fn refresh<G>(&mut self, generator: &G) -> Result<()>
    where
        G: Generator<Self> + ?Sized,
    {
        if !self.is_initialized() {
            return Err(NdError::Uninitialized);
        }

        let verified = if generator.extent() == self.len() {
            generator.verify(TOKEN, self, 0)
        } else {
            Err(NdError::StructureChanged {
                depth: Self::DEPTH + 1,
                position: 0,
                expected: self.len(),
                found: generator.extent(),
            })
        };

        if let Err(err) = verified {
            warn!(depth = Self::DEPTH, error = %err, "ndflat.refresh.rejected");
            return Err(err);
        }

        generator.overwrite(TOKEN, self, 0);
        debug!(depth = Self::DEPTH, values = self.values().len(), "ndflat.refresh");
        Ok(())
    }

    /// Initializes on first use, refreshes afterwards.
    ///
    /// # Errors
    ///
    /// See [`Layer::initialize`] and [`Layer::refresh`].
    fn initialize_or_refresh<G>(&mut self, generator: &G) -> Result<()>
    where
        G: Generator<Self> + ?Sized,
    {
        if self.is_initialized() {
            self.refresh(generator)
        } else {
            self.initialize(generator)
        }
    }

    /// Element at the full index tuple, or `None` if any index is out of
    /// range or the tuple length differs from [`Layer::DEPTH`].
    fn get(&self, index: &[usize]) -> Option<&Self::Data> {
        let position = self.locate_checked(TOKEN, 0, self.len(), index)?;
        self.values().get(position)
    }

    /// Mutable counterpart of [`Layer::get`]
    fn get_mut(&mut self, index: &[usize]) -> Option<&mut Self::Data> {
        let position = self.locate_checked(TOKEN, 0, self.len(), index)?;
        self.values_mut().get_mut(position)
    }
}

/// The innermost layer: a flat buffer of elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Values<T> {
    /// Nodes counted so far, equal to `values.len()` once built
    pub(crate) nodes: usize,
    pub(crate) values: Vec<T>,
    pub(crate) initialized: bool,
}

impl<T> Default for Values<T> {
    fn default() -> Self {
        Self { nodes: 0, values: Vec::new(), initialized: false }
    }
}

impl<T> Values<T> {
    /// Creates an empty, uninitialized layer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Element `index`. Unlike a cursor this goes straight to the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn at(&self, index: usize) -> &T {
        &self.values[index]
    }

    /// Mutable element `index`
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn at_mut(&mut self, index: usize) -> &mut T {
        &mut self.values[index]
    }

    /// Bounds-checked lookup handle
    pub fn checked(&self) -> Checked<'_, Self> {
        Checked::new(self, 0, self.nodes)
    }

    /// Bounds-checked mutable lookup handle
    pub fn checked_mut(&mut self) -> CheckedMut<'_, Self> {
        let extent = self.nodes;
        CheckedMut::new(self, 0, extent)
    }
}

impl<T> private::Sealed for Values<T> {}

impl<T> Layer for Values<T> {
    type Data = T;
    const DEPTH: usize = 1;

    fn len(&self) -> usize {
        self.nodes
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn values(&self) -> &[T] {
        &self.values
    }

    fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    fn value_range(&self, from: usize, to: usize) -> Range<usize> {
        from..to
    }

    fn locate(&self, _: Token, start: usize, index: &[usize]) -> usize {
        assert_eq!(index.len(), 1, "index tuple longer than the structure depth");
        start + index[0]
    }

    fn locate_checked(&self, _: Token, start: usize, end: usize, index: &[usize]) -> Option<usize> {
        match index {
            [i] if *i < end - start => Some(start + i),
            _ => None,
        }
    }

    fn collect_shape(&self, _: Token, shape: &mut Vec<usize>) {
        shape.push(self.nodes);
    }

    fn allocate(&mut self, _: Token) {
        self.values = Vec::with_capacity(self.nodes);
        self.initialized = true;
    }

    fn render(&self, _: Token, f: &mut fmt::Formatter<'_>, from: usize, to: usize) -> fmt::Result
    where
        T: fmt::Display,
    {
        f.write_str("[")?;
        for (i, value) in self.values[from..to].iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str("]")
    }

    fn gather_counts<C: Communicator>(
        &mut self,
        _: Token,
        comm: &C,
        local: &Self,
        counts: &mut Vec<Vec<usize>>,
    ) -> Result<()> {
        let rank_counts = comm.all_gather(local.len())?;
        self.nodes = rank_counts.iter().sum();
        counts.push(rank_counts);
        Ok(())
    }

    fn gather_buffers<C: Communicator>(
        &mut self,
        _: Token,
        comm: &C,
        local: &Self,
        counts: &[Vec<usize>],
    ) -> Result<()>
    where
        T: Clone + Send + 'static,
    {
        let [rank_counts] = counts else {
            unreachable!("count round recorded {} layers below depth 1", counts.len());
        };
        let gathered = comm.all_gather_varcount(&local.values, rank_counts)?;
        debug!(depth = 1, rank = comm.rank(), received = gathered.len(), "ndflat.assemble.layer");
        self.values.extend(gathered);
        Ok(())
    }
}

impl<T: fmt::Display> fmt::Display for Values<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(TOKEN, f, 0, self.values.len())
    }
}

impl<T> Index<usize> for Values<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.values[index]
    }
}

impl<T> IndexMut<usize> for Values<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.values[index]
    }
}

/// An offsets layer on top of a lower layer `L`.
///
/// `Nested<Values<T>>` is a list of lists, `Nested<Nested<Values<T>>>` a
/// list of lists of lists, and so on. `I` is the integer type stored in the
/// offsets buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Nested<L, I = usize> {
    /// Nodes counted so far, equal to `offsets.len() - 1` once built
    pub(crate) nodes: usize,
    /// Start of every sub-list in `lower`, plus the end of the last one
    pub(crate) offsets: Vec<I>,
    pub(crate) lower: L,
}

impl<L: Default, I> Default for Nested<L, I> {
    fn default() -> Self {
        Self { nodes: 0, offsets: Vec::new(), lower: L::default() }
    }
}

impl<L: Layer, I: Offset> Nested<L, I> {
    /// Creates an empty, uninitialized structure
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The offsets buffer of this layer (`len() + 1` entries once built)
    pub fn offsets(&self) -> &[I] {
        &self.offsets
    }

    /// The layer directly below
    pub fn lower(&self) -> &L {
        &self.lower
    }

    /// Length of sub-list `index`, i.e. the extent of the next index
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn extent(&self, index: usize) -> usize {
        let range = self.child_range(index);
        range.end - range.start
    }

    /// Narrows the first index. No range validation beyond slice indexing.
    pub fn at(&self, index: usize) -> Cursor<'_, L> {
        self.cursor().at(index)
    }

    /// Mutable counterpart of [`Nested::at`]
    pub fn at_mut(&mut self, index: usize) -> CursorMut<'_, L> {
        self.cursor_mut().at(index)
    }

    /// Cursor positioned before the first index
    pub fn cursor(&self) -> Cursor<'_, Self> {
        Cursor::new(self, 0)
    }

    /// Mutable cursor positioned before the first index
    pub fn cursor_mut(&mut self) -> CursorMut<'_, Self> {
        CursorMut::new(self, 0)
    }

    /// Bounds-checked lookup handle. Each step validates its index and
    /// reports the extent of the next one.
    pub fn checked(&self) -> Checked<'_, Self> {
        Checked::new(self, 0, self.nodes)
    }

    /// Bounds-checked mutable lookup handle
    pub fn checked_mut(&mut self) -> CheckedMut<'_, Self> {
        let extent = self.nodes;
        CheckedMut::new(self, 0, extent)
    }

    /// Node range of sub-list `position` in the lower layer
    #[inline]
    pub(crate) fn child_range(&self, position: usize) -> Range<usize> {
        self.offsets[position].to_usize()..self.offsets[position + 1].to_usize()
    }

    /// Appends an offset, narrowing it to the index type
    pub(crate) fn push_offset(&mut self, value: usize) -> Result<()> {
        let offset = I::from_usize(value).ok_or(NdError::IndexOverflow { value })?;
        self.offsets.push(offset);
        Ok(())
    }

    /// Last offset written so far
    pub(crate) fn last_offset(&self) -> usize {
        self.offsets.last().map_or(0, |offset| offset.to_usize())
    }
}

impl<L, I> private::Sealed for Nested<L, I> {}

impl<L: Layer, I: Offset> Layer for Nested<L, I> {
    type Data = L::Data;
    const DEPTH: usize = L::DEPTH + 1;

    fn len(&self) -> usize {
        self.nodes
    }

    fn is_initialized(&self) -> bool {
        !self.offsets.is_empty()
    }

    fn values(&self) -> &[L::Data] {
        self.lower.values()
    }

    fn values_mut(&mut self) -> &mut [L::Data] {
        self.lower.values_mut()
    }

    fn value_range(&self, from: usize, to: usize) -> Range<usize> {
        self.lower.value_range(self.offsets[from].to_usize(), self.offsets[to].to_usize())
    }

    fn locate(&self, token: Token, start: usize, index: &[usize]) -> usize {
        let (first, rest) = index.split_first().expect("index tuple shorter than the structure depth");
        self.lower.locate(token, self.offsets[start + first].to_usize(), rest)
    }

    fn locate_checked(&self, token: Token, start: usize, end: usize, index: &[usize]) -> Option<usize> {
        let (&first, rest) = index.split_first()?;
        if first >= end - start {
            return None;
        }
        let child = self.child_range(start + first);
        self.lower.locate_checked(token, child.start, child.end, rest)
    }

    fn collect_shape(&self, token: Token, shape: &mut Vec<usize>) {
        shape.push(self.nodes);
        self.lower.collect_shape(token, shape);
    }

    fn allocate(&mut self, token: Token) {
        self.offsets = Vec::with_capacity(self.nodes + 1);
        self.offsets.push(I::ZERO);
        self.lower.allocate(token);
    }

    fn render(&self, token: Token, f: &mut fmt::Formatter<'_>, from: usize, to: usize) -> fmt::Result
    where
        L::Data: fmt::Display,
    {
        f.write_str("[")?;
        for position in from..to {
            if position > from {
                f.write_str(", ")?;
            }
            let child = self.child_range(position);
            self.lower.render(token, f, child.start, child.end)?;
        }
        f.write_str("]")
    }

    fn gather_counts<C: Communicator>(
        &mut self,
        token: Token,
        comm: &C,
        local: &Self,
        counts: &mut Vec<Vec<usize>>,
    ) -> Result<()> {
        let rank_counts = comm.all_gather(local.len())?;
        self.nodes = rank_counts.iter().sum();
        counts.push(rank_counts);
        self.lower.gather_counts(token, comm, &local.lower, counts)
    }

    fn gather_buffers<C: Communicator>(
        &mut self,
        token: Token,
        comm: &C,
        local: &Self,
        counts: &[Vec<usize>],
    ) -> Result<()>
    where
        L::Data: Clone + Send + 'static,
    {
        let [mine, below @ ..] = counts else {
            unreachable!("count round recorded no entry for depth {}", Self::DEPTH);
        };

        // The leading zero is implied on every rank
        let send = local.offsets.get(1..).unwrap_or_default();
        let gathered = comm.all_gather_varcount(send, mine)?;

        // Offsets arrive relative to each rank's own lower buffer. A rank's
        // last offset is its lower length, which shifts every later rank.
        let mut received = gathered.into_iter();
        let mut shift = 0;
        for &count in mine {
            let mut rank_end = 0;
            for offset in received.by_ref().take(count) {
                rank_end = offset.to_usize();
                self.push_offset(rank_end + shift)?;
            }
            shift += rank_end;
        }

        debug!(
            depth = Self::DEPTH,
            rank = comm.rank(),
            nodes = self.nodes,
            lower = shift,
            "ndflat.assemble.layer"
        );

        self.lower.gather_buffers(token, comm, &local.lower, below)
    }
}

impl<L: Layer, I: Offset> fmt::Display for Nested<L, I>
where
    L::Data: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_initialized() {
            return f.write_str("[]");
        }
        self.render(TOKEN, f, 0, self.nodes)
    }
}

impl<L: Layer, I: Offset, const N: usize> Index<[usize; N]> for Nested<L, I> {
    type Output = L::Data;

    /// Element at a full index tuple, without range validation.
    ///
    /// # Panics
    ///
    /// Panics if `N` differs from the depth, or on a slice index that falls
    /// outside the buffers.
    fn index(&self, index: [usize; N]) -> &L::Data {
        assert_eq!(N, Self::DEPTH, "index tuple length must equal the structure depth");
        let position = self.locate(TOKEN, 0, &index);
        &self.values()[position]
    }
}

impl<L: Layer, I: Offset, const N: usize> IndexMut<[usize; N]> for Nested<L, I> {
    fn index_mut(&mut self, index: [usize; N]) -> &mut L::Data {
        assert_eq!(N, Self::DEPTH, "index tuple length must equal the structure depth");
        let position = self.locate(TOKEN, 0, &index);
        &mut self.values_mut()[position]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Flat2, Flat3};

    fn sample() -> Flat2<i32> {
        Flat2::from_generator(&vec![vec![1, 2], vec![10, 20, 30]]).unwrap()
    }

    #[test]
    fn test_buffers_follow_lexicographic_order() {
        let nd = sample();

        assert_eq!(nd.len(), 2);
        assert_eq!(nd.offsets(), &[0, 2, 5]);
        assert_eq!(nd.values(), &[1, 2, 10, 20, 30]);
        assert_eq!(nd.shape(), vec![2, 5]);
    }

    #[test]
    fn test_empty_sublists_repeat_offsets() {
        let nd: Flat2<i32> = Flat2::from_generator(&vec![vec![], vec![7], vec![], vec![]]).unwrap();

        assert_eq!(nd.offsets(), &[0, 0, 1, 1, 1]);
        assert_eq!(nd.extent(0), 0);
        assert_eq!(nd.extent(1), 1);
        assert_eq!(nd.to_string(), "[[], [7], [], []]");
    }

    #[test]
    fn test_index_by_tuple() {
        let mut nd = sample();
        assert_eq!(nd[[1, 2]], 30);

        nd[[0, 1]] += 5;
        assert_eq!(nd[[0, 1]], 7);
    }

    #[test]
    #[should_panic(expected = "structure depth")]
    fn test_index_tuple_wrong_length_panics() {
        let nd = sample();
        let _value = nd[[0, 0, 0]];
    }

    #[test]
    fn test_get_checks_every_index() {
        let nd = sample();
        assert_eq!(nd.get(&[1, 0]), Some(&10));
        assert_eq!(nd.get(&[0, 2]), None);
        assert_eq!(nd.get(&[2, 0]), None);
        assert_eq!(nd.get(&[1]), None);
        assert_eq!(nd.get(&[1, 0, 0]), None);
    }

    #[test]
    fn test_value_range_spans_subtree() {
        let nd: Flat3<i32> =
            Flat3::from_generator(&vec![vec![vec![1, 2]], vec![vec![10, 20, 30], vec![40]]]).unwrap();

        assert_eq!(nd.value_range(0, 1), 0..2);
        assert_eq!(nd.value_range(1, 2), 2..6);
        assert_eq!(nd.value_range(0, 2), 0..6);
    }

    #[test]
    fn test_uninitialized_renders_empty() {
        let nd: Flat2<i32> = Flat2::new();
        assert!(!nd.is_initialized());
        assert_eq!(nd.to_string(), "[]");
    }

    #[test]
    fn test_values_layer_uses_requested_index() {
        let values: Values<i32> = Values::from_generator(&vec![4, 5, 6]).unwrap();
        assert_eq!(*values.at(2), 6);
        assert_eq!(values[1], 5);
        assert_eq!(values.to_string(), "[4, 5, 6]");
    }
}
