//! Sources a flattened structure can be built or refreshed from.
//!
//! A generator for a depth-K structure is a pairing of an extent with a way
//! to obtain child `i`. At depth 1 the child is an element; above it, the
//! child is a generator for depth K-1. Two forms are supported:
//!
//! - `(extent, f)` tuples, where `f(i)` returns the child. Closures are
//!   re-invoked on every walk, so they must be pure: the same index has to
//!   produce the same shape each time within one `initialize` or `refresh`.
//! - nested `Vec`s and slices, e.g. `vec![vec![1, 2], vec![10, 20, 30]]`.
//!
//! References to generators are generators too.
//!
//! The count, fill, verify and overwrite passes can only be driven through
//! [`Layer::initialize`] and [`Layer::refresh`]. Calling one directly does
//! not compile, so a built structure cannot gain nodes after the fact:
//!
//! ```compile_fail
//! use ndflat_core::{Flat2, Generator, Layer};
//!
//! let mut nd: Flat2<i32> = Flat2::from_generator(&vec![vec![1, 2]]).unwrap();
//! Generator::fill(&vec![vec![9]], &mut nd).unwrap();
//! ```
//!
//! ```
//! use ndflat_core::{Flat2, Layer};
//!
//! let lengths = [2usize, 3];
//! let source = (lengths.len(), |i: usize| (lengths[i], move |j: usize| 10 * i + j));
//!
//! let nd: Flat2<usize> = Flat2::from_generator(&source).unwrap();
//! assert_eq!(nd.to_string(), "[[0, 1], [10, 11, 12]]");
//! ```

use crate::error::{NdError, Result};
use crate::layer::private::Token;
use crate::layer::{Layer, Nested, Values};
use crate::offset::Offset;

mod private {
    pub trait Sealed {}

    impl<F> Sealed for (usize, F) {}
    impl<T> Sealed for [T] {}
    impl<T> Sealed for Vec<T> {}
    impl<G: Sealed + ?Sized> Sealed for &G {}
}

/// A source of nested data shaped for layer `L`.
///
/// Only `extent` is meant to be called directly; the other methods are the
/// passes driven by [`Layer::initialize`] and [`Layer::refresh`].
pub trait Generator<L: Layer>: private::Sealed {
    /// Number of children, i.e. the extent of the index at this depth
    fn extent(&self) -> usize;

    /// Count pass: adds every node reachable from here to its layer.
    #[doc(hidden)]
    fn count(&self, token: Token, layer: &mut L);

    /// Fill pass: appends offsets and values in pre-order.
    #[doc(hidden)]
    fn fill(&self, token: Token, layer: &mut L) -> Result<()>;

    /// Compares every sub-list length below node `start` with the recorded
    /// offsets, without writing anything.
    #[doc(hidden)]
    fn verify(&self, token: Token, layer: &L, start: usize) -> Result<()>;

    /// Rewrites the values below node `start`. Only valid after `verify`.
    #[doc(hidden)]
    fn overwrite(&self, token: Token, layer: &mut L, start: usize);
}

impl<T, F> Generator<Values<T>> for (usize, F)
where
    F: Fn(usize) -> T,
{
    fn extent(&self) -> usize {
        self.0
    }

    fn count(&self, _: Token, layer: &mut Values<T>) {
        layer.nodes += self.0;
    }

    fn fill(&self, _: Token, layer: &mut Values<T>) -> Result<()> {
        layer.values.extend((0..self.0).map(&self.1));
        Ok(())
    }

    fn verify(&self, _: Token, _layer: &Values<T>, _start: usize) -> Result<()> {
        Ok(())
    }

    fn overwrite(&self, _: Token, layer: &mut Values<T>, start: usize) {
        for (i, slot) in layer.values[start..start + self.0].iter_mut().enumerate() {
            *slot = (self.1)(i);
        }
    }
}

impl<L, I, F, G> Generator<Nested<L, I>> for (usize, F)
where
    L: Layer,
    I: Offset,
    F: Fn(usize) -> G,
    G: Generator<L>,
{
    fn extent(&self) -> usize {
        self.0
    }

    fn count(&self, token: Token, layer: &mut Nested<L, I>) {
        layer.nodes += self.0;
        for i in 0..self.0 {
            (self.1)(i).count(token, &mut layer.lower);
        }
    }

    fn fill(&self, token: Token, layer: &mut Nested<L, I>) -> Result<()> {
        for i in 0..self.0 {
            fill_child(token, layer, &(self.1)(i))?;
        }
        Ok(())
    }

    fn verify(&self, token: Token, layer: &Nested<L, I>, start: usize) -> Result<()> {
        for i in 0..self.0 {
            verify_child(token, layer, start + i, &(self.1)(i))?;
        }
        Ok(())
    }

    fn overwrite(&self, token: Token, layer: &mut Nested<L, I>, start: usize) {
        for i in 0..self.0 {
            let child = layer.child_range(start + i);
            (self.1)(i).overwrite(token, &mut layer.lower, child.start);
        }
    }
}

impl<T: Clone> Generator<Values<T>> for [T] {
    fn extent(&self) -> usize {
        self.len()
    }

    fn count(&self, _: Token, layer: &mut Values<T>) {
        layer.nodes += self.len();
    }

    fn fill(&self, _: Token, layer: &mut Values<T>) -> Result<()> {
        layer.values.extend_from_slice(self);
        Ok(())
    }

    fn verify(&self, _: Token, _layer: &Values<T>, _start: usize) -> Result<()> {
        Ok(())
    }

    fn overwrite(&self, _: Token, layer: &mut Values<T>, start: usize) {
        layer.values[start..start + self.len()].clone_from_slice(self);
    }
}

impl<L, I, G> Generator<Nested<L, I>> for [G]
where
    L: Layer,
    I: Offset,
    G: Generator<L>,
{
    fn extent(&self) -> usize {
        self.len()
    }

    fn count(&self, token: Token, layer: &mut Nested<L, I>) {
        layer.nodes += self.len();
        for child in self {
            child.count(token, &mut layer.lower);
        }
    }

    fn fill(&self, token: Token, layer: &mut Nested<L, I>) -> Result<()> {
        for child in self {
            fill_child(token, layer, child)?;
        }
        Ok(())
    }

    fn verify(&self, token: Token, layer: &Nested<L, I>, start: usize) -> Result<()> {
        for (i, child) in self.iter().enumerate() {
            verify_child(token, layer, start + i, child)?;
        }
        Ok(())
    }

    fn overwrite(&self, token: Token, layer: &mut Nested<L, I>, start: usize) {
        for (i, child) in self.iter().enumerate() {
            let range = layer.child_range(start + i);
            child.overwrite(token, &mut layer.lower, range.start);
        }
    }
}

impl<L: Layer, G> Generator<L> for Vec<G>
where
    [G]: Generator<L>,
{
    fn extent(&self) -> usize {
        self.as_slice().extent()
    }

    fn count(&self, token: Token, layer: &mut L) {
        self.as_slice().count(token, layer);
    }

    fn fill(&self, token: Token, layer: &mut L) -> Result<()> {
        self.as_slice().fill(token, layer)
    }

    fn verify(&self, token: Token, layer: &L, start: usize) -> Result<()> {
        self.as_slice().verify(token, layer, start)
    }

    fn overwrite(&self, token: Token, layer: &mut L, start: usize) {
        self.as_slice().overwrite(token, layer, start);
    }
}

impl<L: Layer, G: Generator<L> + ?Sized> Generator<L> for &G {
    fn extent(&self) -> usize {
        (**self).extent()
    }

    fn count(&self, token: Token, layer: &mut L) {
        (**self).count(token, layer);
    }

    fn fill(&self, token: Token, layer: &mut L) -> Result<()> {
        (**self).fill(token, layer)
    }

    fn verify(&self, token: Token, layer: &L, start: usize) -> Result<()> {
        (**self).verify(token, layer, start)
    }

    fn overwrite(&self, token: Token, layer: &mut L, start: usize) {
        (**self).overwrite(token, layer, start);
    }
}

/// Fills one child, then records where its sub-list ends.
fn fill_child<L, I, G>(token: Token, layer: &mut Nested<L, I>, child: &G) -> Result<()>
where
    L: Layer,
    I: Offset,
    G: Generator<L> + ?Sized,
{
    child.fill(token, &mut layer.lower)?;
    let end = layer.last_offset() + child.extent();
    layer.push_offset(end)
}

/// Checks the length of sub-list `position` before descending into it.
fn verify_child<L, I, G>(token: Token, layer: &Nested<L, I>, position: usize, child: &G) -> Result<()>
where
    L: Layer,
    I: Offset,
    G: Generator<L> + ?Sized,
{
    let range = layer.child_range(position);
    let expected = range.end - range.start;
    let found = child.extent();
    if found != expected {
        return Err(NdError::StructureChanged {
            depth: Nested::<L, I>::DEPTH,
            position,
            expected,
            found,
        });
    }
    child.verify(token, &layer.lower, range.start)
}
