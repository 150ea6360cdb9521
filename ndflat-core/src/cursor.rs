//! Unchecked chained lookup.
//!
//! A cursor is a borrow of one layer plus a resolved offset into that
//! layer. Each call to `at` reads one offset and moves the cursor one layer
//! down; at depth 1 it yields the element itself. Nothing is allocated and
//! no intermediate containers are built.
//!
//! Indices are trusted. An index past the end of its sub-list silently
//! lands in a neighbouring sub-list, or panics if it leaves the buffer
//! altogether. Use [`Checked`](crate::Checked) when indices come from
//! outside.
//!
//! Mutability follows the receiver: a lookup chain that starts from
//! `&Nested` can only ever produce `&T`.
//!
//! ```compile_fail
//! use ndflat_core::{Flat2, Layer};
//!
//! let nd: Flat2<i32> = Flat2::from_generator(&vec![vec![1, 2]]).unwrap();
//! let shared = &nd;
//! *shared.at(0).at(1) = 5;
//! ```
//!
//! Cursors borrow the structure, so it cannot be refreshed while one is
//! alive:
//!
//! ```compile_fail
//! use ndflat_core::{Flat2, Layer};
//!
//! let mut nd: Flat2<i32> = Flat2::from_generator(&vec![vec![1, 2]]).unwrap();
//! let row = nd.at(0);
//! nd.refresh(&vec![vec![3, 4]]).unwrap();
//! println!("{}", row.at(0));
//! ```

use crate::layer::{Layer, Nested, Values};
use crate::offset::Offset;
use std::fmt;

/// Read-only lookup handle positioned inside layer `L`.
pub struct Cursor<'a, L> {
    layer: &'a L,
    offset: usize,
}

impl<'a, L> Cursor<'a, L> {
    pub(crate) fn new(layer: &'a L, offset: usize) -> Self {
        Self { layer, offset }
    }

    /// Position of this cursor's sub-list in its layer
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<L> Clone for Cursor<'_, L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L> Copy for Cursor<'_, L> {}

impl<L: Layer> fmt::Debug for Cursor<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("depth", &L::DEPTH)
            .field("offset", &self.offset)
            .finish()
    }
}

impl<'a, L: Layer, I: Offset> Cursor<'a, Nested<L, I>> {
    /// Narrows one index, moving to the layer below.
    #[inline]
    pub fn at(self, index: usize) -> Cursor<'a, L> {
        let layer = self.layer;
        Cursor::new(&layer.lower, layer.offsets[self.offset + index].to_usize())
    }
}

impl<'a, T, I: Offset> Cursor<'a, Nested<Values<T>, I>> {
    /// The contiguous run of elements sharing every index but the last.
    #[inline]
    pub fn slice(self, index: usize) -> &'a [T] {
        let layer = self.layer;
        let range = layer.child_range(self.offset + index);
        &layer.lower.values[range]
    }
}

impl<'a, T> Cursor<'a, Values<T>> {
    /// Supplies the last index.
    #[inline]
    pub fn at(self, index: usize) -> &'a T {
        &self.layer.values[self.offset + index]
    }
}

/// Mutable lookup handle positioned inside layer `L`.
///
/// Narrowing consumes the cursor; call [`CursorMut::reborrow`] to keep a
/// prefix around for further lookups.
pub struct CursorMut<'a, L> {
    layer: &'a mut L,
    offset: usize,
}

impl<'a, L> CursorMut<'a, L> {
    pub(crate) fn new(layer: &'a mut L, offset: usize) -> Self {
        Self { layer, offset }
    }

    /// Position of this cursor's sub-list in its layer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Shorter-lived copy of this cursor, leaving the original usable once
    /// the copy is dropped.
    pub fn reborrow(&mut self) -> CursorMut<'_, L> {
        CursorMut::new(&mut *self.layer, self.offset)
    }

    /// Read-only view of the same position
    pub fn as_cursor(&self) -> Cursor<'_, L> {
        Cursor::new(&*self.layer, self.offset)
    }
}

impl<L: Layer> fmt::Debug for CursorMut<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorMut")
            .field("depth", &L::DEPTH)
            .field("offset", &self.offset)
            .finish()
    }
}

impl<'a, L: Layer, I: Offset> CursorMut<'a, Nested<L, I>> {
    /// Narrows one index, moving to the layer below.
    #[inline]
    pub fn at(self, index: usize) -> CursorMut<'a, L> {
        let layer = self.layer;
        let offset = layer.offsets[self.offset + index].to_usize();
        CursorMut::new(&mut layer.lower, offset)
    }
}

impl<'a, T, I: Offset> CursorMut<'a, Nested<Values<T>, I>> {
    /// Mutable run of elements sharing every index but the last.
    #[inline]
    pub fn slice(self, index: usize) -> &'a mut [T] {
        let layer = self.layer;
        let range = layer.child_range(self.offset + index);
        &mut layer.lower.values[range]
    }
}

impl<'a, T> CursorMut<'a, Values<T>> {
    /// Supplies the last index.
    #[inline]
    pub fn at(self, index: usize) -> &'a mut T {
        &mut self.layer.values[self.offset + index]
    }
}
