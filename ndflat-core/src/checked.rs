//! Bounds-checked chained lookup.
//!
//! Works like [`Cursor`](crate::Cursor), but every handle also knows the
//! exclusive upper bound of the next index. Narrowing validates the index
//! against that bound before touching any buffer, and the bound is exposed
//! through `len()` so callers can iterate without guessing.
//!
//! ```
//! use ndflat_core::{Flat2, Layer, NdError};
//!
//! let nd: Flat2<i32> = Flat2::from_generator(&vec![vec![1, 2], vec![10, 20, 30]]).unwrap();
//!
//! let row = nd.checked().at(1).unwrap();
//! assert_eq!(row.len(), 3);
//! assert_eq!(*row.at(2).unwrap(), 30);
//! assert!(matches!(row.at(3), Err(NdError::OutOfRange { index: 3, extent: 3, .. })));
//! ```

use crate::error::{NdError, Result};
use crate::layer::{Layer, Nested, Values};
use crate::offset::Offset;
use std::fmt;

/// Read-only, bounds-checked lookup handle positioned inside layer `L`.
pub struct Checked<'a, L> {
    layer: &'a L,
    offset: usize,
    extent: usize,
}

impl<'a, L: Layer> Checked<'a, L> {
    pub(crate) fn new(layer: &'a L, offset: usize, extent: usize) -> Self {
        Self { layer, offset, extent }
    }

    /// Exclusive upper bound for the next index
    pub fn len(&self) -> usize {
        self.extent
    }

    /// Returns `true` if no index is valid here
    pub fn is_empty(&self) -> bool {
        self.extent == 0
    }

    fn check(&self, index: usize) -> Result<usize> {
        if index >= self.extent {
            return Err(NdError::OutOfRange { depth: L::DEPTH, index, extent: self.extent });
        }
        Ok(self.offset + index)
    }
}

impl<L> Clone for Checked<'_, L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L> Copy for Checked<'_, L> {}

impl<L: Layer> fmt::Debug for Checked<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checked")
            .field("depth", &L::DEPTH)
            .field("offset", &self.offset)
            .field("extent", &self.extent)
            .finish()
    }
}

impl<'a, L: Layer, I: Offset> Checked<'a, Nested<L, I>> {
    /// Narrows one index, moving to the layer below.
    ///
    /// # Errors
    ///
    /// Returns [`NdError::OutOfRange`] if `index >= self.len()`.
    pub fn at(self, index: usize) -> Result<Checked<'a, L>> {
        let position = self.check(index)?;
        let layer = self.layer;
        let child = layer.child_range(position);
        Ok(Checked::new(&layer.lower, child.start, child.end - child.start))
    }
}

impl<'a, T> Checked<'a, Values<T>> {
    /// Supplies the last index.
    ///
    /// # Errors
    ///
    /// Returns [`NdError::OutOfRange`] if `index >= self.len()`.
    pub fn at(self, index: usize) -> Result<&'a T> {
        let position = self.check(index)?;
        Ok(&self.layer.values[position])
    }

    /// The contiguous run of elements this handle covers
    pub fn as_slice(&self) -> &'a [T] {
        &self.layer.values[self.offset..self.offset + self.extent]
    }

    /// Iterates the elements this handle covers
    pub fn iter(&self) -> std::slice::Iter<'a, T> {
        self.as_slice().iter()
    }
}

/// Mutable, bounds-checked lookup handle positioned inside layer `L`.
pub struct CheckedMut<'a, L> {
    layer: &'a mut L,
    offset: usize,
    extent: usize,
}

impl<'a, L: Layer> CheckedMut<'a, L> {
    pub(crate) fn new(layer: &'a mut L, offset: usize, extent: usize) -> Self {
        Self { layer, offset, extent }
    }

    /// Exclusive upper bound for the next index
    pub fn len(&self) -> usize {
        self.extent
    }

    /// Returns `true` if no index is valid here
    pub fn is_empty(&self) -> bool {
        self.extent == 0
    }

    /// Shorter-lived copy of this handle
    pub fn reborrow(&mut self) -> CheckedMut<'_, L> {
        CheckedMut::new(&mut *self.layer, self.offset, self.extent)
    }

    /// Read-only view of the same position
    pub fn as_checked(&self) -> Checked<'_, L> {
        Checked::new(&*self.layer, self.offset, self.extent)
    }

    fn check(&self, index: usize) -> Result<usize> {
        if index >= self.extent {
            return Err(NdError::OutOfRange { depth: L::DEPTH, index, extent: self.extent });
        }
        Ok(self.offset + index)
    }
}

impl<L: Layer> fmt::Debug for CheckedMut<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckedMut")
            .field("depth", &L::DEPTH)
            .field("offset", &self.offset)
            .field("extent", &self.extent)
            .finish()
    }
}

impl<'a, L: Layer, I: Offset> CheckedMut<'a, Nested<L, I>> {
    /// Narrows one index, moving to the layer below.
    ///
    /// # Errors
    ///
    /// Returns [`NdError::OutOfRange`] if `index >= self.len()`.
    pub fn at(self, index: usize) -> Result<CheckedMut<'a, L>> {
        let position = self.check(index)?;
        let layer = self.layer;
        let child = layer.child_range(position);
        Ok(CheckedMut::new(&mut layer.lower, child.start, child.end - child.start))
    }
}

impl<'a, T> CheckedMut<'a, Values<T>> {
    /// Supplies the last index.
    ///
    /// # Errors
    ///
    /// Returns [`NdError::OutOfRange`] if `index >= self.len()`.
    pub fn at(self, index: usize) -> Result<&'a mut T> {
        let position = self.check(index)?;
        Ok(&mut self.layer.values[position])
    }

    /// The contiguous run of elements this handle covers
    pub fn as_mut_slice(self) -> &'a mut [T] {
        let (offset, extent) = (self.offset, self.extent);
        &mut self.layer.values[offset..offset + extent]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Flat3;

    fn sample() -> Flat3<i32> {
        Flat3::from_generator(&vec![vec![vec![1, 2]], vec![vec![10, 20, 30], vec![], vec![40]]])
            .unwrap()
    }

    #[test]
    fn test_extents_follow_the_path() {
        let nd = sample();
        let top = nd.checked();
        assert_eq!(top.len(), 2);

        let rank1 = top.at(1).unwrap();
        assert_eq!(rank1.len(), 3);
        assert_eq!(rank1.at(0).unwrap().len(), 3);
        assert!(rank1.at(1).unwrap().is_empty());
        assert_eq!(rank1.at(2).unwrap().as_slice(), &[40]);
    }

    #[test]
    fn test_rejects_index_at_extent() {
        let nd = sample();

        let err = nd.checked().at(2).unwrap_err();
        assert!(matches!(err, NdError::OutOfRange { depth: 3, index: 2, extent: 2 }));

        let err = nd.checked().at(1).unwrap().at(1).unwrap().at(0).unwrap_err();
        assert!(matches!(err, NdError::OutOfRange { depth: 1, index: 0, extent: 0 }));
    }

    #[test]
    fn test_checked_mut_writes_in_place() {
        let mut nd = sample();
        {
            let mut rank1 = nd.checked_mut().at(1).unwrap();
            *rank1.reborrow().at(0).unwrap().at(2).unwrap() = 33;
            rank1.reborrow().at(2).unwrap().as_mut_slice()[0] = 44;
            assert!(rank1.reborrow().at(3).is_err());
            assert_eq!(rank1.as_checked().at(0).unwrap().iter().sum::<i32>(), 63);
        }

        assert_eq!(nd.to_string(), "[[[1, 2]], [[10, 20, 33], [], [44]]]");
    }

    #[test]
    fn test_values_layer_checked() {
        let mut values: Values<u8> = Layer::from_generator(&vec![1u8, 2, 3]).unwrap();
        assert_eq!(values.checked().len(), 3);
        assert_eq!(*values.checked().at(2).unwrap(), 3);
        assert!(values.checked().at(3).is_err());

        *values.checked_mut().at(0).unwrap() = 9;
        assert_eq!(values.values(), &[9, 2, 3]);
    }
}
