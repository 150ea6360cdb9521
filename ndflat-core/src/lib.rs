//! ndflat - Flat storage for irregular nested arrays
//!
//! ndflat serializes an "array of arrays of ... of values" with a
//! compile-time depth K into K flat buffers: one values buffer plus one
//! offsets buffer per outer dimension. The result is cheap to build, looked
//! up with chained indexing in O(1) per index, and small enough to exchange
//! between processes as a handful of contiguous messages.
//!
//! # Features
//!
//! - Two-pass construction (count, then fill) from closures or nested `Vec`s
//! - Chained lookup `nd.at(i).at(j).at(k)` without intermediate containers
//! - Bounds-checked lookup that reports the extent of every next index
//! - In-place refresh of the values, rejected if the shape changed
//! - Collective assembly of per-process structures into a global one whose
//!   first index is the rank, over any [`Communicator`]
//!
//! # Example
//!
//! ```
//! use ndflat_core::{Flat2, Flat3, Layer, Solo};
//!
//! # fn main() -> ndflat_core::Result<()> {
//! // Outer index 0 holds [1, 2], outer index 1 holds [10, 20, 30]
//! let mut local: Flat2<f64> = Flat2::from_generator(&vec![vec![1.0, 2.0], vec![10.0, 20.0, 30.0]])?;
//!
//! assert_eq!(local.len(), 2);
//! assert_eq!(*local.at(1).at(2), 30.0);
//! *local.at_mut(0).at(1) += 0.5;
//! assert_eq!(local.to_string(), "[[1, 2.5], [10, 20, 30]]");
//!
//! // Every rank contributes its local structure; the first index is the rank
//! let global: Flat3<f64> = Flat3::assemble(&Solo, &local)?;
//! assert_eq!(global.checked().at(0)?.at(1)?.len(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! # Design Philosophy
//!
//! The shape is fixed once built. ndflat is not:
//! - A growable container
//! - A persistence format
//! - Safe for concurrent mutation (refresh takes `&mut self`)

mod checked;
pub mod collective;
mod cursor;
mod error;
pub mod generator;
mod layer;
mod offset;

pub use checked::{Checked, CheckedMut};
pub use collective::{Communicator, LocalComm, LocalWorld, Solo};
pub use cursor::{Cursor, CursorMut};
pub use error::{NdError, Result};
pub use generator::Generator;
pub use layer::{Layer, Nested, Values};
pub use offset::Offset;

/// A flat list: one index
pub type Flat1<T> = Values<T>;

/// A list of lists: two indices
pub type Flat2<T, I = usize> = Nested<Values<T>, I>;

/// Three indices
pub type Flat3<T, I = usize> = Nested<Nested<Values<T>, I>, I>;

/// Four indices
pub type Flat4<T, I = usize> = Nested<Nested<Nested<Values<T>, I>, I>, I>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_deep_example() {
        let nd: Flat2<i32> = Flat2::from_generator(&(2, |i: usize| {
            let row: Vec<i32> = if i == 0 { vec![1, 2] } else { vec![10, 20, 30] };
            (row.len(), move |j: usize| row[j])
        }))
        .unwrap();

        assert_eq!(nd.len(), 2);
        assert_eq!(*nd.at(0).at(0), 1);
        assert_eq!(*nd.at(0).at(1), 2);
        assert_eq!(*nd.at(1).at(0), 10);
        assert_eq!(*nd.at(1).at(1), 20);
        assert_eq!(*nd.at(1).at(2), 30);
        assert_eq!(nd.to_string(), "[[1, 2], [10, 20, 30]]");
    }

    #[test]
    fn test_narrow_offsets() {
        let nd: Flat3<u16, u32> = Flat3::from_generator(&vec![vec![vec![1, 2], vec![3]], vec![]]).unwrap();

        assert_eq!(nd.offsets(), &[0u32, 2, 2]);
        assert_eq!(nd.lower().offsets(), &[0u32, 2, 3]);
        assert_eq!(nd[[0, 1, 0]], 3);
    }

    #[test]
    fn test_four_deep() {
        let source = (2, |a: usize| (2, move |b: usize| (a + b, move |c: usize| (c + 1, move |d: usize| a * 1000 + b * 100 + c * 10 + d))));
        let nd: Flat4<usize> = Flat4::from_generator(&source).unwrap();

        assert_eq!(nd.shape(), vec![2, 4, 4, 5]);
        assert_eq!(*nd.at(1).at(1).at(1).at(1), 1111);
        assert_eq!(nd.checked().at(1).unwrap().at(0).unwrap().len(), 1);
    }
}
