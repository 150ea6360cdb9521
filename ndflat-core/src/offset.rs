//! Integer types usable as offsets into the next layer down.
//!
//! Narrow offset types halve the size of every offsets buffer, which matters
//! for deep structures where offsets dominate the footprint. All arithmetic
//! happens in `usize`; values are narrowed only when stored.

use std::fmt::Debug;

/// Unsigned integer stored in the offsets buffers of a [`Nested`] layer.
///
/// [`Nested`]: crate::Nested
pub trait Offset: Copy + Ord + Debug + Send + Sync + 'static {
    /// The leading entry of every offsets buffer
    const ZERO: Self;

    /// Converts a `usize`, returning `None` if it does not fit.
    fn from_usize(value: usize) -> Option<Self>;

    /// Widens to `usize`.
    fn to_usize(self) -> usize;
}

impl Offset for usize {
    const ZERO: Self = 0;

    #[inline]
    fn from_usize(value: usize) -> Option<Self> {
        Some(value)
    }

    #[inline]
    fn to_usize(self) -> usize {
        self
    }
}

impl Offset for u64 {
    const ZERO: Self = 0;

    #[inline]
    fn from_usize(value: usize) -> Option<Self> {
        u64::try_from(value).ok()
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn to_usize(self) -> usize {
        // Stored values always came from a usize
        self as usize
    }
}

impl Offset for u32 {
    const ZERO: Self = 0;

    #[inline]
    fn from_usize(value: usize) -> Option<Self> {
        u32::try_from(value).ok()
    }

    #[inline]
    fn to_usize(self) -> usize {
        self as usize
    }
}
