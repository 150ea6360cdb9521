use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, NdError>;

/// Errors reported by flattening, lookup and collective assembly.
///
/// `depth` fields count layers from the values buffer upwards: depth 1 is
/// the values layer, depth K the outermost offsets layer.
#[derive(Debug, Error)]
pub enum NdError {
    /// A checked lookup received an index that is not below the extent
    /// reported for that position.
    #[error("index {index} out of range at depth {depth} (extent is {extent})")]
    OutOfRange {
        /// Layer the index was applied to
        depth: usize,
        /// Offending index
        index: usize,
        /// Exclusive upper bound that was in force
        extent: usize,
    },

    /// A refresh source implies a different sub-list length than the one
    /// recorded in the offsets buffers. Offsets are never rebuilt on refresh.
    #[error(
        "structure has changed at depth {depth}, position {position}: expected {expected} children, found {found}"
    )]
    StructureChanged {
        /// Layer whose extent disagrees
        depth: usize,
        /// Node position inside that layer (or rank, for collective refresh)
        position: usize,
        /// Length recorded at initialization
        expected: usize,
        /// Length reported by the new source
        found: usize,
    },

    /// `refresh` was called before `initialize`.
    #[error("cannot refresh: structure has not been initialized")]
    Uninitialized,

    /// `initialize` was called twice.
    #[error("structure is already initialized; use refresh instead")]
    AlreadyInitialized,

    /// An offset does not fit the chosen index type.
    #[error("offset {value} does not fit the index type")]
    IndexOverflow {
        /// Offset that overflowed
        value: usize,
    },

    /// The communicator failed while exchanging counts or buffers.
    #[error("collective communication failed: {0}")]
    Communication(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message() {
        let err = NdError::OutOfRange { depth: 2, index: 5, extent: 3 };
        assert_eq!(err.to_string(), "index 5 out of range at depth 2 (extent is 3)");
    }

    #[test]
    fn test_communication_from_anyhow() {
        let err: NdError = anyhow::anyhow!("peer vanished").into();
        assert!(matches!(err, NdError::Communication(_)));
        assert!(err.to_string().contains("peer vanished"));
    }
}
