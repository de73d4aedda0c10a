// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-weave.

use crate::path::{ModulePath, ObservationPoint};

/// Errors that can occur while building, compiling, or interleaving an
/// intervention graph.
#[derive(Debug, thiserror::Error)]
pub enum WeaveError {
    /// A node argument referenced a node that does not exist in the graph.
    #[error("unknown dependency: node `{name}` is not in the graph")]
    UnknownDependency {
        /// Name of the missing node.
        name: String,
    },

    /// The graph references a module path absent from the host it was
    /// compiled against.
    #[error("missing observation point: module path `{path}` not found in host")]
    MissingObservationPoint {
        /// The path that could not be resolved.
        path: ModulePath,
    },

    /// Two nodes attempted to overwrite the same observed value at the
    /// same point and iteration.
    #[error(
        "conflicting write-back at {point}: nodes `{first}` and `{second}` \
         both attempt to replace the observed value"
    )]
    ConflictingWriteback {
        /// Observation point both nodes target.
        point: ObservationPoint,
        /// First registered node.
        first: String,
        /// Second registered node.
        second: String,
    },

    /// Two structural edits target the same module path.
    #[error("structural edit conflict: two edits target `{path}`")]
    StructuralEditConflict {
        /// The contested path.
        path: ModulePath,
    },

    /// A node never received a value during execution.
    ///
    /// Only produced by [`Graph::require_value`](crate::Graph::require_value);
    /// execution itself treats unresolved nodes as a normal terminal state.
    #[error("unresolved node: `{name}` never received a value")]
    UnresolvedNode {
        /// Name of the unresolved node.
        name: String,
    },

    /// Graph construction that is statically known to be shape-incompatible
    /// with the scanned host.
    #[error("shape-incompatible node: {0}")]
    ShapeIncompatible(String),

    /// Failure reported by the host model (execution or structural mutation).
    #[error("host error: {0}")]
    Host(String),

    /// Tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),
}

/// Result type alias for candle-weave operations.
pub type Result<T> = std::result::Result<T, WeaveError>;
