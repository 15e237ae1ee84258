//! Worker-facing error types.

use alloy_primitives::B256;
use thiserror::Error;
use trellis_types::error::{EngineError, StateError};

/// Errors surfaced by the worker's synchronous request paths.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The worker has shut down.
    #[error("sealer closed")]
    Closed,
    /// The chain has no head to build on.
    #[error("missing parent")]
    MissingParent,
    /// The requested parent block is unknown.
    #[error("unknown parent {0}")]
    UnknownParent(B256),
    /// A forced timestamp does not advance past the parent.
    #[error("invalid timestamp: parent {parent}, given {given}")]
    InvalidTimestamp {
        /// The parent block's timestamp.
        parent: u64,
        /// The timestamp the caller forced.
        given: u64,
    },
    /// The worker is running but no fee recipient is configured.
    #[error("coinbase not configured")]
    MissingCoinbase,
    /// The parent state could not be obtained.
    #[error(transparent)]
    State(#[from] StateError),
    /// The consensus engine rejected the round.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Reasons a side-chain header is refused as an uncle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum UncleError {
    /// The header is already staged in the environment.
    #[error("uncle not unique")]
    NotUnique,
    /// The header shares a parent with the block under construction.
    #[error("uncle is sibling")]
    Sibling,
    /// The header's parent is not a recent ancestor.
    #[error("uncle's parent unknown")]
    ParentUnknown,
    /// The header is an ancestor or an already-included uncle.
    #[error("uncle already included")]
    AlreadyIncluded,
}
