//! Error types shared across the trellis crates.

use alloy_primitives::B256;
use thiserror::Error;

/// Return an error if the condition is false.
#[macro_export(local_inner_macros)]
macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
}

/// Signature validation failures.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SignerError {
    /// A protected signature committed to a foreign chain.
    #[error("invalid chain id: expected {expected}, got {got}")]
    InvalidChainId {
        /// The local chain id.
        expected: u64,
        /// The id the signature committed to.
        got: u64,
    },
}

/// Classified failures of a single transaction execution.
///
/// The first four variants drive the pack loop's pop/shift policy; anything
/// the chain cannot classify arrives as [`ExecutionError::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The block's remaining gas budget cannot cover the transaction.
    #[error("gas limit reached")]
    GasLimitReached,
    /// The transaction nonce is behind the account nonce.
    #[error("nonce too low")]
    NonceTooLow,
    /// The transaction nonce is ahead of the account nonce.
    #[error("nonce too high")]
    NonceTooHigh,
    /// The chain does not admit this transaction type.
    #[error("transaction type not supported")]
    TxTypeNotSupported,
    /// Unclassified execution failure.
    #[error("{0}")]
    Other(String),
}

/// Failures obtaining a working state.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StateError {
    /// No state is available for the requested root.
    #[error("state unavailable for root {0}")]
    Unavailable(B256),
    /// Historical replay gave up before reaching the requested block.
    #[error("state replay exceeded {max} blocks")]
    ReplayDepthExceeded {
        /// The replay bound that was exhausted.
        max: u64,
    },
}

/// Failures surfaced by the consensus engine.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Header preparation failed.
    #[error("prepare: {0}")]
    Prepare(String),
    /// Block finalization failed.
    #[error("finalize: {0}")]
    Finalize(String),
    /// The sealing backend rejected the task.
    #[error("seal: {0}")]
    Seal(String),
}
