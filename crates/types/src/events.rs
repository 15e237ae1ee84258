//! Events the sealing core subscribes to.

use crate::{Block, Transaction};
use std::sync::Arc;

/// The canonical chain advanced to a new head.
#[derive(Clone, Debug)]
pub struct ChainHeadEvent {
    /// The new head block.
    pub block: Block,
}

/// A block arrived on a side chain; a potential uncle.
#[derive(Clone, Debug)]
pub struct ChainSideEvent {
    /// The side-chain block.
    pub block: Block,
}

/// New transactions entered the pool.
#[derive(Clone, Debug)]
pub struct NewTxsEvent {
    /// The newly admitted transactions.
    pub txs: Vec<Arc<Transaction>>,
}
