//! Capability traits through which the sealing core consumes its
//! collaborators.
//!
//! The worker, header chain, transaction pool, and consensus engine form a
//! cycle in a full node; these narrow interfaces break it. Each component
//! receives only the capabilities it needs at construction and never a full
//! reference to another component's state.

use crate::{
    error::{EngineError, ExecutionError, StateError},
    Block, ChainHeadEvent, ChainSideEvent, GasPool, Header, NewTxsEvent, Noticer, Receipt,
    Transaction,
};
use alloy_primitives::{Address, B256, U256};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, mpsc};

/// A mutable working state rooted at some block.
///
/// Per-transaction rollback works through numbered snapshots; `copy` yields a
/// deeply independent handle. A state may run a background prefetcher that
/// must be stopped before the handle is abandoned.
pub trait State: Send + Sync + 'static {
    /// Record a rollback point and return its id.
    fn snapshot(&mut self) -> usize;

    /// Undo all changes made after the given rollback point.
    fn revert_to_snapshot(&mut self, id: usize);

    /// A deep, independent copy of this state. The copy starts without a
    /// prefetcher.
    fn copy(&self) -> Self
    where
        Self: Sized;

    /// Announce the transaction about to be executed against this state.
    fn prepare(&mut self, tx_hash: B256, index: usize);

    /// Start the background prefetcher. `tag` labels the consumer.
    fn start_prefetcher(&mut self, tag: &'static str);

    /// Stop the background prefetcher. Idempotent.
    fn stop_prefetcher(&mut self);
}

/// Read access to the canonical chain plus transaction execution.
pub trait HeaderChain: Clone + Send + Sync + 'static {
    /// The working-state handle this chain produces.
    type State: State;

    /// The current canonical head, if the chain is initialised.
    fn current_block(&self) -> Option<Block>;

    /// Look up a block by hash.
    fn block_by_hash(&self, hash: &B256) -> Option<Block>;

    /// The block with the given hash followed by up to `count - 1` ancestors.
    fn blocks_from_hash(&self, hash: B256, count: usize) -> Vec<Block>;

    /// All uncles included within `depth` blocks walking back from `from`.
    fn uncles_in_chain(&self, from: Block, depth: u64) -> Vec<Header>;

    /// The base fee for a child of `parent`.
    fn calc_base_fee(&self, parent: &Header) -> U256;

    /// Working state at the given state root.
    fn state_at(&self, root: B256) -> Result<Self::State, StateError>;

    /// Working state for `block`, regenerated by replaying at most
    /// `max_reexec` ancestors when the root itself was pruned.
    fn state_at_block(&self, block: &Block, max_reexec: u64) -> Result<Self::State, StateError>;

    /// Execute `tx` against `state` in the context of `header`, drawing gas
    /// from `gas_pool` and accumulating into `gas_used`.
    ///
    /// On failure the state may be dirty; the caller reverts to its own
    /// snapshot.
    #[allow(clippy::too_many_arguments)]
    fn apply_transaction(
        &self,
        state: &mut Self::State,
        header: &Header,
        coinbase: &Address,
        gas_pool: &mut GasPool,
        gas_used: &mut u64,
        tx: &Transaction,
    ) -> Result<Receipt, ExecutionError>;

    /// Subscribe to canonical head changes.
    fn subscribe_chain_head(&self) -> broadcast::Receiver<ChainHeadEvent>;

    /// Subscribe to side-chain block arrivals.
    fn subscribe_chain_side(&self) -> broadcast::Receiver<ChainSideEvent>;
}

/// The pending-transaction source.
pub trait TransactionPool: Clone + Send + Sync + 'static {
    /// Executable transactions grouped by sender, nonce-sorted within each
    /// group. `enforce_tips` filters transactions below the pool's price
    /// floor.
    fn pending(&self, enforce_tips: bool) -> HashMap<Address, Vec<Arc<Transaction>>>;

    /// Senders the pool treats as local.
    fn locals(&self) -> Vec<Address>;

    /// Subscribe to newly admitted transactions.
    fn subscribe_new_txs(&self) -> broadcast::Receiver<NewTxsEvent>;
}

/// The consensus engine the worker drives candidate blocks through.
pub trait Engine: Clone + Send + Sync + 'static {
    /// Fill the consensus fields (difficulty and friends) of a header under
    /// construction.
    fn prepare<C: HeaderChain>(&self, chain: &C, header: &mut Header) -> Result<(), EngineError>;

    /// Run post-transaction state modifications and assemble the final block.
    fn finalize_and_assemble<C: HeaderChain, S: State>(
        &self,
        chain: &C,
        header: Header,
        state: &mut S,
        transactions: &[Arc<Transaction>],
        uncles: Vec<Header>,
        receipts: &[Receipt],
    ) -> Result<Block, EngineError>;

    /// The hash a header maps to for sealing-work deduplication. Stable and
    /// independent of the proof-of-work fields.
    fn seal_hash(&self, header: &Header) -> B256;

    /// Start sealing `block`, delivering any solution on `results`. The
    /// engine must abort cooperatively when `stop` fires.
    fn seal(
        &self,
        block: Block,
        results: mpsc::Sender<Block>,
        stop: Noticer,
    ) -> Result<(), EngineError>;
}
