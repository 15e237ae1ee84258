//! The mutable scratchpad for one in-progress block.

use crate::{error::UncleError, worker::STALE_THRESHOLD};
use alloy_primitives::{Address, B256};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Instant,
};
use tracing::warn;
use trellis_types::{
    ensure, error::StateError, Block, ChainConfig, GasPool, Header, HeaderChain, Receipt, Signer,
    State, Transaction,
};

/// Upper bound on historical replay when the parent state was pruned.
const MAX_STATE_REPLAY: u64 = 1024;

/// Everything accumulated while assembling one candidate block.
///
/// An environment owns its working state exclusively. Dropping the
/// environment stops the state's background prefetcher, so every exit path
/// releases it.
pub(crate) struct Environment<S: State> {
    /// Signer for the block under construction.
    pub(crate) signer: Signer,
    /// Working state; `None` only after decomposition into a task.
    state: Option<S>,
    /// Hashes of the recent ancestors, for uncle parent validity.
    pub(crate) ancestors: HashSet<B256>,
    /// Hashes disqualified from being uncles: ancestors plus their uncles.
    pub(crate) family: HashSet<B256>,
    /// Count of applied transactions this cycle.
    pub(crate) tcount: usize,
    /// Remaining gas budget, allocated lazily at the first pack attempt.
    pub(crate) gas_pool: Option<GasPool>,
    /// Fee recipient. May differ from the header coinbase.
    pub(crate) coinbase: Address,
    /// The header under construction.
    pub(crate) header: Header,
    /// Accepted transactions, in application order.
    pub(crate) txs: Vec<Arc<Transaction>>,
    /// Receipts matching `txs` index-for-index.
    pub(crate) receipts: Vec<Receipt>,
    /// Staged uncles by hash.
    pub(crate) uncles: HashMap<B256, Header>,
    /// Aggregate gas used by coincident blocks in the outer contexts.
    pub(crate) external_gas_used: u64,
    /// Number of coincident external blocks behind `external_gas_used`.
    pub(crate) external_block_len: u64,
}

impl<S: State> Environment<S> {
    /// Build a fresh environment on top of `parent` for the prepared
    /// `header`.
    ///
    /// Obtains the parent state (recovering through a bounded replay when the
    /// root was pruned), starts the prefetcher, and walks the recent
    /// ancestors to seed the uncle-validity sets.
    pub(crate) fn build<C>(
        chain: &C,
        config: &ChainConfig,
        parent: &Block,
        header: Header,
        coinbase: Address,
    ) -> Result<Self, StateError>
    where
        C: HeaderChain<State = S>,
    {
        let ctx = config.context;
        let mut state = match chain.state_at(parent.state_root(ctx)) {
            Ok(state) => state,
            Err(err) => {
                // The parent may sit on an arbitrary fork whose state was
                // already pruned; regenerate it within a bounded replay.
                let state = chain.state_at_block(parent, MAX_STATE_REPLAY)?;
                warn!(
                    target: "sealer::environment",
                    root = %parent.state_root(ctx),
                    %err,
                    "recovered sealing state",
                );
                state
            }
        };
        state.start_prefetcher("sealer");

        let mut env = Self {
            signer: config.signer_at(header.number[ctx]),
            state: Some(state),
            ancestors: HashSet::new(),
            family: HashSet::new(),
            tcount: 0,
            gas_pool: None,
            coinbase,
            header,
            txs: Vec::new(),
            receipts: Vec::new(),
            uncles: HashMap::new(),
            external_gas_used: 0,
            external_block_len: 0,
        };
        for ancestor in chain.blocks_from_hash(parent.hash(), STALE_THRESHOLD as usize) {
            for uncle in ancestor.uncles() {
                env.family.insert(uncle.hash());
            }
            env.family.insert(ancestor.hash());
            env.ancestors.insert(ancestor.hash());
        }
        Ok(env)
    }

    /// Deep copy. The copied state starts without a prefetcher.
    pub(crate) fn copy(&self) -> Self {
        Self {
            signer: self.signer.clone(),
            state: Some(self.state().copy()),
            ancestors: self.ancestors.clone(),
            family: self.family.clone(),
            tcount: self.tcount,
            gas_pool: self.gas_pool,
            coinbase: self.coinbase,
            header: self.header.clone(),
            txs: self.txs.clone(),
            receipts: self.receipts.clone(),
            uncles: self.uncles.clone(),
            external_gas_used: self.external_gas_used,
            external_block_len: self.external_block_len,
        }
    }

    /// Stage a side-chain header as an uncle.
    pub(crate) fn commit_uncle(&mut self, uncle: Header, ctx: usize) -> Result<(), UncleError> {
        let hash = uncle.hash();
        ensure!(!self.uncles.contains_key(&hash), UncleError::NotUnique);
        ensure!(self.header.parent_hash[ctx] != uncle.parent_hash[ctx], UncleError::Sibling);
        ensure!(self.ancestors.contains(&uncle.parent_hash[ctx]), UncleError::ParentUnknown);
        ensure!(!self.family.contains(&hash), UncleError::AlreadyIncluded);
        self.uncles.insert(hash, uncle);
        Ok(())
    }

    /// The staged uncles as a list.
    pub(crate) fn uncle_list(&self) -> Vec<Header> {
        self.uncles.values().cloned().collect()
    }

    /// The working state.
    pub(crate) fn state(&self) -> &S {
        self.state.as_ref().expect("environment state present")
    }

    /// The working state, mutably.
    pub(crate) fn state_mut(&mut self) -> &mut S {
        self.state.as_mut().expect("environment state present")
    }

    /// Split borrows for finalization: state, transactions, receipts.
    pub(crate) fn sealing_parts(&mut self) -> (&mut S, &[Arc<Transaction>], &[Receipt]) {
        (self.state.as_mut().expect("environment state present"), &self.txs, &self.receipts)
    }

    /// Split borrows for executing one transaction.
    pub(crate) fn exec_parts(&mut self) -> (&mut S, &mut GasPool, &Header, &Address) {
        (
            self.state.as_mut().expect("environment state present"),
            self.gas_pool.as_mut().expect("gas pool initialised"),
            &self.header,
            &self.coinbase,
        )
    }

    /// Decompose into a sealing task, stopping the prefetcher first.
    pub(crate) fn into_task(mut self, block: Block) -> SealTask<S> {
        let mut state = self.state.take().expect("environment state present");
        state.stop_prefetcher();
        SealTask {
            block,
            state,
            receipts: std::mem::take(&mut self.receipts),
            created_at: Instant::now(),
        }
    }
}

impl<S: State> Drop for Environment<S> {
    fn drop(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.stop_prefetcher();
        }
    }
}

impl<S: State> fmt::Debug for Environment<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("number", &self.header.number)
            .field("tcount", &self.tcount)
            .field("uncles", &self.uncles.len())
            .finish_non_exhaustive()
    }
}

/// A finished candidate block handed to the seal dispatcher.
///
/// Immutable once produced; keyed in the pending-tasks table by the engine's
/// seal-hash of its header.
pub struct SealTask<S> {
    /// The assembled block.
    pub block: Block,
    /// The post-execution state behind the block.
    pub state: S,
    /// Receipts for the block's transactions.
    pub receipts: Vec<Receipt>,
    /// When the task was produced.
    pub created_at: Instant,
}

impl<S> fmt::Debug for SealTask<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealTask")
            .field("block", &self.block.hash())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// The externally visible view of the block under construction.
pub(crate) struct Snapshot<S> {
    pub(crate) block: Block,
    pub(crate) receipts: Vec<Receipt>,
    pub(crate) state: S,
}
