//! Candidate-block assembly and the worker's main event loop.
//!
//! The assembler owns the current environment and both uncle pools. It is the
//! only task that mutates them, so no locks guard either; everything arrives
//! through its channels.

use crate::{
    environment::{Environment, Snapshot},
    worker::{
        GenerateParams, GetWorkRequest, Interrupt, InterruptCell, IntervalAdjust, IsLocalBlock,
        NewWorkRequest, Shared, UNCLE_SWEEP_INTERVAL,
    },
    SealTask, WorkerError,
};
use alloy_primitives::B256;
use std::{
    collections::HashMap,
    sync::{atomic::Ordering, Arc},
    time::Instant,
};
use tokio::{
    sync::{broadcast, mpsc},
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};
use trellis_types::{
    calc_gas_limit, error::ExecutionError, now, BestTransactions, Block, ChainConfig,
    ChainSideEvent, Engine, GasPool, HeaderChain, Log, NewTxsEvent, Noticer, State, Transaction,
    TransactionPool, TX_GAS, UNCLE_DENSITY_WINDOW,
};

/// Maximum number of uncles installed per block.
const MAX_UNCLES: usize = 2;

/// Channel ends the main loop consumes.
pub(crate) struct AssemblerChannels {
    /// New-work requests from the scheduler.
    pub(crate) new_work: mpsc::Receiver<NewWorkRequest>,
    /// Synchronous get-work requests from the controller.
    pub(crate) get_work: mpsc::Receiver<GetWorkRequest>,
    /// Side-chain arrivals from the header chain.
    pub(crate) chain_side: broadcast::Receiver<ChainSideEvent>,
    /// New-transaction announcements from the pool.
    pub(crate) txs: broadcast::Receiver<NewTxsEvent>,
    /// Worker shutdown.
    pub(crate) shutdown: Noticer,
}

/// The main event loop (and the sealing-task assembler it drives).
pub(crate) struct Assembler<BT: HeaderChain, Pool, CE> {
    pub(crate) chain: BT,
    pub(crate) pool: Pool,
    pub(crate) engine: CE,
    pub(crate) chain_config: ChainConfig,
    pub(crate) shared: Arc<Shared<BT::State>>,
    /// The environment of the current sealing cycle.
    pub(crate) current: Option<Environment<BT::State>>,
    /// Side blocks produced by this node, preferred as uncles.
    pub(crate) local_uncles: HashMap<B256, Block>,
    /// Side blocks received from the network.
    pub(crate) remote_uncles: HashMap<B256, Block>,
    /// Classifies side blocks into the local pool.
    pub(crate) is_local_block: Option<IsLocalBlock>,
    /// Finished tasks, toward the dispatcher.
    pub(crate) task_tx: mpsc::Sender<SealTask<BT::State>>,
    /// Fill-ratio feedback, toward the scheduler.
    pub(crate) resubmit_adjust_tx: mpsc::Sender<IntervalAdjust>,
    /// Local context slot in per-context header arrays.
    pub(crate) ctx: usize,
}

impl<BT, Pool, CE> Assembler<BT, Pool, CE>
where
    BT: HeaderChain,
    Pool: TransactionPool,
    CE: Engine,
{
    /// Demultiplex events until shutdown or a subscription closes.
    pub(crate) async fn run(mut self, mut ch: AssemblerChannels) {
        let mut sweep = time::interval(UNCLE_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(req) = ch.new_work.recv() => {
                    self.commit_work(Some(req.interrupt), req.noempty, req.timestamp).await;
                }
                Some(req) = ch.get_work.recv() => match req {
                    GetWorkRequest::Block { params, reply } => {
                        let _ = reply.send(self.generate_work(&params).await);
                    }
                    GetWorkRequest::PendingHeader { parent_number, reply } => {
                        self.shared.clear_stale_tasks(parent_number);
                        let result = self
                            .prepare_work(&GenerateParams { timestamp: now(), ..Default::default() })
                            .map(|env| env.header.clone());
                        let _ = reply.send(result);
                    }
                },
                event = ch.chain_side.recv() => match event {
                    Ok(event) => self.on_chain_side(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "sealer::assembler", missed, "side-chain subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = ch.txs.recv() => match event {
                    Ok(event) => self.on_new_txs(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "sealer::assembler", missed, "transaction subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => self.sweep_stale_uncles(),
                _ = ch.shutdown.recv() => break,
            }
        }
        // releases the prefetcher of whatever cycle was in flight
        self.current = None;
    }

    /// A side block arrived: pool it and, when profitable, graft it onto the
    /// current cycle.
    async fn on_chain_side(&mut self, event: ChainSideEvent) {
        let hash = event.block.hash();
        if self.local_uncles.contains_key(&hash) || self.remote_uncles.contains_key(&hash) {
            return;
        }
        let local = self
            .is_local_block
            .as_ref()
            .is_some_and(|is_local| is_local(event.block.header()));
        if local {
            self.local_uncles.insert(hash, event.block.clone());
        } else {
            self.remote_uncles.insert(hash, event.block.clone());
        }

        // If the sealing block holds fewer than the maximum uncles, admit the
        // arrival and regenerate for the extra reward.
        if !self.shared.is_running() {
            return;
        }
        let start = Instant::now();
        let ctx = self.ctx;
        let regenerate = match self.current.as_mut() {
            Some(current) if current.uncles.len() < MAX_UNCLES => current
                .commit_uncle(event.block.header().clone(), ctx)
                .map(|()| current.copy())
                .ok(),
            _ => None,
        };
        if let Some(copy) = regenerate {
            self.commit(copy, true, start).await;
        }
    }

    /// New pool transactions: extend the pending block when idle, or kick a
    /// round directly under zero-period PoA.
    async fn on_new_txs(&mut self, event: NewTxsEvent) {
        if !self.shared.is_running() && self.current.is_some() {
            let mut env = self.current.take().expect("presence checked");
            // skip entirely once the pending block is full
            let full = env.gas_pool.is_some_and(|pool| pool.gas() < TX_GAS);
            if !full {
                let mut buckets: HashMap<_, Vec<Arc<Transaction>>> = HashMap::new();
                for tx in &event.txs {
                    if let Ok(sender) = env.signer.sender(tx) {
                        buckets.entry(sender).or_default().push(tx.clone());
                    }
                }
                let base_fee = env.header.base_fee[self.ctx];
                let mut txs = BestTransactions::new(env.signer.clone(), buckets, base_fee);
                let tcount = env.tcount;
                self.commit_transactions(&mut env, &mut txs, None).await;
                if tcount != env.tcount {
                    self.update_snapshot(&env);
                }
            }
            self.current = Some(env);
        } else if self.chain_config.is_dev_mode() {
            // Zero-period PoA seals instantaneously and rejects empty
            // submissions, so build directly on arrival.
            self.commit_work(None, true, now()).await;
        }
        self.shared.new_txs.fetch_add(event.txs.len() as u32, Ordering::AcqRel);
    }

    /// Drop pooled uncles that can no longer be included.
    fn sweep_stale_uncles(&mut self) {
        let Some(head) = self.chain.current_block() else { return };
        let ctx = self.ctx;
        let head_number = head.number(ctx);
        self.local_uncles
            .retain(|_, uncle| uncle.number(ctx) + crate::worker::STALE_THRESHOLD > head_number);
        self.remote_uncles
            .retain(|_, uncle| uncle.number(ctx) + crate::worker::STALE_THRESHOLD > head_number);
    }

    /// Construct a prepared environment for a new sealing cycle: resolve the
    /// parent, clamp the timestamp, lay out the header, run the engine's
    /// preparation, build the environment, and install pooled uncles.
    pub(crate) fn prepare_work(
        &mut self,
        params: &GenerateParams,
    ) -> Result<Environment<BT::State>, WorkerError> {
        let ctx = self.ctx;
        let (configured_coinbase, extra) = {
            let config = self.shared.config.read();
            (config.coinbase, config.extra.clone())
        };

        let parent = match params.parent_hash {
            Some(hash) => {
                self.chain.block_by_hash(&hash).ok_or(WorkerError::UnknownParent(hash))?
            }
            None => self.chain.current_block().ok_or(WorkerError::MissingParent)?,
        };

        let mut timestamp = params.timestamp;
        if parent.time() >= timestamp {
            if params.force_time {
                return Err(WorkerError::InvalidTimestamp {
                    parent: parent.time(),
                    given: timestamp,
                });
            }
            timestamp = parent.time() + 1;
        }

        let mut header = trellis_types::Header {
            time: timestamp,
            location: self.chain_config.location.clone(),
            mix_hash: params.random,
            ..Default::default()
        };
        header.parent_hash[ctx] = parent.hash();
        header.number[ctx] = parent.number(ctx) + 1;
        if !params.no_extra {
            header.extra[ctx] = extra;
        }
        header.base_fee[ctx] = self.chain.calc_base_fee(parent.header());

        let coinbase = match params.coinbase {
            Some(coinbase) => Some(coinbase),
            None if self.shared.is_running() => match configured_coinbase {
                Some(coinbase) => Some(coinbase),
                None => {
                    error!(target: "sealer::assembler", "refusing to seal without a coinbase");
                    return Err(WorkerError::MissingCoinbase);
                }
            },
            None => None,
        };
        if let Some(coinbase) = coinbase {
            header.coinbase[ctx] = coinbase;
        }

        self.engine.prepare(&self.chain, &mut header).map_err(|err| {
            error!(target: "sealer::assembler", %err, "failed to prepare header for sealing");
            WorkerError::from(err)
        })?;

        let mut env = Environment::build(
            &self.chain,
            &self.chain_config,
            &parent,
            header,
            coinbase.unwrap_or_default(),
        )
        .map_err(|err| {
            error!(target: "sealer::assembler", %err, "failed to create sealing context");
            WorkerError::from(err)
        })?;

        if !params.no_uncle {
            Self::install_uncles(&mut env, &self.local_uncles, ctx);
            Self::install_uncles(&mut env, &self.remote_uncles, ctx);
        }
        Ok(env)
    }

    /// Try each pooled side block as an uncle until the block is full.
    fn install_uncles(
        env: &mut Environment<BT::State>,
        pool: &HashMap<B256, Block>,
        ctx: usize,
    ) {
        for (hash, uncle) in pool {
            if env.uncles.len() == MAX_UNCLES {
                break;
            }
            match env.commit_uncle(uncle.header().clone(), ctx) {
                Ok(()) => debug!(target: "sealer::assembler", %hash, "committing new uncle to block"),
                Err(err) => trace!(target: "sealer::assembler", %hash, %err, "possible uncle rejected"),
            }
        }
    }

    /// Recompute the header gas limit from the parent's, the cross-context
    /// aggregate usage, and the uncle density over the recent window.
    pub(crate) fn adjust_gas_limit(&self, env: &mut Environment<BT::State>) {
        let ctx = self.ctx;
        let Some(parent) = self.chain.current_block() else { return };
        let gas_used =
            (parent.gas_used(ctx) + env.external_gas_used) / (env.external_block_len + 1);
        let uncle_count = self
            .chain
            .block_by_hash(&env.header.parent_hash[ctx])
            .map(|prev| self.chain.uncles_in_chain(prev, UNCLE_DENSITY_WINDOW).len())
            .unwrap_or_default();
        let (floor, ceil) = {
            let config = self.shared.config.read();
            (config.gas_floor, config.gas_ceil)
        };
        env.header.gas_limit[ctx] =
            calc_gas_limit(parent.gas_limit(ctx), gas_used, uncle_count, floor, ceil);
    }

    /// The synchronous path: assemble and return a block without touching the
    /// worker's own cycle.
    pub(crate) async fn generate_work(
        &mut self,
        params: &GenerateParams,
    ) -> Result<Block, WorkerError> {
        let mut work = self.prepare_work(params)?;
        self.adjust_gas_limit(&mut work);
        self.fill_transactions(None, &mut work).await;
        let header = work.header.clone();
        let uncles = work.uncle_list();
        let (state, txs, receipts) = work.sealing_parts();
        let block = self
            .engine
            .finalize_and_assemble(&self.chain, header, state, txs, uncles, receipts)?;
        Ok(block)
    }

    /// The asynchronous path: assemble, hand a copy to the dispatcher, and
    /// make the fresh environment current.
    pub(crate) async fn commit_work(
        &mut self,
        interrupt: Option<InterruptCell>,
        noempty: bool,
        timestamp: u64,
    ) {
        let start = Instant::now();
        if self.shared.is_running() && self.shared.config.read().coinbase.is_none() {
            error!(target: "sealer::assembler", "refusing to seal without a coinbase");
            return;
        }
        let params = GenerateParams { timestamp, ..Default::default() };
        let mut work = match self.prepare_work(&params) {
            Ok(work) => work,
            Err(err) => {
                debug!(target: "sealer::assembler", %err, "skipping sealing round");
                return;
            }
        };
        self.adjust_gas_limit(&mut work);
        if self.fill_transactions(interrupt.as_ref(), &mut work).await {
            // superseded by a new head: the semi-finished work is discarded
            return;
        }
        let noempty = noempty || self.shared.preseal_disabled();
        if !(noempty && work.tcount == 0) {
            self.commit(work.copy(), true, start).await;
        } else {
            // the empty round is not sealed, but readers still see it
            self.update_snapshot(&work);
        }
        // Swap in the new cycle; dropping the previous environment terminates
        // its prefetcher.
        self.current = Some(work);
    }

    /// Finalize a copy of `env` into a sealing task and refresh the snapshot.
    pub(crate) async fn commit(
        &self,
        env: Environment<BT::State>,
        update: bool,
        start: Instant,
    ) {
        if self.shared.is_running() {
            // Finalization mutates state, so work on a private copy to avoid
            // racing the snapshot the readers see.
            let mut sealing = env.copy();
            let header = sealing.header.clone();
            let uncles = sealing.uncle_list();
            let uncle_count = uncles.len();
            let tcount = sealing.tcount;
            let (state, txs, receipts) = sealing.sealing_parts();
            match self
                .engine
                .finalize_and_assemble(&self.chain, header, state, txs, uncles, receipts)
            {
                Ok(block) => {
                    let seal_hash = self.engine.seal_hash(block.header());
                    let number = block.number(self.ctx);
                    let gas = block.gas_used(self.ctx);
                    let task = sealing.into_task(block);
                    if self.task_tx.send(task).await.is_ok() {
                        info!(
                            target: "sealer::assembler",
                            number,
                            %seal_hash,
                            uncles = uncle_count,
                            txs = tcount,
                            gas,
                            elapsed = ?start.elapsed(),
                            "commit new sealing work",
                        );
                    } else {
                        debug!(target: "sealer::assembler", "dispatcher has exited");
                    }
                }
                Err(err) => {
                    error!(target: "sealer::assembler", %err, "failed to finalize sealing block");
                }
            }
        }
        if update {
            self.update_snapshot(&env);
        }
    }

    /// Pull the pool's pending set and pack it, local senders first.
    ///
    /// Returns `true` when a new-head interrupt abandoned the work.
    pub(crate) async fn fill_transactions(
        &self,
        interrupt: Option<&InterruptCell>,
        env: &mut Environment<BT::State>,
    ) -> bool {
        let mut remotes = self.pool.pending(true);
        let mut locals = HashMap::new();
        for sender in self.pool.locals() {
            if let Some(txs) = remotes.remove(&sender) {
                locals.insert(sender, txs);
            }
        }
        let base_fee = env.header.base_fee[self.ctx];
        if !locals.is_empty() {
            let mut txs = BestTransactions::new(env.signer.clone(), locals, base_fee);
            if self.commit_transactions(env, &mut txs, interrupt).await {
                return true;
            }
        }
        if !remotes.is_empty() {
            let mut txs = BestTransactions::new(env.signer.clone(), remotes, base_fee);
            if self.commit_transactions(env, &mut txs, interrupt).await {
                return true;
            }
        }
        false
    }

    /// Pack transactions from `txs` into the environment until the block
    /// fills, the iterator drains, or an interrupt fires.
    ///
    /// Returns `true` when the caller must discard the environment (new-head
    /// interrupt); a resubmit interrupt leaves the work usable as-is.
    pub(crate) async fn commit_transactions(
        &self,
        env: &mut Environment<BT::State>,
        txs: &mut BestTransactions,
        interrupt: Option<&InterruptCell>,
    ) -> bool {
        let gas_limit = env.header.gas_limit[self.ctx];
        if env.gas_pool.is_none() {
            env.gas_pool = Some(GasPool::new(gas_limit));
        }
        let mut coalesced_logs: Vec<Log> = Vec::new();

        loop {
            // A new-head signal discards the semi-finished work; a resubmit
            // signal hands it to the sealer as-is and asks the scheduler to
            // slow down.
            if let Some(cell) = interrupt {
                let signal = Interrupt::from_raw(cell.load(Ordering::Acquire));
                if signal != Interrupt::None {
                    if signal == Interrupt::Resubmit {
                        let remaining = env.gas_pool.expect("gas pool initialised").gas();
                        let ratio =
                            ((gas_limit - remaining) as f64 / gas_limit as f64).max(0.1);
                        let _ = self
                            .resubmit_adjust_tx
                            .send(IntervalAdjust { ratio, inc: true })
                            .await;
                    }
                    return signal == Interrupt::NewHead;
                }
            }
            let remaining = env.gas_pool.expect("gas pool initialised").gas();
            if remaining < TX_GAS {
                trace!(
                    target: "sealer::assembler",
                    have = remaining,
                    want = TX_GAS,
                    "not enough gas for further transactions",
                );
                break;
            }
            let Some(tx) = txs.peek().cloned() else { break };

            // Protected transactions are held back until replay protection
            // activates; dropping the whole bucket skips the account.
            if tx.protected() && !self.chain_config.is_replay_protected(env.header.number[self.ctx])
            {
                trace!(
                    target: "sealer::assembler",
                    hash = %tx.hash(),
                    "ignoring replay-protected transaction before activation",
                );
                txs.pop();
                continue;
            }

            let index = env.tcount;
            env.state_mut().prepare(tx.hash(), index);

            match self.commit_transaction(env, &tx) {
                Err(ExecutionError::GasLimitReached) => {
                    // out of gas for this sender's backlog, not the block
                    trace!(target: "sealer::assembler", sender = %tx.from, "gas limit exceeded for current block");
                    txs.pop();
                }
                Err(ExecutionError::NonceTooLow) => {
                    // stale entry from a pool/head race, try the next nonce
                    trace!(target: "sealer::assembler", sender = %tx.from, nonce = tx.nonce, "skipping transaction with low nonce");
                    txs.shift();
                }
                Err(ExecutionError::NonceTooHigh) => {
                    // nonce gap, the whole account waits for the next cycle
                    trace!(target: "sealer::assembler", sender = %tx.from, nonce = tx.nonce, "skipping account with high nonce");
                    txs.pop();
                }
                Err(ExecutionError::TxTypeNotSupported) => {
                    trace!(target: "sealer::assembler", sender = %tx.from, "skipping unsupported transaction type");
                    txs.pop();
                }
                Ok(logs) => {
                    coalesced_logs.extend(logs);
                    env.tcount += 1;
                    txs.shift();
                }
                Err(err) => {
                    debug!(target: "sealer::assembler", hash = %tx.hash(), %err, "transaction failed, account skipped");
                    txs.shift();
                }
            }
        }

        if !self.shared.is_running() && !coalesced_logs.is_empty() {
            // While sealing, each resubmission would republish the same logs;
            // the pending-logs feed only runs when the worker is idle.
            let _ = self.shared.pending_logs.send(coalesced_logs);
        }
        if interrupt.is_some() {
            // an uninterrupted round means the interval can relax again
            let _ = self
                .resubmit_adjust_tx
                .send(IntervalAdjust { ratio: 0.0, inc: false })
                .await;
        }
        false
    }

    /// Execute one transaction against the environment, reverting the state
    /// on failure.
    fn commit_transaction(
        &self,
        env: &mut Environment<BT::State>,
        tx: &Arc<Transaction>,
    ) -> Result<Vec<Log>, ExecutionError> {
        let ctx = self.ctx;
        let mut gas_used = env.header.gas_used[ctx];
        let (state, gas_pool, header, coinbase) = env.exec_parts();
        let snap = state.snapshot();
        match self.chain.apply_transaction(state, header, coinbase, gas_pool, &mut gas_used, tx) {
            Ok(receipt) => {
                let logs = receipt.logs.clone();
                env.header.gas_used[ctx] = gas_used;
                env.txs.push(tx.clone());
                env.receipts.push(receipt);
                Ok(logs)
            }
            Err(err) => {
                state.revert_to_snapshot(snap);
                Err(err)
            }
        }
    }

    /// Publish the environment as the externally visible pending block.
    pub(crate) fn update_snapshot(&self, env: &Environment<BT::State>) {
        let block = Block::new(
            env.header.clone(),
            env.txs.clone(),
            env.uncle_list(),
            &env.receipts,
            self.ctx,
        );
        let snapshot =
            Snapshot { block, receipts: env.receipts.clone(), state: env.state().copy() };
        *self.shared.snapshot.write() = Some(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{
            account, default_balance, test_chain_config, MemChain, MemState, TestEngine, TestPool,
            TransactionFactory,
        },
        worker::{WorkerConfig, PENDING_LOGS_CHAN_SIZE},
        WorkerError,
    };
    use alloy_primitives::Address;
    use assert_matches::assert_matches;
    use parking_lot::{Mutex, RwLock};
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64};
    use trellis_types::U256;

    const CTX: usize = 2;

    struct Fixture {
        assembler: Assembler<MemChain, TestPool, TestEngine>,
        adjust_rx: mpsc::Receiver<IntervalAdjust>,
        #[allow(dead_code)]
        task_rx: mpsc::Receiver<crate::SealTask<MemState>>,
        chain: MemChain,
        pool: TestPool,
        factory: TransactionFactory,
    }

    fn fixture_with_accounts(accounts: &[Address]) -> Fixture {
        let chain_config = test_chain_config();
        let chain = MemChain::new(
            chain_config.clone(),
            accounts.iter().map(|account| (*account, default_balance())).collect(),
        );
        let pool = TestPool::new();
        let engine = TestEngine::new(CTX);
        let (task_tx, task_rx) = mpsc::channel(8);
        let (adjust_tx, adjust_rx) = mpsc::channel(8);
        let (pending_logs, _) = tokio::sync::broadcast::channel(PENDING_LOGS_CHAN_SIZE);
        let shared = Arc::new(Shared {
            config: RwLock::new(WorkerConfig::default()),
            pending_tasks: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(None),
            running: AtomicBool::new(false),
            new_txs: AtomicU32::new(0),
            noempty: AtomicBool::new(false),
            recommit: AtomicU64::new(0),
            pending_logs,
            ctx: CTX,
        });
        let assembler = Assembler {
            chain: chain.clone(),
            pool: pool.clone(),
            engine,
            chain_config: chain_config.clone(),
            shared,
            current: None,
            local_uncles: HashMap::new(),
            remote_uncles: HashMap::new(),
            is_local_block: None,
            task_tx,
            resubmit_adjust_tx: adjust_tx,
            ctx: CTX,
        };
        Fixture {
            assembler,
            adjust_rx,
            task_rx,
            chain,
            pool,
            factory: TransactionFactory::new(chain_config.chain_id),
        }
    }

    fn prepared_env(fixture: &mut Fixture) -> Environment<MemState> {
        let params = GenerateParams { timestamp: now(), ..Default::default() };
        let mut env = fixture.assembler.prepare_work(&params).expect("prepare work");
        fixture.assembler.adjust_gas_limit(&mut env);
        env
    }

    fn interrupt_cell(signal: Interrupt) -> InterruptCell {
        Arc::new(AtomicI32::new(signal as i32))
    }

    #[tokio::test]
    async fn new_head_interrupt_abandons_the_batch() {
        let sender = account(0xaa);
        let mut fixture = fixture_with_accounts(&[sender]);
        fixture.pool.insert(vec![fixture.factory.transfer(sender, 0, 1)]);
        let mut env = prepared_env(&mut fixture);

        let cell = interrupt_cell(Interrupt::NewHead);
        let abandoned =
            fixture.assembler.fill_transactions(Some(&cell), &mut env).await;
        assert!(abandoned, "a new-head signal must abandon the work");
        assert_eq!(env.tcount, 0);
        // no feedback accompanies an abandoned round
        assert_matches!(fixture.adjust_rx.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }

    #[tokio::test]
    async fn resubmit_interrupt_reports_the_fill_ratio() {
        let sender = account(0xaa);
        let mut fixture = fixture_with_accounts(&[sender]);
        fixture.pool.insert(vec![fixture.factory.transfer(sender, 0, 1)]);
        let mut env = prepared_env(&mut fixture);

        // half the budget already spent when the signal lands
        let gas_limit = env.header.gas_limit[CTX];
        env.gas_pool = Some(GasPool::new(gas_limit / 2));

        let cell = interrupt_cell(Interrupt::Resubmit);
        let mut txs = BestTransactions::new(
            env.signer.clone(),
            fixture.pool.pending(true),
            env.header.base_fee[CTX],
        );
        let abandoned =
            fixture.assembler.commit_transactions(&mut env, &mut txs, Some(&cell)).await;
        assert!(!abandoned, "a resubmit hands the work over as-is");

        let adjust = fixture.adjust_rx.try_recv().expect("one feedback per round");
        assert!(adjust.inc);
        let expected = (gas_limit - gas_limit / 2) as f64 / gas_limit as f64;
        assert!((adjust.ratio - expected).abs() < 1e-9);
        // exactly one
        assert_matches!(fixture.adjust_rx.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }

    #[tokio::test]
    async fn resubmit_ratio_is_floored() {
        let mut fixture = fixture_with_accounts(&[]);
        let mut env = prepared_env(&mut fixture);
        let cell = interrupt_cell(Interrupt::Resubmit);
        let mut txs =
            BestTransactions::new(env.signer.clone(), HashMap::new(), env.header.base_fee[CTX]);
        fixture.assembler.commit_transactions(&mut env, &mut txs, Some(&cell)).await;
        let adjust = fixture.adjust_rx.try_recv().expect("feedback");
        assert!((adjust.ratio - 0.1).abs() < 1e-9, "empty pools clamp the ratio to 0.1");
    }

    #[tokio::test]
    async fn uninterrupted_rounds_relax_the_interval() {
        let sender = account(0xaa);
        let mut fixture = fixture_with_accounts(&[sender]);
        fixture.pool.insert(vec![fixture.factory.transfer(sender, 0, 1)]);
        let mut env = prepared_env(&mut fixture);

        let cell = interrupt_cell(Interrupt::None);
        let abandoned =
            fixture.assembler.fill_transactions(Some(&cell), &mut env).await;
        assert!(!abandoned);
        assert_eq!(env.tcount, 1);

        let adjust = fixture.adjust_rx.try_recv().expect("relax feedback");
        assert!(!adjust.inc);
        assert_matches!(fixture.adjust_rx.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }

    #[tokio::test]
    async fn accumulators_stay_aligned_through_failures() {
        let good = account(0xaa);
        let bad = account(0xbb);
        let mut fixture = fixture_with_accounts(&[good, bad]);
        fixture.chain.set_exec_override(bad, ExecutionError::Other("boom".into()));
        fixture.pool.insert(vec![
            fixture.factory.transfer(good, 0, 1),
            fixture.factory.transfer(good, 1, 1),
            fixture.factory.transfer(bad, 0, 9),
        ]);
        let mut env = prepared_env(&mut fixture);

        fixture.assembler.fill_transactions(None, &mut env).await;
        assert_eq!(env.tcount, 2);
        assert_eq!(env.txs.len(), env.receipts.len());
        assert_eq!(env.txs.len(), env.tcount);
        assert!(env.txs.iter().all(|tx| tx.from == good));
    }

    #[tokio::test]
    async fn protected_txs_wait_for_activation() {
        let sender = account(0xaa);
        let mut fixture = fixture_with_accounts(&[sender]);
        // replay protection activates far in the future
        fixture.assembler.chain_config.replay_block = Some(1_000_000);
        fixture.pool.insert(vec![fixture.factory.transfer(sender, 0, 1)]);
        let mut env = prepared_env(&mut fixture);
        // the environment signer predates activation as well
        env.signer = fixture.assembler.chain_config.signer_at(env.header.number[CTX]);

        fixture.assembler.fill_transactions(None, &mut env).await;
        assert_eq!(env.tcount, 0, "protected txs are held back before activation");
    }

    #[tokio::test]
    async fn prepare_work_rejects_stale_forced_timestamps() {
        let mut fixture = fixture_with_accounts(&[]);
        let params = GenerateParams { timestamp: 0, force_time: true, ..Default::default() };
        assert_matches!(
            fixture.assembler.prepare_work(&params),
            Err(WorkerError::InvalidTimestamp { parent: 1, given: 0 })
        );
        // without force the timestamp is clamped past the parent
        let params = GenerateParams { timestamp: 0, ..Default::default() };
        let env = fixture.assembler.prepare_work(&params).expect("clamped");
        assert_eq!(env.header.time, 2);
    }

    #[tokio::test]
    async fn prepare_work_requires_a_coinbase_while_running() {
        let mut fixture = fixture_with_accounts(&[]);
        fixture.assembler.shared.running.store(true, Ordering::Release);
        fixture.assembler.shared.config.write().coinbase = None;
        let params = GenerateParams { timestamp: now(), ..Default::default() };
        assert_matches!(
            fixture.assembler.prepare_work(&params),
            Err(WorkerError::MissingCoinbase)
        );
    }

    #[tokio::test]
    async fn prepare_work_recovers_pruned_state() {
        let mut fixture = fixture_with_accounts(&[]);
        let genesis = fixture.chain.genesis();
        fixture.chain.prune_state(genesis.state_root(CTX));
        let params = GenerateParams { timestamp: now(), ..Default::default() };
        let env = fixture.assembler.prepare_work(&params).expect("recovered via replay");
        assert_eq!(env.header.number[CTX], 1);
    }

    #[tokio::test]
    async fn prepare_work_installs_at_most_two_uncles() {
        let mut fixture = fixture_with_accounts(&[]);
        let genesis = fixture.chain.genesis();
        // advance the head so genesis children are uncles, not siblings
        fixture.chain.extend_canonical();
        for tag in 0..3 {
            let side = fixture.chain.make_side_block(&genesis, tag);
            fixture.assembler.remote_uncles.insert(side.hash(), side);
        }
        let params = GenerateParams { timestamp: now(), ..Default::default() };
        let env = fixture.assembler.prepare_work(&params).expect("prepare work");
        assert_eq!(env.uncles.len(), 2);

        // and the synchronous no-uncle path skips them entirely
        let params =
            GenerateParams { timestamp: now(), no_uncle: true, ..Default::default() };
        let env = fixture.assembler.prepare_work(&params).expect("prepare work");
        assert!(env.uncles.is_empty());
    }

    #[tokio::test]
    async fn gas_limit_adapts_from_the_parent() {
        let mut fixture = fixture_with_accounts(&[]);
        let env = prepared_env(&mut fixture);
        let parent_limit = fixture.chain.genesis().gas_limit(CTX);
        // empty parent usage shrinks the limit one bounded step
        assert_eq!(
            env.header.gas_limit[CTX],
            parent_limit - parent_limit / trellis_types::GAS_LIMIT_BOUND_DIVISOR
        );
    }

    #[tokio::test]
    async fn generate_work_returns_an_assembled_block() {
        let sender = account(0xaa);
        let mut fixture = fixture_with_accounts(&[sender]);
        fixture.pool.insert(vec![fixture.factory.transfer(sender, 0, 1)]);
        let params = GenerateParams { timestamp: now(), ..Default::default() };
        let block = fixture.assembler.generate_work(&params).await.expect("assembled");
        assert_eq!(block.number(CTX), 1);
        assert_eq!(block.transactions().len(), 1);
        assert!(U256::from(0) < block.base_fee(CTX));
    }
}
