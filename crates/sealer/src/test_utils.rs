//! In-memory collaborators for driving the worker in tests.

use crate::worker::{CHAIN_HEAD_CHAN_SIZE, CHAIN_SIDE_CHAN_SIZE, TX_CHAN_SIZE};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use parking_lot::RwLock;
use std::{
    cmp::Ordering as CmpOrdering,
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};
use trellis_types::{
    error::{EngineError, ExecutionError, StateError},
    proofs, Block, ChainConfig, ChainHeadEvent, ChainSideEvent, Engine, GasPool, Header,
    HeaderChain, Log, NewTxsEvent, Noticer, Receipt, State, Transaction, TransactionPool, TX_GAS,
};

/// A single account in the mock state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    /// Next expected nonce.
    pub nonce: u64,
    /// Spendable balance.
    pub balance: U256,
}

/// Observes a [`MemState`]'s prefetcher flag across moves and drops.
#[derive(Clone, Debug)]
pub struct PrefetchProbe(Arc<AtomicBool>);

impl PrefetchProbe {
    /// Whether the observed state's prefetcher is running.
    pub fn prefetching(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// An in-memory working state with full-copy snapshots.
#[derive(Debug, Default)]
pub struct MemState {
    accounts: HashMap<Address, Account>,
    snapshots: Vec<HashMap<Address, Account>>,
    prefetching: Arc<AtomicBool>,
    prepared: Option<(B256, usize)>,
}

impl MemState {
    /// A state holding the given balances at nonce zero.
    pub fn with_accounts(accounts: impl IntoIterator<Item = (Address, U256)>) -> Self {
        let accounts = accounts
            .into_iter()
            .map(|(address, balance)| (address, Account { nonce: 0, balance }))
            .collect();
        Self { accounts, ..Default::default() }
    }

    /// The account stored for `address`, or an empty one.
    pub fn account(&self, address: &Address) -> Account {
        self.accounts.get(address).cloned().unwrap_or_default()
    }

    /// Overwrite an account.
    pub fn set_account(&mut self, address: Address, nonce: u64, balance: U256) {
        self.accounts.insert(address, Account { nonce, balance });
    }

    /// Deterministic digest over the account set.
    pub fn root(&self) -> B256 {
        let mut entries: Vec<_> = self.accounts.iter().collect();
        entries.sort_by_key(|(address, _)| **address);
        let mut buf = Vec::with_capacity(entries.len() * 60);
        for (address, account) in entries {
            buf.extend_from_slice(address.as_slice());
            buf.extend_from_slice(&account.nonce.to_be_bytes());
            buf.extend_from_slice(&account.balance.to_be_bytes::<32>());
        }
        keccak256(&buf)
    }

    /// A handle observing this state's prefetcher flag.
    pub fn probe(&self) -> PrefetchProbe {
        PrefetchProbe(self.prefetching.clone())
    }

    /// The transaction most recently announced via [`State::prepare`].
    pub fn last_prepared(&self) -> Option<(B256, usize)> {
        self.prepared
    }
}

impl State for MemState {
    fn snapshot(&mut self) -> usize {
        self.snapshots.push(self.accounts.clone());
        self.snapshots.len() - 1
    }

    fn revert_to_snapshot(&mut self, id: usize) {
        if let Some(snapshot) = self.snapshots.get(id).cloned() {
            self.accounts = snapshot;
            self.snapshots.truncate(id);
        }
    }

    fn copy(&self) -> Self {
        Self {
            accounts: self.accounts.clone(),
            snapshots: Vec::new(),
            prefetching: Arc::new(AtomicBool::new(false)),
            prepared: None,
        }
    }

    fn prepare(&mut self, tx_hash: B256, index: usize) {
        self.prepared = Some((tx_hash, index));
    }

    fn start_prefetcher(&mut self, _tag: &'static str) {
        self.prefetching.store(true, Ordering::Release);
    }

    fn stop_prefetcher(&mut self) {
        self.prefetching.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct ChainInner {
    config: ChainConfig,
    base_fee: U256,
    blocks: RwLock<HashMap<B256, Block>>,
    canonical: RwLock<Vec<B256>>,
    /// States by state root.
    states: RwLock<HashMap<B256, MemState>>,
    /// States by block hash, for the bounded-replay recovery path.
    block_states: RwLock<HashMap<B256, MemState>>,
    /// Forced execution outcomes by sender, for driving error paths.
    exec_overrides: RwLock<HashMap<Address, ExecutionError>>,
    head_feed: broadcast::Sender<ChainHeadEvent>,
    side_feed: broadcast::Sender<ChainSideEvent>,
}

/// An in-memory header chain with a trivial transfer-executing processor.
#[derive(Clone, Debug)]
pub struct MemChain {
    inner: Arc<ChainInner>,
}

impl MemChain {
    /// Genesis gas limit.
    pub const GENESIS_GAS_LIMIT: u64 = 30_000_000;

    /// Build a chain whose genesis funds the given accounts.
    pub fn new(config: ChainConfig, genesis_accounts: Vec<(Address, U256)>) -> Self {
        let ctx = config.context;
        let base_fee = U256::from(1_000_000_000u64);
        let state = MemState::with_accounts(genesis_accounts);
        let root = state.root();

        let mut header = Header::default();
        header.number[ctx] = 0;
        header.time = 1;
        header.gas_limit[ctx] = Self::GENESIS_GAS_LIMIT;
        header.base_fee[ctx] = base_fee;
        header.state_root[ctx] = root;
        let genesis = Block::new(header, Vec::new(), Vec::new(), &[], ctx);

        let (head_feed, _) = broadcast::channel(CHAIN_HEAD_CHAN_SIZE);
        let (side_feed, _) = broadcast::channel(CHAIN_SIDE_CHAN_SIZE);
        let inner = ChainInner {
            config,
            base_fee,
            blocks: RwLock::new(HashMap::from([(genesis.hash(), genesis.clone())])),
            canonical: RwLock::new(vec![genesis.hash()]),
            states: RwLock::new(HashMap::from([(root, state.copy())])),
            block_states: RwLock::new(HashMap::from([(genesis.hash(), state)])),
            exec_overrides: RwLock::new(HashMap::new()),
            head_feed,
            side_feed,
        };
        Self { inner: Arc::new(inner) }
    }

    fn ctx(&self) -> usize {
        self.inner.config.context
    }

    /// The genesis block.
    pub fn genesis(&self) -> Block {
        let canonical = self.inner.canonical.read();
        self.inner.blocks.read()[&canonical[0]].clone()
    }

    /// Append an empty canonical block on the current head and announce it.
    pub fn extend_canonical(&self) -> Block {
        let ctx = self.ctx();
        let head = self.current_block().expect("chain initialised");
        let mut header = Header::default();
        header.parent_hash[ctx] = head.hash();
        header.number[ctx] = head.number(ctx) + 1;
        header.time = head.time() + 1;
        header.gas_limit[ctx] = head.gas_limit(ctx);
        header.base_fee[ctx] = self.inner.base_fee;
        header.state_root[ctx] = head.state_root(ctx);
        let block = Block::new(header, Vec::new(), Vec::new(), &[], ctx);

        let state = self
            .inner
            .states
            .read()
            .get(&head.state_root(ctx))
            .map(|state| state.copy())
            .unwrap_or_default();
        self.inner.blocks.write().insert(block.hash(), block.clone());
        self.inner.canonical.write().push(block.hash());
        self.inner.block_states.write().insert(block.hash(), state);
        let _ = self.inner.head_feed.send(ChainHeadEvent { block: block.clone() });
        block
    }

    /// Build (and register) a side-chain child of `parent`, distinguished by
    /// `tag`.
    pub fn make_side_block(&self, parent: &Block, tag: u8) -> Block {
        let ctx = self.ctx();
        let mut header = Header::default();
        header.parent_hash[ctx] = parent.hash();
        header.number[ctx] = parent.number(ctx) + 1;
        header.time = parent.time() + 1;
        header.gas_limit[ctx] = parent.gas_limit(ctx);
        header.base_fee[ctx] = self.inner.base_fee;
        header.state_root[ctx] = parent.state_root(ctx);
        header.extra[ctx] = Bytes::from(vec![tag]);
        let block = Block::new(header, Vec::new(), Vec::new(), &[], ctx);
        self.inner.blocks.write().insert(block.hash(), block.clone());
        block
    }

    /// Announce a block on the side-chain feed.
    pub fn announce_side(&self, block: &Block) {
        let _ = self.inner.side_feed.send(ChainSideEvent { block: block.clone() });
    }

    /// Forget the state behind `root`, forcing the bounded-replay recovery.
    pub fn prune_state(&self, root: B256) {
        self.inner.states.write().remove(&root);
    }

    /// Overwrite an account in every stored state.
    pub fn set_account(&self, address: Address, nonce: u64, balance: U256) {
        for state in self.inner.states.write().values_mut() {
            state.set_account(address, nonce, balance);
        }
        for state in self.inner.block_states.write().values_mut() {
            state.set_account(address, nonce, balance);
        }
    }

    /// Force every execution from `sender` to fail with `error`.
    pub fn set_exec_override(&self, sender: Address, error: ExecutionError) {
        self.inner.exec_overrides.write().insert(sender, error);
    }
}

impl HeaderChain for MemChain {
    type State = MemState;

    fn current_block(&self) -> Option<Block> {
        let canonical = self.inner.canonical.read();
        let head = canonical.last()?;
        self.inner.blocks.read().get(head).cloned()
    }

    fn block_by_hash(&self, hash: &B256) -> Option<Block> {
        self.inner.blocks.read().get(hash).cloned()
    }

    fn blocks_from_hash(&self, hash: B256, count: usize) -> Vec<Block> {
        let ctx = self.ctx();
        let blocks = self.inner.blocks.read();
        let mut out = Vec::with_capacity(count);
        let mut cursor = hash;
        while out.len() < count {
            let Some(block) = blocks.get(&cursor) else { break };
            cursor = block.parent_hash(ctx);
            out.push(block.clone());
        }
        out
    }

    fn uncles_in_chain(&self, from: Block, depth: u64) -> Vec<Header> {
        let mut uncles = Vec::new();
        for block in self.blocks_from_hash(from.hash(), depth as usize) {
            uncles.extend(block.uncles().iter().cloned());
        }
        uncles
    }

    fn calc_base_fee(&self, _parent: &Header) -> U256 {
        self.inner.base_fee
    }

    fn state_at(&self, root: B256) -> Result<Self::State, StateError> {
        self.inner
            .states
            .read()
            .get(&root)
            .map(|state| state.copy())
            .ok_or(StateError::Unavailable(root))
    }

    fn state_at_block(&self, block: &Block, _max_reexec: u64) -> Result<Self::State, StateError> {
        self.inner
            .block_states
            .read()
            .get(&block.hash())
            .map(|state| state.copy())
            .ok_or_else(|| StateError::Unavailable(block.state_root(self.ctx())))
    }

    fn apply_transaction(
        &self,
        state: &mut Self::State,
        header: &Header,
        coinbase: &Address,
        gas_pool: &mut GasPool,
        gas_used: &mut u64,
        tx: &Transaction,
    ) -> Result<Receipt, ExecutionError> {
        let ctx = self.ctx();
        if let Some(error) = self.inner.exec_overrides.read().get(&tx.from) {
            return Err(error.clone());
        }
        let sender = self
            .inner
            .config
            .signer_at(header.number[ctx])
            .sender(tx)
            .map_err(|err| ExecutionError::Other(err.to_string()))?;

        let nonce = state.account(&sender).nonce;
        match tx.nonce.cmp(&nonce) {
            CmpOrdering::Less => return Err(ExecutionError::NonceTooLow),
            CmpOrdering::Greater => return Err(ExecutionError::NonceTooHigh),
            CmpOrdering::Equal => {}
        }

        let gas = TX_GAS + tx.input.len() as u64 * 16;
        let base_fee = header.base_fee[ctx];
        let tip = tx
            .effective_gas_tip(&base_fee)
            .ok_or_else(|| ExecutionError::Other("fee cap below base fee".into()))?;
        let price = base_fee + tip;
        let cost = tx.value + price * U256::from(gas);
        if state.account(&sender).balance < cost {
            return Err(ExecutionError::Other("insufficient funds".into()));
        }
        gas_pool.sub_gas(tx.gas_limit)?;

        let account = state.accounts.entry(sender).or_default();
        account.balance -= cost;
        account.nonce += 1;
        if let Some(to) = tx.to {
            state.accounts.entry(to).or_default().balance += tx.value;
        }
        state.accounts.entry(*coinbase).or_default().balance += tip * U256::from(gas);
        gas_pool.add_gas(tx.gas_limit - gas);
        *gas_used += gas;

        let logs = vec![Log { address: sender, topics: vec![tx.hash()], data: Bytes::new() }];
        let bloom = proofs::logs_bloom(logs.iter());
        Ok(Receipt {
            tx_hash: tx.hash(),
            success: true,
            gas_used: gas,
            cumulative_gas_used: *gas_used,
            logs,
            bloom,
        })
    }

    fn subscribe_chain_head(&self) -> broadcast::Receiver<ChainHeadEvent> {
        self.inner.head_feed.subscribe()
    }

    fn subscribe_chain_side(&self) -> broadcast::Receiver<ChainSideEvent> {
        self.inner.side_feed.subscribe()
    }
}

#[derive(Debug)]
struct EngineInner {
    ctx: usize,
    difficulty: U256,
    seal_delay: Duration,
    submitted: broadcast::Sender<Block>,
}

/// An engine that seals after a short delay and records submitted work.
#[derive(Clone, Debug)]
pub struct TestEngine {
    inner: Arc<EngineInner>,
}

impl TestEngine {
    /// An engine writing into the given context slot.
    pub fn new(ctx: usize) -> Self {
        let (submitted, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(EngineInner {
                ctx,
                difficulty: U256::from(131_072u64),
                seal_delay: Duration::from_millis(5),
                submitted,
            }),
        }
    }

    /// Subscribe to every block handed to [`Engine::seal`].
    pub fn subscribe_tasks(&self) -> broadcast::Receiver<Block> {
        self.inner.submitted.subscribe()
    }
}

impl Engine for TestEngine {
    fn prepare<C: HeaderChain>(&self, _chain: &C, header: &mut Header) -> Result<(), EngineError> {
        header.difficulty[self.inner.ctx] = self.inner.difficulty;
        header.network_difficulty[self.inner.ctx] = self.inner.difficulty;
        Ok(())
    }

    fn finalize_and_assemble<C: HeaderChain, S: State>(
        &self,
        _chain: &C,
        header: Header,
        _state: &mut S,
        transactions: &[Arc<Transaction>],
        uncles: Vec<Header>,
        receipts: &[Receipt],
    ) -> Result<Block, EngineError> {
        Ok(Block::new(header, transactions.to_vec(), uncles, receipts, self.inner.ctx))
    }

    fn seal_hash(&self, header: &Header) -> B256 {
        let mut sealless = header.clone();
        sealless.nonce = 0;
        sealless.mix_hash = B256::ZERO;
        sealless.hash()
    }

    fn seal(
        &self,
        block: Block,
        results: mpsc::Sender<Block>,
        mut stop: Noticer,
    ) -> Result<(), EngineError> {
        let _ = self.inner.submitted.send(block.clone());
        let delay = self.inner.seal_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = results.send(block).await;
                }
                _ = stop.recv() => {}
            }
        });
        Ok(())
    }
}

#[derive(Debug)]
struct PoolInner {
    pending: RwLock<HashMap<Address, Vec<Arc<Transaction>>>>,
    locals: RwLock<HashSet<Address>>,
    feed: broadcast::Sender<NewTxsEvent>,
}

/// An in-memory transaction pool.
#[derive(Clone, Debug)]
pub struct TestPool {
    inner: Arc<PoolInner>,
}

impl TestPool {
    /// An empty pool.
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(TX_CHAN_SIZE);
        Self {
            inner: Arc::new(PoolInner {
                pending: RwLock::new(HashMap::new()),
                locals: RwLock::new(HashSet::new()),
                feed,
            }),
        }
    }

    /// Mark a sender as local.
    pub fn add_local(&self, sender: Address) {
        self.inner.locals.write().insert(sender);
    }

    /// Add transactions to the pending set without announcing them.
    pub fn insert(&self, txs: Vec<Arc<Transaction>>) {
        let mut pending = self.inner.pending.write();
        for tx in txs {
            let bucket = pending.entry(tx.from).or_default();
            bucket.push(tx);
            bucket.sort_by_key(|tx| tx.nonce);
        }
    }

    /// Add transactions to the pending set and announce them.
    pub fn inject(&self, txs: Vec<Arc<Transaction>>) {
        self.insert(txs.clone());
        let _ = self.inner.feed.send(NewTxsEvent { txs });
    }
}

impl Default for TestPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionPool for TestPool {
    fn pending(&self, _enforce_tips: bool) -> HashMap<Address, Vec<Arc<Transaction>>> {
        self.inner.pending.read().clone()
    }

    fn locals(&self) -> Vec<Address> {
        self.inner.locals.read().iter().copied().collect()
    }

    fn subscribe_new_txs(&self) -> broadcast::Receiver<NewTxsEvent> {
        self.inner.feed.subscribe()
    }
}

/// Builds transfer transactions with sensible defaults.
#[derive(Clone, Debug)]
pub struct TransactionFactory {
    chain_id: Option<u64>,
    base_fee: U256,
}

impl TransactionFactory {
    /// A factory signing for `chain_id` over a 1 gwei base fee.
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id: Some(chain_id), base_fee: U256::from(1_000_000_000u64) }
    }

    /// A factory producing unprotected (no chain id) transactions.
    pub fn unprotected(mut self) -> Self {
        self.chain_id = None;
        self
    }

    /// A basic transfer from `from` at `nonce` tipping `tip_gwei`.
    pub fn transfer(&self, from: Address, nonce: u64, tip_gwei: u64) -> Arc<Transaction> {
        self.transfer_with_gas(from, nonce, tip_gwei, TX_GAS)
    }

    /// A transfer with an explicit gas limit, for exercising gas accounting.
    pub fn transfer_with_gas(
        &self,
        from: Address,
        nonce: u64,
        tip_gwei: u64,
        gas_limit: u64,
    ) -> Arc<Transaction> {
        let tip = U256::from(tip_gwei) * U256::from(1_000_000_000u64);
        Arc::new(Transaction {
            chain_id: self.chain_id,
            nonce,
            gas_limit,
            fee_cap: self.base_fee + tip,
            tip,
            to: Some(Address::repeat_byte(0xfe)),
            value: U256::from(1_000u64),
            input: Bytes::new(),
            from,
        })
    }
}

/// A deterministic test account address.
pub fn account(index: u8) -> Address {
    Address::repeat_byte(index)
}

/// A comfortable genesis balance.
pub fn default_balance() -> U256 {
    U256::from(1_000_000_000_000_000_000u64)
}

/// The chain configuration used across the worker tests.
pub fn test_chain_config() -> ChainConfig {
    ChainConfig {
        chain_id: 1337,
        context: 2,
        location: Bytes::from_static(&[0, 2]),
        replay_block: Some(0),
        poa: None,
    }
}
