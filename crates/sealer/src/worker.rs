//! The public worker: configuration, shared state, and the controller
//! surface wrapping the three background loops.

use crate::{
    assembler::AssemblerChannels, dispatcher::DispatcherChannels, environment::Snapshot,
    scheduler::SchedulerChannels, Assembler, Dispatcher, Scheduler, SealTask, WorkerError,
};
use alloy_primitives::{Address, Bytes, B256, U256};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::warn;
use trellis_types::{
    Block, ChainConfig, Engine, Header, HeaderChain, Log, Notifier, Receipt, State,
    TransactionPool,
};

/// Queue depth for sealed results coming back from the engine.
pub(crate) const RESULT_QUEUE_SIZE: usize = 10;

/// Queue depth for new-transaction announcements. Sized to the pool's burst
/// behaviour; pool implementations should allocate their broadcast channel
/// with this.
pub const TX_CHAN_SIZE: usize = 4096;

/// Queue depth for side-chain announcements.
pub const CHAIN_SIDE_CHAN_SIZE: usize = 10;

/// Queue depth for canonical head announcements.
pub const CHAIN_HEAD_CHAN_SIZE: usize = 10;

/// Queue depth for fill-ratio feedback.
pub(crate) const RESUBMIT_ADJUST_CHAN_SIZE: usize = 10;

/// Queue depth for the pending-logs feed.
pub(crate) const PENDING_LOGS_CHAN_SIZE: usize = 256;

/// Depth past which pending tasks and pooled uncles go stale; also the
/// ancestor lookback when seeding uncle-validity sets.
pub(crate) const STALE_THRESHOLD: u64 = 7;

/// Floor for the resubmit interval.
pub(crate) const MIN_RECOMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling for the resubmit interval.
pub(crate) const MAX_RECOMMIT_INTERVAL: Duration = Duration::from_secs(15);

/// Weight a single feedback carries in the interval blend.
pub(crate) const INTERVAL_ADJUST_RATIO: f64 = 0.1;

/// Bias (ns) keeping the interval bounds reachable under blending.
pub(crate) const INTERVAL_ADJUST_BIAS: f64 = 200_000_000.0;

/// Cadence of the stale-uncle sweep.
pub(crate) const UNCLE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Worker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Fee recipient for sealed blocks. Required while the worker runs.
    pub coinbase: Option<Address>,
    /// Opaque bytes placed in the header's local extra slot.
    pub extra: Bytes,
    /// Target gas floor for sealed blocks.
    pub gas_floor: u64,
    /// Target gas ceiling for sealed blocks.
    pub gas_ceil: u64,
    /// Minimum tip enforced by the surrounding node's pool; carried here so
    /// the node has one place to configure sealing.
    pub gas_price: U256,
    /// Initial resubmit interval, clamped to at least one second.
    pub recommit: Duration,
    /// Forwarded to the engine by the node: skip remote solution
    /// verification.
    pub noverify: bool,
    /// Forwarded to the engine by the node: endpoints notified of new work.
    pub notify: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coinbase: None,
            extra: Bytes::new(),
            gas_floor: 8_000_000,
            gas_ceil: 30_000_000,
            gas_price: U256::from(1_000_000_000u64),
            recommit: Duration::from_secs(3),
            noverify: false,
            notify: Vec::new(),
        }
    }
}

/// Interrupt signals observed by an in-flight packing loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Interrupt {
    /// Keep going.
    None = 0,
    /// A new head supersedes the round; discard the work.
    NewHead = 1,
    /// A resubmission wants the work handed over as-is.
    Resubmit = 2,
}

impl Interrupt {
    /// Decode a raw cell value; unknown values read as [`Interrupt::None`].
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::NewHead,
            2 => Self::Resubmit,
            _ => Self::None,
        }
    }
}

/// Shared interrupt cell between the scheduler and one assembly round.
pub(crate) type InterruptCell = Arc<AtomicI32>;

/// Predicate classifying side blocks as locally mined.
pub type IsLocalBlock = Arc<dyn Fn(&Header) -> bool + Send + Sync>;

/// A request for a new asynchronous sealing round.
#[derive(Debug)]
pub(crate) struct NewWorkRequest {
    pub(crate) interrupt: InterruptCell,
    pub(crate) noempty: bool,
    pub(crate) timestamp: u64,
}

/// Parameters of a synchronous block generation.
#[derive(Clone, Debug, Default)]
pub struct GenerateParams {
    /// Timestamp for the sealing task.
    pub timestamp: u64,
    /// Fail instead of clamping when the timestamp does not advance.
    pub force_time: bool,
    /// Build on this parent instead of the canonical head.
    pub parent_hash: Option<B256>,
    /// Fee recipient override.
    pub coinbase: Option<Address>,
    /// Caller-supplied randomness, placed in the header.
    pub random: B256,
    /// Skip uncle installation.
    pub no_uncle: bool,
    /// Skip the extra-data install.
    pub no_extra: bool,
}

/// A synchronous request served by the main loop.
pub(crate) enum GetWorkRequest {
    /// Assemble a full block from the given parameters.
    Block {
        params: GenerateParams,
        reply: oneshot::Sender<Result<Block, WorkerError>>,
    },
    /// Prepare an empty header on the current head.
    PendingHeader {
        parent_number: u64,
        reply: oneshot::Sender<Result<Header, WorkerError>>,
    },
}

impl fmt::Debug for GetWorkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block { params, .. } => f.debug_struct("Block").field("params", params).finish(),
            Self::PendingHeader { parent_number, .. } => {
                f.debug_struct("PendingHeader").field("parent_number", parent_number).finish()
            }
        }
    }
}

/// A resubmit-interval adjustment fed back by the assembler.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IntervalAdjust {
    /// Observed fill ratio, meaningful when increasing.
    pub(crate) ratio: f64,
    /// Increase (round was cut short) or relax (round completed).
    pub(crate) inc: bool,
}

/// State shared between the controller and the background loops.
pub(crate) struct Shared<S> {
    /// Mutable worker configuration.
    pub(crate) config: RwLock<WorkerConfig>,
    /// Candidate blocks awaiting a seal, by seal-hash.
    pub(crate) pending_tasks: Mutex<HashMap<B256, SealTask<S>>>,
    /// The published pending-block view.
    pub(crate) snapshot: RwLock<Option<Snapshot<S>>>,
    /// Whether the consensus engine is running.
    pub(crate) running: AtomicBool,
    /// Transactions that arrived since the last work submission.
    pub(crate) new_txs: AtomicU32,
    /// When set, empty rounds are never committed.
    pub(crate) noempty: AtomicBool,
    /// Mirror of the scheduler's current interval, in nanoseconds.
    pub(crate) recommit: AtomicU64,
    /// Logs executed into the pending block while not sealing.
    pub(crate) pending_logs: broadcast::Sender<Vec<Log>>,
    /// Local context slot in per-context header arrays.
    pub(crate) ctx: usize,
}

impl<S> Shared<S> {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn preseal_disabled(&self) -> bool {
        self.noempty.load(Ordering::Acquire)
    }

    pub(crate) fn set_recommit(&self, interval: Duration) {
        self.recommit.store(interval.as_nanos() as u64, Ordering::Release);
    }

    /// Drop pending tasks more than [`STALE_THRESHOLD`] blocks behind
    /// `number`.
    pub(crate) fn clear_stale_tasks(&self, number: u64) {
        let mut pending = self.pending_tasks.lock();
        pending.retain(|_, task| task.block.number(self.ctx) + STALE_THRESHOLD > number);
    }
}

/// The block-sealing worker.
///
/// Construction spawns the three background loops; [`Worker::close`] tears
/// them down. All other methods are non-blocking except the synchronous
/// request paths, which round-trip through the main loop.
pub struct Worker<BT: HeaderChain> {
    shared: Arc<Shared<BT::State>>,
    shutdown: Notifier,
    start_tx: mpsc::Sender<()>,
    get_work_tx: mpsc::Sender<GetWorkRequest>,
    resubmit_interval_tx: mpsc::Sender<Duration>,
    /// Receiver for sealed solutions; taken once by the surrounding node.
    seal_results: Mutex<Option<mpsc::Receiver<Block>>>,
    handles: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl<BT: HeaderChain> Worker<BT> {
    /// Spawn a worker over its collaborators.
    ///
    /// With `init` set, a first round is requested immediately so the pending
    /// state exists before the node starts serving reads.
    pub fn new<Pool, CE>(
        config: WorkerConfig,
        chain_config: ChainConfig,
        engine: CE,
        chain: BT,
        pool: Pool,
        is_local_block: Option<IsLocalBlock>,
        init: bool,
    ) -> Self
    where
        Pool: TransactionPool,
        CE: Engine,
    {
        let ctx = chain_config.context;
        let mut recommit = config.recommit;
        if recommit < MIN_RECOMMIT_INTERVAL {
            warn!(
                target: "sealer::worker",
                provided = ?recommit,
                updated = ?MIN_RECOMMIT_INTERVAL,
                "sanitizing recommit interval",
            );
            recommit = MIN_RECOMMIT_INTERVAL;
        }

        let (new_work_tx, new_work_rx) = mpsc::channel(1);
        let (get_work_tx, get_work_rx) = mpsc::channel(1);
        let (task_tx, task_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(RESULT_QUEUE_SIZE);
        let (start_tx, start_rx) = mpsc::channel(1);
        let (resubmit_interval_tx, resubmit_interval_rx) = mpsc::channel(1);
        let (resubmit_adjust_tx, resubmit_adjust_rx) = mpsc::channel(RESUBMIT_ADJUST_CHAN_SIZE);
        let (pending_logs, _) = broadcast::channel(PENDING_LOGS_CHAN_SIZE);

        let chain_head_rx = chain.subscribe_chain_head();
        let chain_side_rx = chain.subscribe_chain_side();
        let txs_rx = pool.subscribe_new_txs();

        let shared = Arc::new(Shared {
            config: RwLock::new(config),
            pending_tasks: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(None),
            running: AtomicBool::new(false),
            new_txs: AtomicU32::new(0),
            noempty: AtomicBool::new(false),
            recommit: AtomicU64::new(recommit.as_nanos() as u64),
            pending_logs,
            ctx,
        });
        let shutdown = Notifier::new();

        let assembler = Assembler {
            chain: chain.clone(),
            pool,
            engine: engine.clone(),
            chain_config: chain_config.clone(),
            shared: shared.clone(),
            current: None,
            local_uncles: HashMap::new(),
            remote_uncles: HashMap::new(),
            is_local_block,
            task_tx,
            resubmit_adjust_tx,
            ctx,
        };
        let scheduler = Scheduler {
            chain,
            chain_config,
            shared: shared.clone(),
            new_work_tx,
        };
        let dispatcher = Dispatcher { engine, shared: shared.clone(), result_tx };

        let handles = vec![
            tokio::spawn(assembler.run(AssemblerChannels {
                new_work: new_work_rx,
                get_work: get_work_rx,
                chain_side: chain_side_rx,
                txs: txs_rx,
                shutdown: shutdown.subscribe(),
            })),
            tokio::spawn(scheduler.run(
                SchedulerChannels {
                    start: start_rx,
                    chain_head: chain_head_rx,
                    interval: resubmit_interval_rx,
                    adjust: resubmit_adjust_rx,
                    shutdown: shutdown.subscribe(),
                },
                recommit,
            )),
            tokio::spawn(dispatcher.run(DispatcherChannels {
                tasks: task_rx,
                shutdown: shutdown.subscribe(),
            })),
        ];

        let worker = Self {
            shared,
            shutdown,
            start_tx,
            get_work_tx,
            resubmit_interval_tx,
            seal_results: Mutex::new(Some(result_rx)),
            handles: Mutex::new(Some(handles)),
        };
        if init {
            // submit first work to initialize the pending state
            let _ = worker.start_tx.try_send(());
        }
        worker
    }

    /// Set the fee recipient for future blocks.
    pub fn set_coinbase(&self, coinbase: Address) {
        self.shared.config.write().coinbase = Some(coinbase);
    }

    /// Set the extra bytes stamped into future headers.
    pub fn set_extra(&self, extra: Bytes) {
        self.shared.config.write().extra = extra;
    }

    /// Set the gas ceiling for future blocks.
    pub fn set_gas_ceil(&self, ceil: u64) {
        self.shared.config.write().gas_ceil = ceil;
    }

    /// Override the resubmit interval. Values below one second are clamped.
    pub async fn set_recommit_interval(&self, interval: Duration) {
        let _ = self.resubmit_interval_tx.send(interval).await;
    }

    /// The scheduler's current resubmit interval.
    pub fn recommit_interval(&self) -> Duration {
        Duration::from_nanos(self.shared.recommit.load(Ordering::Acquire))
    }

    /// Mark the worker running and request a first round.
    pub async fn start(&self) {
        self.shared.running.store(true, Ordering::Release);
        let _ = self.start_tx.send(()).await;
    }

    /// Mark the worker stopped. In-flight rounds finish but produce no tasks.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Whether the worker is sealing.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Never commit empty rounds.
    pub fn disable_preseal(&self) {
        self.shared.noempty.store(true, Ordering::Release);
    }

    /// Allow empty rounds again (the default).
    pub fn enable_preseal(&self) {
        self.shared.noempty.store(false, Ordering::Release);
    }

    /// Stop the worker and wait for all background loops to unwind. The
    /// worker cannot be restarted afterwards.
    pub async fn close(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shutdown.notify();
        let handles = self.handles.lock().take();
        if let Some(handles) = handles {
            join_all(handles).await;
        }
    }

    /// The pending block and an independent copy of its state.
    pub fn pending(&self) -> Option<(Block, BT::State)> {
        let snapshot = self.shared.snapshot.read();
        snapshot.as_ref().map(|snap| (snap.block.clone(), snap.state.copy()))
    }

    /// The pending block.
    pub fn pending_block(&self) -> Option<Block> {
        self.shared.snapshot.read().as_ref().map(|snap| snap.block.clone())
    }

    /// The pending block and its receipts.
    pub fn pending_block_and_receipts(&self) -> Option<(Block, Vec<Receipt>)> {
        self.shared
            .snapshot
            .read()
            .as_ref()
            .map(|snap| (snap.block.clone(), snap.receipts.clone()))
    }

    /// Subscribe to logs executed into the pending block while the worker is
    /// not sealing.
    pub fn subscribe_pending_logs(&self) -> broadcast::Receiver<Vec<Log>> {
        self.shared.pending_logs.subscribe()
    }

    /// Number of candidate blocks currently awaiting a seal.
    pub fn pending_task_count(&self) -> usize {
        self.shared.pending_tasks.lock().len()
    }

    /// Take the receiver of sealed solutions. Returns `None` after the first
    /// call.
    pub fn seal_results(&self) -> Option<mpsc::Receiver<Block>> {
        self.seal_results.lock().take()
    }

    /// Synchronously assemble a sealing block on `parent` with a forced
    /// timestamp. Uncles and extra data are left out.
    pub async fn get_sealing_block(
        &self,
        parent: B256,
        timestamp: u64,
        coinbase: Address,
        random: B256,
    ) -> Result<Block, WorkerError> {
        let (reply, response) = oneshot::channel();
        let request = GetWorkRequest::Block {
            params: GenerateParams {
                timestamp,
                force_time: true,
                parent_hash: Some(parent),
                coinbase: Some(coinbase),
                random,
                no_uncle: true,
                no_extra: true,
            },
            reply,
        };
        self.get_work_tx.send(request).await.map_err(|_| WorkerError::Closed)?;
        response.await.map_err(|_| WorkerError::Closed)?
    }

    /// Synchronously prepare an empty header on the current head. Requires a
    /// configured coinbase while running.
    pub async fn generate_pending_header(&self, parent: &Header) -> Result<Header, WorkerError> {
        let (reply, response) = oneshot::channel();
        let request = GetWorkRequest::PendingHeader {
            parent_number: parent.number[self.shared.ctx],
            reply,
        };
        self.get_work_tx.send(request).await.map_err(|_| WorkerError::Closed)?;
        response.await.map_err(|_| WorkerError::Closed)?
    }
}

impl<BT: HeaderChain> fmt::Debug for Worker<BT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("running", &self.is_running())
            .field("recommit", &self.recommit_interval())
            .finish_non_exhaustive()
    }
}
