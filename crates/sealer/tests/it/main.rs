//! Integration tests driving a full worker against in-memory collaborators.

use std::time::Duration;
use tokio::sync::broadcast;
pub(crate) use trellis_sealer::test_utils::{
    account, default_balance, test_chain_config, MemChain, TestEngine, TestPool,
    TransactionFactory,
};
use trellis_sealer::{Worker, WorkerConfig};
use trellis_types::{Address, Block, ChainConfig};

mod requests;
mod sealing;
mod transactions;

pub(crate) const CTX: usize = 2;

pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The collaborators behind one worker under test.
pub(crate) struct Harness {
    pub(crate) chain: MemChain,
    pub(crate) pool: TestPool,
    pub(crate) engine: TestEngine,
    pub(crate) factory: TransactionFactory,
    pub(crate) chain_config: ChainConfig,
}

pub(crate) fn harness(funded: &[Address]) -> Harness {
    harness_with_config(funded, test_chain_config())
}

pub(crate) fn harness_with_config(funded: &[Address], chain_config: ChainConfig) -> Harness {
    init_test_tracing();
    let chain = MemChain::new(
        chain_config.clone(),
        funded.iter().map(|address| (*address, default_balance())).collect(),
    );
    Harness {
        chain,
        pool: TestPool::new(),
        engine: TestEngine::new(chain_config.context),
        factory: TransactionFactory::new(chain_config.chain_id),
        chain_config,
    }
}

pub(crate) fn worker_config() -> WorkerConfig {
    WorkerConfig {
        coinbase: Some(account(0xcb)),
        recommit: Duration::from_secs(1),
        ..Default::default()
    }
}

pub(crate) fn spawn_worker(harness: &Harness, config: WorkerConfig, init: bool) -> Worker<MemChain> {
    Worker::new(
        config,
        harness.chain_config.clone(),
        harness.engine.clone(),
        harness.chain.clone(),
        harness.pool.clone(),
        None,
        init,
    )
}

/// Wait for the next block handed to the engine.
pub(crate) async fn next_task(tasks: &mut broadcast::Receiver<Block>) -> Block {
    tokio::time::timeout(Duration::from_secs(5), tasks.recv())
        .await
        .expect("sealing task within the timeout")
        .expect("engine feed open")
}

/// Wait for the first task satisfying `pred`.
pub(crate) async fn next_task_matching(
    tasks: &mut broadcast::Receiver<Block>,
    pred: impl Fn(&Block) -> bool,
) -> Block {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let block = tasks.recv().await.expect("engine feed open");
            if pred(&block) {
                return block;
            }
        }
    })
    .await
    .expect("matching sealing task within the timeout")
}

/// Poll `probe` until it returns true.
pub(crate) async fn wait_until(probe: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !probe() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition within the timeout")
}
