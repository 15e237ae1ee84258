//! End-to-end sealing rounds: start, head changes, uncles, pruning,
//! lifecycle.

use crate::{
    account, harness, harness_with_config, next_task, next_task_matching, spawn_worker,
    test_chain_config, wait_until, worker_config, CTX,
};
use assert_matches::assert_matches;
use std::time::Duration;
use trellis_sealer::WorkerError;
use trellis_types::{ChainConfig, PoaConfig, B256};

#[tokio::test]
async fn empty_round_produces_an_empty_block() {
    let harness = harness(&[]);
    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);

    worker.start().await;
    let task = next_task(&mut tasks).await;

    assert_eq!(task.number(CTX), 1);
    assert_eq!(task.parent_hash(CTX), harness.chain.genesis().hash());
    assert!(task.transactions().is_empty());
    assert!(task.uncles().is_empty());
    assert_eq!(task.header().coinbase[CTX], account(0xcb));

    // the pending snapshot was published alongside
    let (pending, _state) = worker.pending().expect("snapshot published");
    assert_eq!(pending.number(CTX), 1);

    worker.close().await;
}

#[tokio::test]
async fn head_change_rebuilds_on_the_new_parent() {
    let harness = harness(&[]);
    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);

    worker.start().await;
    let first = next_task(&mut tasks).await;
    assert_eq!(first.number(CTX), 1);

    let new_head = harness.chain.extend_canonical();
    let rebuilt =
        next_task_matching(&mut tasks, |block| block.parent_hash(CTX) == new_head.hash()).await;
    assert_eq!(rebuilt.number(CTX), 2);

    worker.close().await;
}

#[tokio::test]
async fn timer_resubmission_pulls_in_new_transactions() {
    let sender = account(0xaa);
    let harness = harness(&[sender]);
    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);

    worker.start().await;
    let first = next_task(&mut tasks).await;
    assert!(first.transactions().is_empty());

    // arrival while sealing only bumps the counter; the recommit timer picks
    // it up
    harness.pool.inject(vec![harness.factory.transfer(sender, 0, 1)]);
    let resubmitted =
        next_task_matching(&mut tasks, |block| !block.transactions().is_empty()).await;
    assert_eq!(resubmitted.transactions().len(), 1);
    assert_eq!(resubmitted.transactions()[0].from, sender);

    worker.close().await;
}

#[tokio::test]
async fn side_blocks_become_uncles() {
    let harness = harness(&[]);
    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);

    let genesis = harness.chain.genesis();
    // advance once so a child of genesis is an uncle, not a sibling
    let head = harness.chain.extend_canonical();

    worker.start().await;
    next_task_matching(&mut tasks, |block| block.parent_hash(CTX) == head.hash()).await;

    let side = harness.chain.make_side_block(&genesis, 7);
    harness.chain.announce_side(&side);

    let with_uncle = next_task_matching(&mut tasks, |block| !block.uncles().is_empty()).await;
    assert_eq!(with_uncle.uncles().len(), 1);
    assert_eq!(with_uncle.uncles()[0].hash(), side.header().hash());

    worker.close().await;
}

#[tokio::test]
async fn stale_pending_tasks_are_pruned() {
    let harness = harness(&[]);
    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);

    worker.start().await;
    next_task(&mut tasks).await;

    // march the chain well past the stale threshold
    for _ in 0..9 {
        harness.chain.extend_canonical();
    }
    next_task_matching(&mut tasks, |block| block.number(CTX) == 10).await;

    // ten tasks were produced, but anything at or below head-7 is gone
    assert!(worker.pending_task_count() <= 8, "stale tasks must be pruned");

    worker.close().await;
}

#[tokio::test]
async fn stop_halts_task_production_but_keeps_the_snapshot_fresh() {
    let harness = harness(&[]);
    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);

    worker.start().await;
    next_task(&mut tasks).await;

    worker.stop();
    harness.chain.extend_canonical();

    // the snapshot follows the new head even though nothing is sealed
    wait_until(|| {
        worker.pending_block().map(|block| block.number(CTX) == 2).unwrap_or(false)
    })
    .await;
    let quiet = tokio::time::timeout(Duration::from_millis(300), tasks.recv()).await;
    assert!(quiet.is_err(), "no sealing tasks while stopped");

    worker.close().await;
}

#[tokio::test]
async fn dev_mode_seals_directly_on_transaction_arrival() {
    let sender = account(0xaa);
    let chain_config =
        ChainConfig { poa: Some(PoaConfig { period: 0 }), ..test_chain_config() };
    let harness = harness_with_config(&[sender], chain_config);
    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);

    worker.start().await;
    next_task(&mut tasks).await;

    harness.pool.inject(vec![harness.factory.transfer(sender, 0, 1)]);
    let sealed = next_task_matching(&mut tasks, |block| !block.transactions().is_empty()).await;
    assert_eq!(sealed.transactions().len(), 1);

    worker.close().await;
}

#[tokio::test]
async fn sealed_solutions_flow_back_on_the_result_channel() {
    let harness = harness(&[]);
    let worker = spawn_worker(&harness, worker_config(), false);
    let mut results = worker.seal_results().expect("first take");
    assert!(worker.seal_results().is_none(), "the receiver is taken once");

    worker.start().await;
    let sealed = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("sealed block within the timeout")
        .expect("result channel open");
    assert_eq!(sealed.number(CTX), 1);

    worker.close().await;
}

#[tokio::test]
async fn disable_preseal_suppresses_empty_rounds() {
    let sender = account(0xaa);
    let harness = harness(&[sender]);
    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);
    worker.disable_preseal();

    worker.start().await;
    // the snapshot appears, but the empty round is never sealed
    wait_until(|| worker.pending_block().is_some()).await;
    let quiet = tokio::time::timeout(Duration::from_millis(300), tasks.recv()).await;
    assert!(quiet.is_err(), "no empty task with preseal disabled");

    // a round that carries transactions still seals
    harness.pool.inject(vec![harness.factory.transfer(sender, 0, 1)]);
    let task = next_task_matching(&mut tasks, |block| !block.transactions().is_empty()).await;
    assert_eq!(task.transactions().len(), 1);

    worker.close().await;
}

#[tokio::test]
async fn close_rejects_further_synchronous_requests() {
    let harness = harness(&[]);
    let worker = spawn_worker(&harness, worker_config(), false);
    worker.close().await;

    let err = worker
        .get_sealing_block(B256::repeat_byte(1), 100, account(0xcb), B256::ZERO)
        .await
        .unwrap_err();
    assert_matches!(err, WorkerError::Closed);
}
