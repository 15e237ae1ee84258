//! Transaction selection, ordering, and the idle pending-block path.

use crate::{account, harness, next_task, spawn_worker, wait_until, worker_config};
use std::time::Duration;
use trellis_sealer::test_utils::MemChain;

#[tokio::test]
async fn nonce_ladder_skips_stale_and_applies_the_rest() {
    let sender = account(0xaa);
    let harness = harness(&[sender]);
    // the account already progressed to nonce 6; the pool still holds 5..=7
    harness.chain.set_account(sender, 6, trellis_sealer::test_utils::default_balance());
    harness.pool.insert(vec![
        harness.factory.transfer(sender, 5, 1),
        harness.factory.transfer(sender, 6, 1),
        harness.factory.transfer(sender, 7, 1),
    ]);

    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);
    worker.start().await;

    let task = next_task(&mut tasks).await;
    let nonces: Vec<_> = task.transactions().iter().map(|tx| tx.nonce).collect();
    assert_eq!(nonces, vec![6, 7], "the stale nonce is shifted away, the rest apply");

    worker.close().await;
}

#[tokio::test]
async fn oversized_transaction_does_not_starve_other_accounts() {
    let whale = account(0xaa);
    let minnow = account(0xbb);
    let harness = harness(&[whale, minnow]);
    // the whale's gas limit exceeds the whole block budget and pays the best
    // tip, so it sorts first and must be popped, not block the round
    harness.pool.insert(vec![
        harness.factory.transfer_with_gas(whale, 0, 9, MemChain::GENESIS_GAS_LIMIT + 1),
        harness.factory.transfer(minnow, 0, 1),
    ]);

    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);
    worker.start().await;

    let task = next_task(&mut tasks).await;
    assert_eq!(task.transactions().len(), 1);
    assert_eq!(task.transactions()[0].from, minnow);

    worker.close().await;
}

#[tokio::test]
async fn local_senders_are_packed_before_remotes() {
    let local = account(0xaa);
    let remote = account(0xbb);
    let harness = harness(&[local, remote]);
    harness.pool.add_local(local);
    // the remote pays a far better tip but still goes second
    harness.pool.insert(vec![
        harness.factory.transfer(local, 0, 1),
        harness.factory.transfer(remote, 0, 9),
    ]);

    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);
    worker.start().await;

    let task = next_task(&mut tasks).await;
    let order: Vec<_> = task.transactions().iter().map(|tx| tx.from).collect();
    assert_eq!(order, vec![local, remote]);

    worker.close().await;
}

#[tokio::test]
async fn idle_worker_extends_the_pending_block_and_publishes_logs() {
    let sender = account(0xaa);
    let harness = harness(&[sender]);
    // init submits a first round even though the worker never starts sealing
    let worker = spawn_worker(&harness, worker_config(), true);
    let mut logs = worker.subscribe_pending_logs();

    wait_until(|| worker.pending_block().is_some()).await;

    harness.pool.inject(vec![harness.factory.transfer(sender, 0, 1)]);

    let published = tokio::time::timeout(Duration::from_secs(5), logs.recv())
        .await
        .expect("pending logs within the timeout")
        .expect("feed open");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].address, sender);

    // the snapshot now reflects the executed transaction
    wait_until(|| {
        worker
            .pending_block()
            .map(|block| block.transactions().len() == 1)
            .unwrap_or(false)
    })
    .await;

    worker.close().await;
}

#[tokio::test]
async fn pending_snapshot_state_is_referentially_independent() {
    let sender = account(0xaa);
    let harness = harness(&[sender]);
    let worker = spawn_worker(&harness, worker_config(), true);
    wait_until(|| worker.pending_block().is_some()).await;

    let (_block, mut state) = worker.pending().expect("snapshot");
    let original = state.account(&sender);
    state.set_account(sender, 99, Default::default());

    // a fresh read is untouched by the caller's mutation
    let (_block, state) = worker.pending().expect("snapshot");
    assert_eq!(state.account(&sender), original);

    worker.close().await;
}
