//! The synchronous controller paths: get-sealing-block, pending header,
//! interval updates.

use crate::{account, harness, spawn_worker, wait_until, worker_config, CTX};
use assert_matches::assert_matches;
use std::time::Duration;
use trellis_sealer::{WorkerConfig, WorkerError};
use trellis_types::{now, B256};

#[tokio::test]
async fn get_sealing_block_honors_the_forced_parameters() {
    let harness = harness(&[]);
    let worker = spawn_worker(&harness, worker_config(), false);
    let genesis = harness.chain.genesis();

    let timestamp = now() + 30;
    let random = B256::repeat_byte(0x42);
    let block = worker
        .get_sealing_block(genesis.hash(), timestamp, account(0x0c), random)
        .await
        .expect("sealing block");

    assert_eq!(block.number(CTX), 1);
    assert_eq!(block.parent_hash(CTX), genesis.hash());
    assert_eq!(block.time(), timestamp, "forced timestamps are taken verbatim");
    assert_eq!(block.header().coinbase[CTX], account(0x0c));
    assert_eq!(block.header().mix_hash, random);
    assert!(block.header().extra[CTX].is_empty(), "extra data is suppressed");
    assert!(block.uncles().is_empty(), "uncles are suppressed");

    worker.close().await;
}

#[tokio::test]
async fn get_sealing_block_rejects_bad_parameters() {
    let harness = harness(&[]);
    let worker = spawn_worker(&harness, worker_config(), false);
    let genesis = harness.chain.genesis();

    // a forced timestamp at or before the parent is fatal to the request
    let err = worker
        .get_sealing_block(genesis.hash(), genesis.time(), account(0x0c), B256::ZERO)
        .await
        .unwrap_err();
    assert_matches!(err, WorkerError::InvalidTimestamp { .. });

    let unknown = B256::repeat_byte(0x99);
    let err = worker
        .get_sealing_block(unknown, now() + 30, account(0x0c), B256::ZERO)
        .await
        .unwrap_err();
    assert_matches!(err, WorkerError::UnknownParent(hash) if hash == unknown);

    worker.close().await;
}

#[tokio::test]
async fn generate_pending_header_prepares_on_the_head() {
    let harness = harness(&[]);
    let worker = spawn_worker(&harness, worker_config(), false);
    let genesis = harness.chain.genesis();

    let header = worker
        .generate_pending_header(genesis.header())
        .await
        .expect("pending header");
    assert_eq!(header.number[CTX], 1);
    assert_eq!(header.parent_hash[CTX], genesis.hash());
    // the engine's preparation ran
    assert!(header.difficulty[CTX] > trellis_types::U256::ZERO);

    worker.close().await;
}

#[tokio::test]
async fn generate_pending_header_requires_a_coinbase_while_running() {
    let harness = harness(&[]);
    let config = WorkerConfig { coinbase: None, ..worker_config() };
    let worker = spawn_worker(&harness, config, false);
    worker.start().await;

    let err = worker
        .generate_pending_header(harness.chain.genesis().header())
        .await
        .unwrap_err();
    assert_matches!(err, WorkerError::MissingCoinbase);

    worker.close().await;
}

#[tokio::test]
async fn setters_apply_to_subsequent_rounds() {
    let harness = harness(&[]);
    let mut tasks = harness.engine.subscribe_tasks();
    let worker = spawn_worker(&harness, worker_config(), false);
    worker.set_extra(trellis_types::Bytes::from_static(b"trellis"));
    worker.set_coinbase(account(0x11));
    worker.set_gas_ceil(10_000_000);

    worker.start().await;
    let task = crate::next_task(&mut tasks).await;
    assert_eq!(task.header().extra[CTX].as_ref(), b"trellis");
    assert_eq!(task.header().coinbase[CTX], account(0x11));
    assert!(task.gas_limit(CTX) <= 10_000_000);

    worker.close().await;
}

#[tokio::test]
async fn recommit_interval_updates_are_clamped() {
    let harness = harness(&[]);
    let worker = spawn_worker(&harness, worker_config(), false);
    assert_eq!(worker.recommit_interval(), Duration::from_secs(1));

    worker.set_recommit_interval(Duration::from_millis(200)).await;
    wait_until(|| worker.recommit_interval() == Duration::from_secs(1)).await;

    worker.set_recommit_interval(Duration::from_secs(5)).await;
    wait_until(|| worker.recommit_interval() == Duration::from_secs(5)).await;

    worker.close().await;
}
