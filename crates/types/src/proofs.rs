//! Commitments over block contents.
//!
//! The commitments are index-prefixed keccak accumulations; persistence-grade
//! trie formats live with the storage layer, not here.

use crate::{Header, Log, Receipt, Transaction};
use alloy_primitives::{keccak256, Bloom, BloomInput, B256};
use std::sync::Arc;

/// Commitment over an ordered sequence of digests.
pub fn ordered_root<I>(items: I) -> B256
where
    I: IntoIterator<Item = B256>,
{
    let mut buf = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        buf.extend_from_slice(&(index as u64).to_be_bytes());
        buf.extend_from_slice(item.as_slice());
    }
    keccak256(&buf)
}

/// Commitment over a block's transaction list.
pub fn transactions_root(transactions: &[Arc<Transaction>]) -> B256 {
    ordered_root(transactions.iter().map(|tx| tx.hash()))
}

/// Commitment over a block's receipt list.
pub fn receipts_root(receipts: &[Receipt]) -> B256 {
    ordered_root(receipts.iter().map(|receipt| receipt.digest()))
}

/// Commitment over a block's uncle headers.
pub fn uncles_root(uncles: &[Header]) -> B256 {
    ordered_root(uncles.iter().map(|uncle| uncle.hash()))
}

/// Aggregate bloom over a set of logs.
pub fn logs_bloom<'a>(logs: impl Iterator<Item = &'a Log>) -> Bloom {
    let mut bloom = Bloom::default();
    for log in logs {
        bloom.accrue(BloomInput::Raw(log.address.as_slice()));
        for topic in &log.topics {
            bloom.accrue(BloomInput::Raw(topic.as_slice()));
        }
    }
    bloom
}
