//! Price-and-nonce transaction ordering.
//!
//! [`BestTransactions`] yields transactions highest-effective-tip first while
//! preserving per-sender nonce order: the heap holds each sender's lowest
//! pending nonce, and consuming a transaction promotes that sender's next
//! nonce into the heap.

use crate::{Signer, Transaction};
use alloy_primitives::{Address, U256};
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::Arc,
};
use tracing::trace;

/// A heap entry: one sender's currently cheapest-nonce transaction.
#[derive(Debug)]
struct PricedTransaction {
    sender: Address,
    tx: Arc<Transaction>,
    tip: U256,
    /// Insertion sequence, used to break tip ties first-come-first-served.
    seq: u64,
}

impl PartialEq for PricedTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.tip == other.tip && self.seq == other.seq
    }
}

impl Eq for PricedTransaction {}

impl PartialOrd for PricedTransaction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PricedTransaction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tip.cmp(&other.tip).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Iterator over pending transactions in effective-tip order.
#[derive(Debug)]
pub struct BestTransactions {
    heads: BinaryHeap<PricedTransaction>,
    buckets: HashMap<Address, VecDeque<Arc<Transaction>>>,
    signer: Signer,
    base_fee: U256,
    seq: u64,
}

impl BestTransactions {
    /// Build the ordering from per-sender nonce-sorted buckets.
    ///
    /// Buckets whose first transaction fails sender recovery or cannot pay
    /// the base fee are dropped entirely.
    pub fn new(
        signer: Signer,
        pending: HashMap<Address, Vec<Arc<Transaction>>>,
        base_fee: U256,
    ) -> Self {
        let mut this = Self {
            heads: BinaryHeap::with_capacity(pending.len()),
            buckets: HashMap::with_capacity(pending.len()),
            signer,
            base_fee,
            seq: 0,
        };
        for (sender, txs) in pending {
            let mut txs: VecDeque<_> = txs.into();
            let Some(first) = txs.pop_front() else { continue };
            match this.signer.sender(&first) {
                Ok(recovered) if recovered == sender => {}
                _ => {
                    trace!(target: "types::ordering", %sender, "dropping bucket with unverifiable sender");
                    continue;
                }
            }
            let Some(tip) = first.effective_gas_tip(&this.base_fee) else { continue };
            let seq = this.seq;
            this.seq += 1;
            this.heads.push(PricedTransaction { sender, tx: first, tip, seq });
            if !txs.is_empty() {
                this.buckets.insert(sender, txs);
            }
        }
        this
    }

    /// The best transaction, without consuming it.
    pub fn peek(&self) -> Option<&Arc<Transaction>> {
        self.heads.peek().map(|head| &head.tx)
    }

    /// Consume the best transaction and promote the same sender's next nonce.
    pub fn shift(&mut self) {
        let Some(head) = self.heads.pop() else { return };
        let Some(bucket) = self.buckets.get_mut(&head.sender) else { return };
        let Some(next) = bucket.pop_front() else { return };
        if bucket.is_empty() {
            self.buckets.remove(&head.sender);
        }
        // an underpriced successor retires the whole account for this round
        let Some(tip) = next.effective_gas_tip(&self.base_fee) else {
            self.buckets.remove(&head.sender);
            return;
        };
        let seq = self.seq;
        self.seq += 1;
        self.heads.push(PricedTransaction { sender: head.sender, tx: next, tip, seq });
    }

    /// Drop the best transaction and the rest of its sender's backlog.
    pub fn pop(&mut self) {
        if let Some(head) = self.heads.pop() {
            self.buckets.remove(&head.sender);
        }
    }
}
