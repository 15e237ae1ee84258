//! Blocks: a sealed header plus its transaction and uncle bodies.

use crate::{proofs, Header, Receipt, Transaction};
use alloy_primitives::{B256, U256};
use std::sync::Arc;

/// An assembled block.
///
/// The hash is computed once at construction; the body is immutable
/// afterwards.
#[derive(Clone, Debug)]
pub struct Block {
    header: Header,
    transactions: Vec<Arc<Transaction>>,
    uncles: Vec<Header>,
    hash: B256,
}

impl Block {
    /// Assemble a block, deriving the transaction, receipt, and uncle
    /// commitments and the log bloom for the given context slot.
    pub fn new(
        mut header: Header,
        transactions: Vec<Arc<Transaction>>,
        uncles: Vec<Header>,
        receipts: &[Receipt],
        context: usize,
    ) -> Self {
        header.tx_root[context] = proofs::transactions_root(&transactions);
        header.receipt_root[context] = proofs::receipts_root(receipts);
        header.uncle_root[context] = proofs::uncles_root(&uncles);
        header.bloom[context] = proofs::logs_bloom(receipts.iter().flat_map(|r| r.logs.iter()));
        let hash = header.hash();
        Self { header, transactions, uncles, hash }
    }

    /// Wrap a finished header in a body-less block. The commitments in the
    /// header are taken as-is.
    pub fn from_header(header: Header) -> Self {
        let hash = header.hash();
        Self { header, transactions: Vec::new(), uncles: Vec::new(), hash }
    }

    /// The block header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The cached header hash.
    pub fn hash(&self) -> B256 {
        self.hash
    }

    /// The block body transactions.
    pub fn transactions(&self) -> &[Arc<Transaction>] {
        &self.transactions
    }

    /// The included uncle headers.
    pub fn uncles(&self) -> &[Header] {
        &self.uncles
    }

    /// Block number in the given context.
    pub fn number(&self, context: usize) -> u64 {
        self.header.number[context]
    }

    /// Parent hash in the given context.
    pub fn parent_hash(&self, context: usize) -> B256 {
        self.header.parent_hash[context]
    }

    /// Gas used in the given context.
    pub fn gas_used(&self, context: usize) -> u64 {
        self.header.gas_used[context]
    }

    /// Gas limit in the given context.
    pub fn gas_limit(&self, context: usize) -> u64 {
        self.header.gas_limit[context]
    }

    /// Base fee in the given context.
    pub fn base_fee(&self, context: usize) -> U256 {
        self.header.base_fee[context]
    }

    /// State root in the given context.
    pub fn state_root(&self, context: usize) -> B256 {
        self.header.state_root[context]
    }

    /// Block timestamp.
    pub fn time(&self) -> u64 {
        self.header.time
    }
}
