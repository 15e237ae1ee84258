//! Execution receipts and logs.

use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256};
use serde::{Deserialize, Serialize};

/// A log emitted during transaction execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Address of the emitting account.
    pub address: Address,
    /// Indexed topics.
    pub topics: Vec<B256>,
    /// Unindexed payload.
    pub data: Bytes,
}

/// The result of executing a single transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Hash of the transaction this receipt belongs to.
    pub tx_hash: B256,
    /// Whether execution succeeded.
    pub success: bool,
    /// Gas consumed by this transaction alone.
    pub gas_used: u64,
    /// Cumulative gas consumed in the block up to and including this
    /// transaction.
    pub cumulative_gas_used: u64,
    /// Logs emitted during execution.
    pub logs: Vec<Log>,
    /// Bloom over the emitted logs.
    pub bloom: Bloom,
}

impl Receipt {
    /// Keccak digest of the receipt, used for the receipt commitment.
    pub fn digest(&self) -> B256 {
        let mut buf = Vec::with_capacity(64 + self.logs.len() * 64);
        buf.extend_from_slice(self.tx_hash.as_slice());
        buf.push(self.success as u8);
        buf.extend_from_slice(&self.gas_used.to_be_bytes());
        buf.extend_from_slice(&self.cumulative_gas_used.to_be_bytes());
        for log in &self.logs {
            buf.extend_from_slice(log.address.as_slice());
            for topic in &log.topics {
                buf.extend_from_slice(topic.as_slice());
            }
            buf.extend_from_slice(&log.data);
        }
        keccak256(&buf)
    }
}
