//! The hierarchical block header.
//!
//! Trellis chains are organised in a three-tier hierarchy; every header carries
//! one slot per tier for the chain-linking fields. A node populates only the
//! slot of the tier it participates in (its *local context*, see
//! [`ChainConfig::context`](crate::ChainConfig)); the remaining slots stay
//! zero-valued and are preserved by the consensus engine.

use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Number of tiers in the chain hierarchy.
pub const NUM_CONTEXTS: usize = 3;

/// A block header under construction or sealed.
///
/// All chain-linking fields are per-context arrays of length [`NUM_CONTEXTS`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Parent hash per context.
    pub parent_hash: [B256; NUM_CONTEXTS],
    /// Block number per context.
    pub number: [u64; NUM_CONTEXTS],
    /// Opaque extra data per context.
    pub extra: [Bytes; NUM_CONTEXTS],
    /// Unix timestamp of the block.
    pub time: u64,
    /// Base fee per context.
    pub base_fee: [U256; NUM_CONTEXTS],
    /// Gas limit per context.
    pub gas_limit: [u64; NUM_CONTEXTS],
    /// Cumulative gas used per context.
    pub gas_used: [u64; NUM_CONTEXTS],
    /// Fee recipient per context.
    pub coinbase: [Address; NUM_CONTEXTS],
    /// Difficulty target per context, filled by the engine during preparation.
    pub difficulty: [U256; NUM_CONTEXTS],
    /// Aggregate network difficulty per context, filled by the engine.
    pub network_difficulty: [U256; NUM_CONTEXTS],
    /// Post-execution state root per context.
    pub state_root: [B256; NUM_CONTEXTS],
    /// Transaction commitment per context.
    pub tx_root: [B256; NUM_CONTEXTS],
    /// Receipt commitment per context.
    pub receipt_root: [B256; NUM_CONTEXTS],
    /// Uncle commitment per context.
    pub uncle_root: [B256; NUM_CONTEXTS],
    /// Log bloom per context.
    pub bloom: [Bloom; NUM_CONTEXTS],
    /// The producing node's position in the hierarchy.
    pub location: Bytes,
    /// Randomness supplied by the caller of the synchronous get-work path.
    pub mix_hash: B256,
    /// Proof-of-work nonce, filled by the engine when sealing.
    pub nonce: u64,
}

impl Header {
    /// Serialize the header into `out` with a fixed, deterministic layout.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        for hash in &self.parent_hash {
            out.extend_from_slice(hash.as_slice());
        }
        for number in &self.number {
            out.extend_from_slice(&number.to_be_bytes());
        }
        for extra in &self.extra {
            out.extend_from_slice(&(extra.len() as u64).to_be_bytes());
            out.extend_from_slice(extra);
        }
        out.extend_from_slice(&self.time.to_be_bytes());
        for fee in &self.base_fee {
            out.extend_from_slice(&fee.to_be_bytes::<32>());
        }
        for limit in &self.gas_limit {
            out.extend_from_slice(&limit.to_be_bytes());
        }
        for used in &self.gas_used {
            out.extend_from_slice(&used.to_be_bytes());
        }
        for coinbase in &self.coinbase {
            out.extend_from_slice(coinbase.as_slice());
        }
        for difficulty in &self.difficulty {
            out.extend_from_slice(&difficulty.to_be_bytes::<32>());
        }
        for difficulty in &self.network_difficulty {
            out.extend_from_slice(&difficulty.to_be_bytes::<32>());
        }
        for root in &self.state_root {
            out.extend_from_slice(root.as_slice());
        }
        for root in &self.tx_root {
            out.extend_from_slice(root.as_slice());
        }
        for root in &self.receipt_root {
            out.extend_from_slice(root.as_slice());
        }
        for root in &self.uncle_root {
            out.extend_from_slice(root.as_slice());
        }
        for bloom in &self.bloom {
            out.extend_from_slice(bloom.as_slice());
        }
        out.extend_from_slice(&(self.location.len() as u64).to_be_bytes());
        out.extend_from_slice(&self.location);
        out.extend_from_slice(self.mix_hash.as_slice());
        out.extend_from_slice(&self.nonce.to_be_bytes());
    }

    /// Keccak digest of the full header encoding.
    pub fn hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(2048);
        self.encode_into(&mut buf);
        keccak256(&buf)
    }
}
