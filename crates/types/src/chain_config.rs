//! Chain-level configuration consumed by the sealing core.

use crate::{Signer, NUM_CONTEXTS};
use alloy_primitives::Bytes;
use serde::{Deserialize, Serialize};

/// Proof-of-authority settings. A `period` of zero is dev-mode: blocks are
/// produced instantaneously and empty submissions are rejected, so the worker
/// commits work directly when transactions arrive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoaConfig {
    /// Target seconds between blocks.
    pub period: u64,
}

/// Static parameters of the chain a node participates in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain identifier committed to by replay-protected signatures.
    pub chain_id: u64,
    /// The node's tier in the hierarchy; selects the slot written in
    /// per-context header arrays. Must be below [`NUM_CONTEXTS`].
    pub context: usize,
    /// The node's position in the hierarchy, copied into headers.
    pub location: Bytes,
    /// Block number from which replay protection is enforced. `None` means
    /// never.
    pub replay_block: Option<u64>,
    /// Proof-of-authority settings, when the chain runs under PoA.
    pub poa: Option<PoaConfig>,
}

impl ChainConfig {
    /// Whether replay protection is active at `number`.
    pub fn is_replay_protected(&self, number: u64) -> bool {
        self.replay_block.is_some_and(|activation| number >= activation)
    }

    /// The signer for blocks at `number`.
    pub fn signer_at(&self, number: u64) -> Signer {
        if self.is_replay_protected(number) {
            Signer::Protected { chain_id: self.chain_id }
        } else {
            Signer::Legacy { chain_id: self.chain_id }
        }
    }

    /// Whether the chain runs zero-period PoA (dev-mode).
    pub fn is_dev_mode(&self) -> bool {
        self.poa.as_ref().is_some_and(|poa| poa.period == 0)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            context: NUM_CONTEXTS - 1,
            location: Bytes::new(),
            replay_block: Some(0),
            poa: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_activation_is_a_threshold() {
        let config = ChainConfig { replay_block: Some(10), ..Default::default() };
        assert!(!config.is_replay_protected(9));
        assert!(config.is_replay_protected(10));
        assert!(matches!(config.signer_at(9), Signer::Legacy { .. }));
        assert!(matches!(config.signer_at(10), Signer::Protected { .. }));

        let never = ChainConfig { replay_block: None, ..Default::default() };
        assert!(!never.is_replay_protected(u64::MAX));
    }
}
