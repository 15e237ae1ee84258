//! Transactions and the chain-aware signer.

use crate::error::SignerError;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// A dynamic-fee transaction.
///
/// Signature recovery happens at the network edge; by the time a transaction
/// reaches the sealing core its sender has been recovered and cached in
/// `from`. The [`Signer`] re-validates replay protection against the chain
/// configuration before the cached sender is trusted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Chain id the signature commits to. `None` for pre-replay-protection
    /// signatures.
    pub chain_id: Option<u64>,
    /// Sender account nonce.
    pub nonce: u64,
    /// Maximum gas the transaction may consume.
    pub gas_limit: u64,
    /// Maximum total fee per gas the sender is willing to pay.
    pub fee_cap: U256,
    /// Maximum priority fee per gas on top of the base fee.
    pub tip: U256,
    /// Recipient; `None` creates a contract.
    pub to: Option<Address>,
    /// Value transferred to the recipient.
    pub value: U256,
    /// Call data.
    pub input: Bytes,
    /// Sender recovered from the signature.
    pub from: Address,
}

impl Transaction {
    /// Keccak digest of the transaction encoding.
    pub fn hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(256);
        match self.chain_id {
            Some(id) => {
                buf.push(1);
                buf.extend_from_slice(&id.to_be_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.gas_limit.to_be_bytes());
        buf.extend_from_slice(&self.fee_cap.to_be_bytes::<32>());
        buf.extend_from_slice(&self.tip.to_be_bytes::<32>());
        match &self.to {
            Some(to) => {
                buf.push(1);
                buf.extend_from_slice(to.as_slice());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.value.to_be_bytes::<32>());
        buf.extend_from_slice(&self.input);
        buf.extend_from_slice(self.from.as_slice());
        keccak256(&buf)
    }

    /// Whether the signature commits to a chain id.
    pub fn protected(&self) -> bool {
        self.chain_id.is_some()
    }

    /// The effective miner tip for the given base fee.
    ///
    /// `None` when the fee cap cannot cover the base fee at all.
    pub fn effective_gas_tip(&self, base_fee: &U256) -> Option<U256> {
        if self.fee_cap < *base_fee {
            return None;
        }
        Some(self.tip.min(self.fee_cap - base_fee))
    }
}

/// Derives transaction senders under the rules active at a given block.
///
/// Construct via [`ChainConfig::signer_at`](crate::ChainConfig::signer_at).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signer {
    /// Pre-replay-protection rules: any chain id (or none) is accepted.
    Legacy { chain_id: u64 },
    /// Replay-protected rules: a protected signature must commit to this
    /// chain's id. Unprotected signatures remain valid; the worker decides
    /// separately whether to include them.
    Protected { chain_id: u64 },
}

impl Signer {
    /// Return the transaction sender, validating the chain id commitment.
    pub fn sender(&self, tx: &Transaction) -> Result<Address, SignerError> {
        let expected = match self {
            Self::Legacy { chain_id } | Self::Protected { chain_id } => *chain_id,
        };
        if let Some(got) = tx.chain_id {
            if got != expected {
                return Err(SignerError::InvalidChainId { expected, got });
            }
        }
        Ok(tx.from)
    }
}
