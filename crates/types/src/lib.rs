//! Primitive types shared across the trellis crates.
//!
//! This crate holds the hierarchical header and block types, transactions and
//! receipts, the price-and-nonce transaction ordering used by the sealing
//! worker, gas accounting, and the narrow capability traits through which the
//! worker consumes its collaborators (header chain, transaction pool, state,
//! and consensus engine).

#![warn(missing_debug_implementations, unreachable_pub, rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]

mod block;
mod chain_config;
#[macro_use]
pub mod error;
mod events;
mod gas;
mod header;
mod helpers;
mod ordering;
pub mod proofs;
mod receipt;
mod sync;
mod traits;
mod transaction;

pub use block::*;
pub use chain_config::*;
pub use events::*;
pub use gas::*;
pub use header::*;
pub use helpers::*;
pub use ordering::*;
pub use receipt::*;
pub use sync::*;
pub use traits::*;
pub use transaction::*;

// re-exports for easier maintainability
pub use alloy_primitives::{keccak256, Address, Bloom, BloomInput, Bytes, B256, U256};
