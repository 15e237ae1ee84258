//! The block-sealing worker.
//!
//! The worker continuously assembles candidate blocks on top of the canonical
//! head, drives them through the consensus engine, and republishes work as
//! the tip moves. Three long-lived tasks cooperate:
//!
//! - the *scheduler* decides when to build, adapting its resubmission cadence
//!   to observed block fill ratios;
//! - the *assembler* owns the in-progress environment and reacts to head
//!   changes, side-chain arrivals (uncle candidates), and new transactions;
//! - the *dispatcher* hands finished tasks to the engine, cancelling any
//!   sealing round a newer task supersedes.
//!
//! All cross-task signalling is message passing; the only shared mutable
//! state is the worker configuration, the pending-tasks table, the published
//! snapshot, and a handful of atomic flags.

#![warn(missing_debug_implementations, missing_docs, unreachable_pub, rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]

mod assembler;
mod dispatcher;
mod environment;
mod error;
mod scheduler;
pub mod test_utils;
mod worker;

pub use environment::SealTask;
pub use error::{UncleError, WorkerError};
pub use worker::{
    GenerateParams, Interrupt, IsLocalBlock, Worker, WorkerConfig, CHAIN_HEAD_CHAN_SIZE,
    CHAIN_SIDE_CHAN_SIZE, TX_CHAN_SIZE,
};

pub(crate) use assembler::Assembler;
pub(crate) use dispatcher::Dispatcher;
pub(crate) use scheduler::Scheduler;
