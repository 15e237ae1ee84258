//! The seal dispatcher.
//!
//! Receives finished tasks from the assembler, records them in the
//! pending-tasks table, and pushes them into the consensus engine. A new task
//! always cancels the sealing round before it.

use crate::{worker::Shared, SealTask};
use alloy_primitives::B256;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use trellis_types::{Block, Engine, Noticer, Notifier, State};

/// Channel ends the dispatcher consumes.
pub(crate) struct DispatcherChannels<S> {
    /// Finished tasks from the assembler.
    pub(crate) tasks: mpsc::Receiver<SealTask<S>>,
    /// Worker shutdown.
    pub(crate) shutdown: Noticer,
}

/// The task loop between assembler and engine.
pub(crate) struct Dispatcher<CE, S> {
    pub(crate) engine: CE,
    pub(crate) shared: Arc<Shared<S>>,
    /// Sealed solutions flow back through this channel.
    pub(crate) result_tx: mpsc::Sender<Block>,
}

impl<CE, S> Dispatcher<CE, S>
where
    CE: Engine,
    S: State,
{
    /// Run until shutdown, cancelling any in-flight seal on exit.
    pub(crate) async fn run(self, mut ch: DispatcherChannels<S>) {
        // cancellation handle for the in-flight seal and its seal-hash
        let mut stop: Option<Notifier> = None;
        let mut prev: Option<B256> = None;

        loop {
            tokio::select! {
                Some(task) = ch.tasks.recv() => {
                    let seal_hash = self.engine.seal_hash(task.block.header());
                    if prev == Some(seal_hash) {
                        // Resubmissions can reproduce the same work; it is
                        // submitted anyway and left to the engine to dedup.
                        debug!(target: "sealer::dispatcher", %seal_hash, "duplicate sealing work, submitting anyway");
                    }
                    // interrupt the previous sealing operation
                    if let Some(stop) = stop.take() {
                        stop.notify();
                    }
                    let notifier = Notifier::new();
                    let noticer = notifier.subscribe();
                    stop = Some(notifier);
                    prev = Some(seal_hash);

                    let block = task.block.clone();
                    self.shared.pending_tasks.lock().insert(seal_hash, task);

                    if let Err(err) = self.engine.seal(block, self.result_tx.clone(), noticer) {
                        warn!(target: "sealer::dispatcher", %seal_hash, %err, "block sealing failed");
                    }
                }
                _ = ch.shutdown.recv() => break,
            }
        }
        if let Some(stop) = stop.take() {
            stop.notify();
        }
    }
}
