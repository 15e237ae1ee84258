//! The resubmit scheduler.
//!
//! Decides when the assembler starts or restarts a sealing round: on start,
//! on every new chain head, and on a timer whose interval adapts to fill-rate
//! feedback from the assembler.

use crate::worker::{
    Interrupt, InterruptCell, IntervalAdjust, NewWorkRequest, Shared, INTERVAL_ADJUST_BIAS,
    INTERVAL_ADJUST_RATIO, MAX_RECOMMIT_INTERVAL, MIN_RECOMMIT_INTERVAL,
};
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc},
    time::{self, Instant, Sleep},
};
use tracing::{info, trace, warn};
use trellis_types::{now, ChainConfig, ChainHeadEvent, HeaderChain, Noticer, State};

/// Channel ends the scheduler consumes.
pub(crate) struct SchedulerChannels {
    /// Start tokens from the controller.
    pub(crate) start: mpsc::Receiver<()>,
    /// Canonical head announcements.
    pub(crate) chain_head: broadcast::Receiver<ChainHeadEvent>,
    /// Explicit interval overrides from the controller.
    pub(crate) interval: mpsc::Receiver<Duration>,
    /// Fill-ratio feedback from the assembler.
    pub(crate) adjust: mpsc::Receiver<IntervalAdjust>,
    /// Worker shutdown.
    pub(crate) shutdown: Noticer,
}

/// The timer-driven new-work loop.
pub(crate) struct Scheduler<BT, S> {
    pub(crate) chain: BT,
    pub(crate) chain_config: ChainConfig,
    pub(crate) shared: Arc<Shared<S>>,
    /// New-work requests, toward the assembler.
    pub(crate) new_work_tx: mpsc::Sender<NewWorkRequest>,
}

impl<BT, S> Scheduler<BT, S>
where
    BT: HeaderChain<State = S>,
    S: State,
{
    /// Run until shutdown. `recommit` is the sanitized user interval and also
    /// the floor any feedback may relax back to.
    pub(crate) async fn run(self, mut ch: SchedulerChannels, recommit: Duration) {
        let ctx = self.chain_config.context;
        // in-flight round's interrupt cell; replaced by every commit
        let mut interrupt: Option<InterruptCell> = None;
        let mut min_recommit = recommit;
        let mut recommit = recommit;
        let mut timestamp = 0u64;

        let timer = time::sleep(recommit);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                Some(()) = ch.start.recv() => {
                    if let Some(head) = self.chain.current_block() {
                        self.shared.clear_stale_tasks(head.number(ctx));
                    }
                    timestamp = now();
                    if !self
                        .commit(&mut interrupt, timer.as_mut(), recommit, false, Interrupt::NewHead, timestamp)
                        .await
                    {
                        break;
                    }
                }
                event = ch.chain_head.recv() => match event {
                    Ok(event) => {
                        self.shared.clear_stale_tasks(event.block.number(ctx));
                        timestamp = now();
                        if !self
                            .commit(&mut interrupt, timer.as_mut(), recommit, false, Interrupt::NewHead, timestamp)
                            .await
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "sealer::scheduler", missed, "chain-head subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = timer.as_mut() => {
                    // Periodically resubmit to pull in higher-priced
                    // transactions, unless the engine seals instantaneously
                    // (zero-period PoA) or nothing new arrived.
                    if self.shared.is_running() && !self.chain_config.is_dev_mode() {
                        if self.shared.new_txs.load(Ordering::Acquire) == 0 {
                            timer.as_mut().reset(Instant::now() + recommit);
                        } else if !self
                            .commit(&mut interrupt, timer.as_mut(), recommit, true, Interrupt::Resubmit, timestamp)
                            .await
                        {
                            break;
                        }
                    } else {
                        timer.as_mut().reset(Instant::now() + recommit);
                    }
                }
                Some(interval) = ch.interval.recv() => {
                    let interval = if interval < MIN_RECOMMIT_INTERVAL {
                        warn!(
                            target: "sealer::scheduler",
                            provided = ?interval,
                            updated = ?MIN_RECOMMIT_INTERVAL,
                            "sanitizing recommit interval",
                        );
                        MIN_RECOMMIT_INTERVAL
                    } else {
                        interval
                    };
                    info!(target: "sealer::scheduler", from = ?min_recommit, to = ?interval, "recommit interval update");
                    min_recommit = interval;
                    recommit = interval;
                    self.shared.set_recommit(recommit);
                }
                Some(adjust) = ch.adjust.recv() => {
                    let before = recommit;
                    recommit = if adjust.inc {
                        let target = recommit.as_nanos() as f64 / adjust.ratio;
                        recalc_recommit(min_recommit, recommit, target, true)
                    } else {
                        recalc_recommit(min_recommit, recommit, min_recommit.as_nanos() as f64, false)
                    };
                    trace!(
                        target: "sealer::scheduler",
                        inc = adjust.inc,
                        from = ?before,
                        to = ?recommit,
                        "recommit interval adjusted",
                    );
                    self.shared.set_recommit(recommit);
                }
                _ = ch.shutdown.recv() => break,
            }
        }
    }

    /// Signal the in-flight round, hand the assembler a fresh interrupt cell,
    /// re-arm the timer, and reset the new-transaction counter.
    ///
    /// Returns `false` when the assembler is gone.
    async fn commit(
        &self,
        interrupt: &mut Option<InterruptCell>,
        timer: Pin<&mut Sleep>,
        recommit: Duration,
        noempty: bool,
        signal: Interrupt,
        timestamp: u64,
    ) -> bool {
        if let Some(cell) = interrupt.as_ref() {
            cell.store(signal as i32, Ordering::Release);
        }
        let cell: InterruptCell = Arc::new(AtomicI32::new(Interrupt::None as i32));
        *interrupt = Some(cell.clone());
        if self
            .new_work_tx
            .send(NewWorkRequest { interrupt: cell, noempty, timestamp })
            .await
            .is_err()
        {
            return false;
        }
        timer.reset(Instant::now() + recommit);
        self.shared.new_txs.store(0, Ordering::Release);
        true
    }
}

/// Recalculate the resubmit interval from feedback.
///
/// Increases blend toward `target` plus a bias so the ceiling stays
/// reachable; decreases blend toward the user floor minus the same bias.
pub(crate) fn recalc_recommit(
    min_recommit: Duration,
    prev: Duration,
    target: f64,
    inc: bool,
) -> Duration {
    let prev = prev.as_nanos() as f64;
    let next = if inc {
        let next = prev * (1.0 - INTERVAL_ADJUST_RATIO)
            + INTERVAL_ADJUST_RATIO * (target + INTERVAL_ADJUST_BIAS);
        next.min(MAX_RECOMMIT_INTERVAL.as_nanos() as f64)
    } else {
        let next = prev * (1.0 - INTERVAL_ADJUST_RATIO)
            + INTERVAL_ADJUST_RATIO * (target - INTERVAL_ADJUST_BIAS);
        next.max(min_recommit.as_nanos() as f64)
    };
    Duration::from_nanos(next as u64)
}
