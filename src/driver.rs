//! Timer loop that drives a [`SyncContext`].
//!
//! One task multiplexes every interval bucket: it sleeps until the earliest
//! bucket deadline, claims the due keys and hands their reads to a separate
//! task, then goes straight back to the timer. A slow read therefore delays
//! only its own key. Subscribing to a key in a new bucket wakes the loop early,
//! since new buckets are due immediately.

use crate::context::{SyncContext, TickReport};
use log::{debug, error, info};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// How long the loop sleeps when nothing is subscribed.
const IDLE_WAIT: Duration = Duration::from_secs(60);

pub struct PollDriver {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl PollDriver {
    /// Spawn the poll loop for `ctx` on the current tokio runtime.
    pub fn spawn(ctx: SyncContext) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_poll_loop(ctx, cancel.clone()));
        Self { handle, cancel }
    }

    /// Token that stops the loop when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the loop and wait for reads already started to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("[Poll] Driver task failed: {}", e);
        }
    }
}

fn log_tick(joined: Result<TickReport, JoinError>) {
    match joined {
        Ok(report) if report.polled > 0 || report.skipped > 0 => debug!(
            "[Poll] Tick: {} read, {} updated, {} failed, {} skipped, {} notified",
            report.polled, report.updated, report.failed, report.skipped, report.notified
        ),
        Ok(_) => {}
        Err(e) => error!("[Poll] Tick task failed: {}", e),
    }
}

async fn run_poll_loop(ctx: SyncContext, cancel: CancellationToken) {
    info!("[Poll] Driver started");
    let mut ticks: JoinSet<TickReport> = JoinSet::new();
    loop {
        let wake_at = ctx
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ctx.schedule_changed().notified() => {
                debug!("[Poll] Schedule changed, recomputing deadline");
            }
            Some(joined) = ticks.join_next(), if !ticks.is_empty() => log_tick(joined),
            _ = sleep_until(wake_at) => {
                // Claimed here so the deadline has moved before the loop
                // sleeps again.
                let claim = ctx.claim_due(Instant::now());
                if !claim.is_empty() {
                    let ctx = ctx.clone();
                    ticks.spawn(async move { ctx.poll_claimed(claim).await });
                }
            }
        }
    }

    while let Some(joined) = ticks.join_next().await {
        log_tick(joined);
    }
    info!("[Poll] Driver stopped");
}
