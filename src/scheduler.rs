//! Reconciliation scheduler.
//!
//! [`PeriodicTask`] is the one loop primitive every subsystem shares: run an
//! action now, then again on each tick, until the cancellation token fires.
//! The loop awaits each pass before waiting for the next tick, so passes of
//! one subsystem never overlap; a slow pass simply delays the next one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::reconcile::Reconciler;

/// Shortest period accepted; `tokio::time::interval` panics on zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

pub struct PeriodicTask {
    name: String,
    period: Duration,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period: period.max(MIN_PERIOD),
        }
    }

    /// Run `action` immediately and then once per period until `token` is
    /// cancelled.  A pass in flight when cancellation arrives is dropped at
    /// its current await point.  Returns the number of passes that ran to
    /// completion.
    pub async fn run<F, Fut>(&self, token: CancellationToken, mut action: F) -> u64
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut completed = 0;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("{}: cancelled during pass", self.name);
                    break;
                }
                _ = action() => completed += 1,
            }
        }
        completed
    }
}

/// Drive one reconciler on its own timer, recording every pass in `metrics`.
pub async fn run_reconciler(
    reconciler: Arc<dyn Reconciler>,
    period: Duration,
    metrics: Arc<Metrics>,
    token: CancellationToken,
) {
    let subsystem = reconciler.subsystem();
    info!("Starting {} sync every {:?}", subsystem, period);

    let task = PeriodicTask::new(subsystem.as_str(), period);
    let passes = task
        .run(token, || {
            let reconciler = Arc::clone(&reconciler);
            let metrics = Arc::clone(&metrics);
            async move {
                metrics.pass_started(subsystem);
                match reconciler.reconcile().await {
                    Ok(summary) => metrics.pass_completed(subsystem, &summary),
                    Err(e) => {
                        error!("{} sync pass abandoned: {}", subsystem, e);
                        metrics.pass_abandoned(subsystem);
                    }
                }
            }
        })
        .await;

    info!("{} sync stopped after {} passes", subsystem, passes);
}
