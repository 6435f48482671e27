//! Periodic dead-letter flush while a session is active.
//!
//! Stopping only prevents new passes: a pass already running when the stop
//! signal arrives is allowed to finish, and [`FlushTicker::stop`] waits for
//! it, so the queue file is never left mid-rewrite.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::core::IntakePipeline;

/// What the ticker did over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickerTotals {
    /// Flush passes run
    pub passes: usize,

    /// Queued records those passes delivered
    pub redelivered: usize,
}

/// Handle to control the flush ticker
pub struct FlushTicker {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<TickerTotals>,
}

impl FlushTicker {
    /// Start flushing every `interval`, first pass one interval from now
    pub fn spawn(pipeline: Arc<IntakePipeline>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut totals = TickerTotals::default();

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        debug!("Periodic dead-letter flush");
                        if let Some(report) = pipeline.flush().await {
                            totals.redelivered += report.delivered;
                        }
                        totals.passes += 1;
                    }
                }
            }

            totals
        });

        Self { stop_tx, task }
    }

    /// Stop the ticker, waiting for an in-flight pass
    pub async fn stop(self) -> TickerTotals {
        let _ = self.stop_tx.send(()).await;

        match self.task.await {
            Ok(totals) => totals,
            Err(e) => {
                warn!(error = %e, "Flush ticker ended abnormally");
                TickerTotals::default()
            }
        }
    }
}
