//! Periodic eviction of idle client state.
//!
//! The scheduler runs [`Shield::sweep`] on a fixed interval until stopped. A
//! sweep takes the same per-key locks as request handling, so it interleaves
//! with in-flight requests without extra coordination.

use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use crate::core::shield::{Shield, SweepReport};

pub struct CleanupScheduler {
    shield: Arc<Shield>,
    interval: Duration,
}

/// Handle to a running scheduler
pub struct CleanupHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanupScheduler {
    pub fn new(shield: Arc<Shield>, interval: Duration) -> Self {
        Self { shield, interval }
    }

    /// Spawn the sweep loop on the current tokio runtime.
    pub fn start(self) -> CleanupHandle {
        let (stop, mut stopped) = watch::channel(false);
        info!("Starting cleanup every {:?}", self.interval);

        let task = tokio::spawn(async move {
            let mut interval = time::interval(self.interval);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = self.shield.sweep();
                        record_sweep(&report, self.shield.stats().active_blocks);
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Cleanup loop exited");
        });

        CleanupHandle { stop, task }
    }
}

impl CleanupHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("Cleanup task ended abnormally: {}", e);
        }
        info!("Cleanup stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

fn record_sweep(report: &SweepReport, active_blocks: usize) {
    for (table, evicted) in [
        ("counters", report.counters),
        ("profiles", report.profiles),
        ("blocks", report.blocks),
        ("rate_windows", report.rate_windows),
    ] {
        if evicted > 0 {
            metrics::counter!("shield_sweep_evicted_total", evicted as u64, "table" => table);
        }
    }
    metrics::gauge!("shield_blocked_clients", active_blocks as f64);
    if report.total() > 0 {
        info!("Cleanup evicted {:?}", report);
    } else {
        debug!("Cleanup found nothing to evict");
    }
}
