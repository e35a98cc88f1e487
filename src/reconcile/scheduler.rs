//! Periodic, single-flight reconciliation.
//!
//! Every tick spawns a pass; a pass that finds another one still running is
//! skipped, so the sweeps never run concurrently with themselves.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use super::{PassOptions, PassResult, Reconciler};

/// Runs reconciliation passes on a fixed interval
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    running: Mutex<()>,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            running: Mutex::new(()),
        }
    }

    /// Run one pass unless a pass is already running.
    ///
    /// Returns `None` when the pass was skipped.
    pub async fn try_run_pass(&self, options: PassOptions) -> Option<PassResult> {
        let Ok(_flight) = self.running.try_lock() else {
            warn!("reconciliation pass still running, skipping tick");
            return None;
        };
        Some(self.reconciler.run_reconciliation_pass(options).await)
    }

    /// Tick until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "reconciliation scheduler started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        scheduler.try_run_pass(PassOptions::default()).await;
                    });
                }
            }
        }

        // Let a pass in flight finish
        let _flight = self.running.lock().await;
        info!("reconciliation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize::QueueSideEffects;
    use crate::queue::JsonlJobQueue;
    use crate::reconcile::ReconcileSettings;
    use crate::store::{Repo, RuntimeScope, SqliteStore};
    use tempfile::TempDir;

    fn scheduler(temp: &TempDir) -> Arc<Scheduler> {
        let repo = Repo::new(Arc::new(SqliteStore::open_in_memory().unwrap()), RuntimeScope::new("prod"));
        let queue = Arc::new(JsonlJobQueue::new(temp.path().to_path_buf()));
        let reconciler = Reconciler::new(
            repo,
            queue.clone(),
            Arc::new(QueueSideEffects::new(queue)),
            ReconcileSettings::default(),
        );
        Arc::new(Scheduler::new(Arc::new(reconciler), Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn test_pass_is_skipped_while_another_runs() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler(&temp);

        let held = scheduler.running.lock().await;
        assert!(scheduler.try_run_pass(PassOptions::default()).await.is_none());
        drop(held);

        let result = scheduler.try_run_pass(PassOptions::default()).await.unwrap();
        assert!(result.ok);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler(&temp);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
