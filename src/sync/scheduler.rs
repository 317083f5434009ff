//! SyncScheduler: background drain loop.
//!
//! Drains on a fixed interval and whenever the coordinator asks for one
//! (reconnect, login, dead letters retried). Overlapping drains are
//! impossible: the queue's own latch turns a second drain into a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::coordinator::SyncCoordinator;

pub struct SyncScheduler {
    disposed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    /// Spawn the drain loop on the current tokio runtime. The first drain
    /// runs immediately.
    pub fn start(coordinator: Arc<SyncCoordinator>, interval: Duration) -> Self {
        let disposed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let task_disposed = disposed.clone();
        let task_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                "drain loop started"
            );
            loop {
                tokio::select! {
                    _ = task_shutdown.notified() => break,
                    _ = ticker.tick() => {}
                    _ = coordinator.drain_requested() => debug!("drain requested"),
                }
                if task_disposed.load(Ordering::SeqCst) {
                    break;
                }
                let report = coordinator.drain().await;
                if !report.is_noop() {
                    debug!(
                        applied = report.applied,
                        requeued = report.requeued,
                        skipped = report.skipped,
                        "scheduled drain"
                    );
                }
            }
            info!("drain loop stopped");
        });

        Self {
            disposed,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the loop. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}
