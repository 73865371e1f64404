// Cleanup scheduler (spec §4.6): sweeps orphaned user-index entries on a
// fixed hourly schedule. Grounded in the teacher's background-task shape
// in `src/services/clickhouse_analytics.rs::new` (`tokio::spawn` +
// `tokio::time::interval` + `tokio::select!`), extended with a
// `tokio::sync::watch` shutdown channel for the graceful drain spec §5
// requires.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::adapter::TokenStore;
use super::model::KeyNaming;

const SCAN_BATCH_SIZE: u64 = 100;
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct CleanupScheduler {
    store: Arc<dyn TokenStore>,
    keys: KeyNaming,
    last_cleanup_time: Arc<AtomicI64>,
}

/// Handle returned by `spawn`; dropping it does not stop the scheduler,
/// call `shutdown` for a graceful stop.
pub struct CleanupHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl CleanupHandle {
    /// Signals the loop to stop after its current sweep completes, then
    /// waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

impl CleanupScheduler {
    pub fn new(store: Arc<dyn TokenStore>, keys: KeyNaming) -> Self {
        Self {
            store,
            keys,
            last_cleanup_time: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn last_cleanup_time_millis(&self) -> i64 {
        self.last_cleanup_time.load(Ordering::Relaxed)
    }

    /// One sweep of every user index: scan, then `cleanupExpired` per
    /// subject. Per-user errors are logged and skipped; they never abort
    /// the sweep. Idempotent — overlapping runs at worst repeat `SREM`s.
    pub async fn run_once(&self) -> u64 {
        let pattern = self.keys.user_index_scan_pattern();
        let mut cursor = 0u64;
        let mut total_removed = 0u64;

        loop {
            let (next_cursor, index_keys) = match self
                .store
                .scan_user_indices(&pattern, cursor, SCAN_BATCH_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "cleanup sweep: scan failed, aborting this pass");
                    break;
                }
            };

            for index_key in &index_keys {
                if self.keys.is_stats_key(index_key) {
                    continue;
                }
                match self.store.cleanup_expired(index_key).await {
                    Ok(removed) => total_removed += removed,
                    Err(e) => {
                        warn!(index_key, error = %e, "cleanup sweep: per-user cleanup failed, skipping");
                    }
                }
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        self.last_cleanup_time
            .store(super::model::now_millis(), Ordering::Relaxed);
        if total_removed > 0 {
            info!(total_removed, "cleanup sweep removed orphaned index entries");
        }
        total_removed
    }

    /// Spawns the hourly loop. Gated by `enable_scheduled_cleanup`; when
    /// `false` this still returns a handle but the loop never does any
    /// scanning — `run_once` remains available to the caller directly.
    pub fn spawn(self: Arc<Self>, enable_scheduled_cleanup: bool) -> CleanupHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            if !enable_scheduled_cleanup {
                let _ = shutdown_rx.changed().await;
                return;
            }

            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // first tick fires immediately, skip it

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
        });

        CleanupHandle { shutdown_tx, join }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::adapter::InMemoryTokenStore;
    use crate::registry::model::{now_millis, TokenRecord};

    fn record(subject: &str, device_id: &str) -> String {
        serde_json::to_string(&TokenRecord {
            subject: subject.to_string(),
            device_id: device_id.to_string(),
            issued_at: now_millis(),
            used: false,
            meta: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn sweep_removes_orphans_across_multiple_subjects() {
        let store = Arc::new(InMemoryTokenStore::new());
        let keys = KeyNaming::new("refresh", "user_tokens");

        store
            .save_token("refresh:a", &record("u1", "d"), 60, "u1", "user_tokens:u1")
            .await
            .unwrap();
        store
            .save_token("refresh:b", &record("u2", "d"), 60, "u2", "user_tokens:u2")
            .await
            .unwrap();
        store.simulate_expiry("refresh:a").await;
        store.simulate_expiry("refresh:b").await;

        let scheduler = CleanupScheduler::new(store, keys);
        let removed = scheduler.run_once().await;
        assert_eq!(removed, 2);
        assert!(scheduler.last_cleanup_time_millis() > 0);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let store = Arc::new(InMemoryTokenStore::new());
        let keys = KeyNaming::new("refresh", "user_tokens");
        let scheduler = Arc::new(CleanupScheduler::new(store, keys));
        let handle = scheduler.spawn(false);
        handle.shutdown().await;
    }
}
