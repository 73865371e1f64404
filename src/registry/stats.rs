// Stats engine (spec §4.5): per-user active/total/device aggregates,
// cached alongside the user index with a short TTL. Concurrency-capped
// fan-out mirrors the teacher's batching task in
// `src/services/clickhouse_analytics.rs`.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

use super::adapter::TokenStore;
use super::breaker::{BreakerError, CircuitBreaker};
use super::errors::AdapterError;
use super::model::{AggregateStats, KeyNaming, UserStats};

const BATCH_CONCURRENCY: usize = 10;
/// Threshold past which a subject's token count is logged as excessive
/// (spec §4.5: "excessive tokens for subject").
const EXCESSIVE_TOKEN_THRESHOLD: u64 = 200;

#[derive(Debug, Clone, Copy)]
pub struct StatsOptions {
    pub enable_caching: bool,
    pub max_batch_size: u64,
    pub stats_cache_ttl_secs: u64,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            enable_caching: true,
            max_batch_size: 100,
            stats_cache_ttl_secs: 300,
        }
    }
}

pub struct StatsEngine {
    store: Arc<dyn TokenStore>,
    keys: KeyNaming,
    max_devices_per_user: u64,
    /// Every call to the adapter's `stats_optimized` script is routed
    /// through this breaker (spec §4.3: "one breaker per operation name,
    /// e.g. saveToken, stats, revokeAll" — `stats` is this one).
    breaker: Arc<CircuitBreaker>,
}

impl StatsEngine {
    pub fn new(
        store: Arc<dyn TokenStore>,
        keys: KeyNaming,
        max_devices_per_user: u64,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            keys,
            max_devices_per_user,
            breaker,
        }
    }

    async fn stats_with_options(
        &self,
        subject: &str,
        opts: StatsOptions,
    ) -> Result<UserStats, AdapterError> {
        let user_index_key = self.keys.user_index_key(subject);
        let stats_key = if opts.enable_caching {
            self.keys.stats_key(subject)
        } else {
            String::new()
        };
        let store = self.store.clone();
        let raw = self
            .breaker
            .call(async move {
                store
                    .stats_optimized(
                        &user_index_key,
                        opts.max_batch_size,
                        &stats_key,
                        opts.stats_cache_ttl_secs,
                    )
                    .await
            })
            .await
            .map_err(|e| match e {
                BreakerError::Open => AdapterError::CircuitOpen,
                BreakerError::Inner(inner) => inner,
            })?;

        if raw.total > EXCESSIVE_TOKEN_THRESHOLD {
            warn!(subject, total = raw.total, "excessive tokens for subject");
        }

        Ok(UserStats {
            active: raw.active,
            total: raw.total,
            devices: raw.devices,
            last_updated: super::model::now_millis(),
        })
    }

    /// `userStats(subject, opts)`.
    pub async fn user_stats(
        &self,
        subject: &str,
        opts: StatsOptions,
    ) -> Result<UserStats, AdapterError> {
        self.stats_with_options(subject, opts).await
    }

    /// `forcedStats(subject, opts)` — invalidates the cache before reading.
    pub async fn forced_stats(
        &self,
        subject: &str,
        opts: StatsOptions,
    ) -> Result<UserStats, AdapterError> {
        let stats_key = self.keys.stats_key(subject);
        let _ = self.store.delete_key(&stats_key).await;
        self.stats_with_options(subject, opts).await
    }

    /// `batchStats([subjects], opts)` — fan-out bounded to `BATCH_CONCURRENCY`
    /// concurrent lookups. A failing subject never contaminates the others:
    /// its entry is reported as an all-zero `UserStats`.
    pub async fn batch_stats(
        &self,
        subjects: &[String],
        opts: StatsOptions,
    ) -> Vec<(String, UserStats)> {
        let semaphore = Arc::new(Semaphore::new(BATCH_CONCURRENCY));
        let mut tasks = Vec::with_capacity(subjects.len());

        for subject in subjects {
            let semaphore = semaphore.clone();
            let subject = subject.clone();
            let store = self.store.clone();
            let keys = self.keys.clone();
            let max_devices = self.max_devices_per_user;
            let breaker = self.breaker.clone();
            let engine = StatsEngine {
                store,
                keys,
                max_devices_per_user: max_devices,
                breaker,
            };
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let stats = engine
                    .stats_with_options(&subject, opts)
                    .await
                    .unwrap_or_default();
                (subject, stats)
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(pair) => results.push(pair),
                Err(e) => warn!(error = %e, "stats batch task panicked"),
            }
        }
        results
    }

    /// `aggregate([subjects])` — totals plus arithmetic means.
    pub async fn aggregate(&self, subjects: &[String], opts: StatsOptions) -> AggregateStats {
        let results = self.batch_stats(subjects, opts).await;
        let count = results.len().max(1) as f64;
        let mut agg = AggregateStats::default();
        for (_, stats) in &results {
            agg.total_active += stats.active;
            agg.total_tokens += stats.total;
            agg.total_devices += stats.devices;
        }
        agg.mean_active = agg.total_active as f64 / count;
        agg.mean_total = agg.total_tokens as f64 / count;
        agg.mean_devices = agg.total_devices as f64 / count;
        agg
    }

    /// `deviceCount(subject)`.
    pub async fn device_count(&self, subject: &str) -> u64 {
        self.stats_with_options(subject, StatsOptions::default())
            .await
            .map(|s| s.devices)
            .unwrap_or(0)
    }

    /// `atDeviceLimit(subject)`.
    pub async fn at_device_limit(&self, subject: &str) -> bool {
        self.device_count(subject).await >= self.max_devices_per_user
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::adapter::{BatchEntry, InMemoryTokenStore, RawStats};
    use crate::registry::breaker::BreakerConfig;
    use crate::registry::model::{now_millis, TokenRecord};
    use async_trait::async_trait;

    /// A `TokenStore` whose `stats_optimized` always fails with an
    /// infrastructure error, used to prove the stats breaker trips
    /// independently of the other per-operation breakers.
    struct AlwaysFailingStatsStore;

    #[async_trait]
    impl TokenStore for AlwaysFailingStatsStore {
        async fn save_token(&self, _: &str, _: &str, _: u64, _: &str, _: &str) -> Result<(), AdapterError> {
            unimplemented!("not exercised by the stats breaker test")
        }
        async fn save_batch(&self, _: &str, _: &[BatchEntry]) -> Result<u64, AdapterError> {
            unimplemented!("not exercised by the stats breaker test")
        }
        async fn mark_token_used(&self, _: &str, _: &str, _: &str, _: u64) -> Result<bool, AdapterError> {
            unimplemented!("not exercised by the stats breaker test")
        }
        async fn delete_token(&self, _: &str, _: &str, _: &str) -> Result<bool, AdapterError> {
            unimplemented!("not exercised by the stats breaker test")
        }
        async fn revoke_all(&self, _: &str) -> Result<u64, AdapterError> {
            unimplemented!("not exercised by the stats breaker test")
        }
        async fn revoke_by_device(&self, _: &str, _: &str) -> Result<u64, AdapterError> {
            unimplemented!("not exercised by the stats breaker test")
        }
        async fn cleanup_expired(&self, _: &str) -> Result<u64, AdapterError> {
            unimplemented!("not exercised by the stats breaker test")
        }
        async fn stats_optimized(&self, _: &str, _: u64, _: &str, _: u64) -> Result<RawStats, AdapterError> {
            Err(AdapterError::Timeout)
        }
        async fn scan_user_indices(&self, _: &str, _: u64, _: u64) -> Result<(u64, Vec<String>), AdapterError> {
            unimplemented!("not exercised by the stats breaker test")
        }
        async fn get(&self, _: &str) -> Result<Option<String>, AdapterError> {
            unimplemented!("not exercised by the stats breaker test")
        }
        async fn delete_key(&self, _: &str) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn health(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn stats_calls_are_routed_through_a_dedicated_breaker() {
        let store: Arc<dyn TokenStore> = Arc::new(AlwaysFailingStatsStore);
        let keys = KeyNaming::new("refresh", "user_tokens");
        let breaker = Arc::new(CircuitBreaker::new(
            "stats",
            BreakerConfig {
                minimum_calls: 4,
                ..BreakerConfig::default()
            },
        ));
        let engine = StatsEngine::new(store, keys, 10, breaker.clone());

        for _ in 0..4 {
            let result = engine.user_stats("u", StatsOptions::default()).await;
            assert!(matches!(result, Err(AdapterError::Timeout)));
        }
        assert!(breaker.is_open().await);

        let result = engine.user_stats("u", StatsOptions::default()).await;
        assert!(matches!(result, Err(AdapterError::CircuitOpen)));
    }

    fn engine() -> (StatsEngine, Arc<InMemoryTokenStore>) {
        let store = Arc::new(InMemoryTokenStore::new());
        let keys = KeyNaming::new("refresh", "user_tokens");
        let breaker = Arc::new(CircuitBreaker::new("stats", Default::default()));
        let engine = StatsEngine::new(store.clone(), keys, 10, breaker);
        (engine, store)
    }

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
    async fn device_count_matches_distinct_devices() {
        let (engine, store) = engine();
        store
            .save_token("refresh:a", &record("u", "d1"), 60, "u", "user_tokens:u")
            .await
            .unwrap();
        store
            .save_token("refresh:b", &record("u", "d2"), 60, "u", "user_tokens:u")
            .await
            .unwrap();
        assert_eq!(engine.device_count("u").await, 2);
    }

    #[tokio::test]
    async fn batch_stats_isolates_per_subject_failures() {
        let (engine, store) = engine();
        store
            .save_token("refresh:a", &record("u1", "d1"), 60, "u1", "user_tokens:u1")
            .await
            .unwrap();

        let subjects = vec!["u1".to_string(), "unknown".to_string()];
        let results = engine.batch_stats(&subjects, StatsOptions::default()).await;
        assert_eq!(results.len(), 2);
        let unknown = results.iter().find(|(s, _)| s == "unknown").unwrap();
        assert_eq!(unknown.1.total, 0);
    }

    #[tokio::test]
    async fn save_batch_counts_only_survivors() {
        let (_engine, store) = engine();
        let entries = vec![
            BatchEntry {
                key: "refresh:a".into(),
                value: record("u", "d1"),
                ttl_secs: 60,
            },
            BatchEntry {
                key: "refresh:a".into(),
                value: record("u", "d1"),
                ttl_secs: 60,
            },
        ];
        let saved = store.save_batch("user_tokens:u", &entries).await.unwrap();
        assert_eq!(saved, 1);
    }
}
