// Registry facade (spec §4.7): the only surface external collaborators
// touch. Orchestrates validator -> device-limit check -> breaker-wrapped
// adapter -> event sink -> stats invalidation, grounded in the
// orchestration shape of `src/services/rate_limit.rs::RateLimitService`
// (holds a pool + config, one method per public operation,
// `#[instrument]` throughout).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::instrument;

use super::adapter::{BatchEntry, TokenStore};
use super::breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use super::config::RegistryConfig;
use super::errors::RegistryError;
use super::events::EventSink;
use super::model::{now_millis, CreateTokenData, KeyNaming, TokenRecord};
use super::stats::{StatsEngine, StatsOptions};
use super::validator;

/// Per-operation circuit breakers, lazily created the first time an
/// operation name is used (spec §4.3: "one breaker per operation name").
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<&'static str, Arc<CircuitBreaker>>>,
    default_config: BreakerConfig,
    overrides: HashMap<&'static str, BreakerConfig>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig, overrides: HashMap<&'static str, BreakerConfig>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            overrides,
        }
    }

    async fn get(&self, operation: &'static str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(operation) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(operation)
            .or_insert_with(|| {
                let config = self.overrides.get(operation).cloned().unwrap_or_else(|| self.default_config.clone());
                Arc::new(CircuitBreaker::new(operation, config))
            })
            .clone()
    }
}

fn breaker_overrides() -> HashMap<&'static str, BreakerConfig> {
    let mut overrides = HashMap::new();
    overrides.insert(
        "stats",
        BreakerConfig {
            timeout: std::time::Duration::from_secs(8),
            ..BreakerConfig::default()
        },
    );
    overrides.insert(
        "saveBatch",
        BreakerConfig {
            timeout: std::time::Duration::from_secs(10),
            ..BreakerConfig::default()
        },
    );
    overrides.insert(
        "health",
        BreakerConfig {
            timeout: std::time::Duration::from_secs(2),
            ..BreakerConfig::default()
        },
    );
    overrides
}

pub struct TokenRegistry {
    store: Arc<dyn TokenStore>,
    breakers: BreakerRegistry,
    stats: StatsEngine,
    events: EventSink,
    keys: KeyNaming,
    config: RegistryConfig,
}

impl TokenRegistry {
    pub fn new(store: Arc<dyn TokenStore>, config: RegistryConfig, events: EventSink) -> Self {
        let keys = KeyNaming::new(config.token_prefix.clone(), config.user_prefix.clone());
        let overrides = breaker_overrides();
        let stats_breaker = Arc::new(CircuitBreaker::new(
            "stats",
            overrides.get("stats").cloned().unwrap_or_default(),
        ));
        let stats = StatsEngine::new(
            store.clone(),
            keys.clone(),
            config.max_devices_per_user,
            stats_breaker,
        );
        let breakers = BreakerRegistry::new(
            BreakerConfig {
                timeout: config.breaker_timeout,
                error_threshold_percentage: config.breaker_threshold_percentage,
                reset_timeout: config.breaker_reset_timeout,
                ..BreakerConfig::default()
            },
            overrides,
        );
        Self {
            store,
            breakers,
            stats,
            events,
            keys,
            config,
        }
    }

    pub fn keys(&self) -> &KeyNaming {
        &self.keys
    }

    pub fn stats_engine(&self) -> &StatsEngine {
        &self.stats
    }

    async fn call<T, Fut>(&self, operation: &'static str, fut: Fut) -> Result<T, RegistryError>
    where
        Fut: std::future::Future<Output = Result<T, super::errors::AdapterError>>,
    {
        let breaker = self.breakers.get(operation).await;
        breaker.call(fut).await.map_err(|e| match e {
            BreakerError::Open => RegistryError::CircuitOpen,
            BreakerError::Inner(inner) => RegistryError::from(inner),
        })
    }

    /// `save(token, {subject, deviceId, meta?})`.
    #[instrument(skip(self, data))]
    pub async fn save(&self, token: &str, data: CreateTokenData) -> Result<(), RegistryError> {
        validator::validate_token(token, self.config.max_token_length)?;
        validator::validate_create_data(&data)?;

        if self.stats.at_device_limit(&data.subject).await {
            return Err(RegistryError::DeviceLimitReached);
        }

        let record = TokenRecord {
            subject: data.subject.clone(),
            device_id: data.device_id.clone(),
            issued_at: now_millis(),
            used: false,
            meta: data.meta.clone(),
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| RegistryError::OperationFailed(e.to_string()))?;
        let key = self.keys.token_key(token);
        let user_index_key = self.keys.user_index_key(&data.subject);

        let store = self.store.clone();
        let subject = data.subject.clone();
        let ttl = self.config.ttl_secs;
        self.call("saveToken", async move {
            store
                .save_token(&key, &value, ttl, &subject, &user_index_key)
                .await
        })
        .await?;

        self.invalidate_stats(&data.subject).await;
        self.events.notify_created(token, &record);
        Ok(())
    }

    /// `saveBatch([{token,data}])` — groups by subject, one `saveBatch`
    /// script per subject, per-subject groups never cross-contaminate.
    #[instrument(skip(self, items))]
    pub async fn save_batch(
        &self,
        items: Vec<(String, CreateTokenData)>,
    ) -> Result<u64, RegistryError> {
        let validated = validator::validate_batch(
            items,
            self.config.max_batch_size,
            self.config.max_token_length,
            |(token, _)| token.as_str(),
        )?;

        let mut grouped: HashMap<String, Vec<(String, CreateTokenData)>> = HashMap::new();
        for (token, data) in validated.survivors {
            grouped.entry(data.subject.clone()).or_default().push((token, data));
        }

        let mut total = 0u64;
        for (subject, entries) in grouped {
            let user_index_key = self.keys.user_index_key(&subject);
            let mut batch_entries = Vec::with_capacity(entries.len());
            for (token, data) in &entries {
                let record = TokenRecord {
                    subject: data.subject.clone(),
                    device_id: data.device_id.clone(),
                    issued_at: now_millis(),
                    used: false,
                    meta: data.meta.clone(),
                };
                let value = serde_json::to_string(&record)
                    .map_err(|e| RegistryError::OperationFailed(e.to_string()))?;
                batch_entries.push(BatchEntry {
                    key: self.keys.token_key(token),
                    value,
                    ttl_secs: self.config.ttl_secs,
                });
            }

            let store = self.store.clone();
            let count = self
                .call("saveBatch", async move {
                    store.save_batch(&user_index_key, &batch_entries).await
                })
                .await?;
            total += count;
            self.invalidate_stats(&subject).await;
        }
        Ok(total)
    }

    /// `getTokenData(token)` — `null` for blank/unknown tokens; malformed
    /// payloads surface as `Validation`. Per §9's resolved open question,
    /// a used-but-not-yet-expired token still returns its record.
    #[instrument(skip(self))]
    pub async fn get_token_data(&self, token: &str) -> Result<Option<TokenRecord>, RegistryError> {
        if validator::validate_token(token, self.config.max_token_length).is_err() {
            return Ok(None);
        }
        let key = self.keys.token_key(token);
        let store = self.store.clone();
        let raw = self.call("get", async move { store.get(&key).await }).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: TokenRecord = serde_json::from_str(&raw)
            .map_err(|e| RegistryError::Validation(format!("malformed record payload: {e}")))?;
        validator::validate_record(&record)?;
        self.events.notify_accessed(token, &record);
        Ok(Some(record))
    }

    /// `markUsed(token, subject)` — true on exactly the 0->1 transition.
    #[instrument(skip(self))]
    pub async fn mark_used(&self, token: &str, subject: &str) -> Result<bool, RegistryError> {
        validator::validate_token(token, self.config.max_token_length)?;
        let key = self.keys.token_key(token);
        let user_index_key = self.keys.user_index_key(subject);
        let store = self.store.clone();
        let subject_owned = subject.to_string();
        let used_ttl = self.config.used_token_ttl_secs;
        let transitioned = self
            .call("markTokenUsed", async move {
                store
                    .mark_token_used(&key, &subject_owned, &user_index_key, used_ttl)
                    .await
            })
            .await?;
        if transitioned {
            self.invalidate_stats(subject).await;
        }
        Ok(transitioned)
    }

    /// `delete(token, subject)` — idempotent, only deletes on subject match.
    #[instrument(skip(self))]
    pub async fn delete(&self, token: &str, subject: &str) -> Result<bool, RegistryError> {
        validator::validate_token(token, self.config.max_token_length)?;
        let key = self.keys.token_key(token);
        let user_index_key = self.keys.user_index_key(subject);
        let store = self.store.clone();
        let subject_owned = subject.to_string();
        let deleted = self
            .call("deleteToken", async move {
                store.delete_token(&key, &subject_owned, &user_index_key).await
            })
            .await?;
        if deleted {
            self.invalidate_stats(subject).await;
            self.events.notify_revoked(token, subject);
        }
        Ok(deleted)
    }

    /// `revokeAllUserTokens(subject)`.
    #[instrument(skip(self))]
    pub async fn revoke_all_user_tokens(&self, subject: &str) -> Result<u64, RegistryError> {
        let user_index_key = self.keys.user_index_key(subject);
        let store = self.store.clone();
        let count = self
            .call("revokeAll", async move { store.revoke_all(&user_index_key).await })
            .await?;
        self.invalidate_stats(subject).await;
        self.events.notify_revoked("*", subject);
        Ok(count)
    }

    /// `revokeDeviceTokens(subject, deviceId)`.
    #[instrument(skip(self))]
    pub async fn revoke_device_tokens(
        &self,
        subject: &str,
        device_id: &str,
    ) -> Result<u64, RegistryError> {
        let user_index_key = self.keys.user_index_key(subject);
        let store = self.store.clone();
        let device_owned = device_id.to_string();
        let count = self
            .call("revokeByDevice", async move {
                store.revoke_by_device(&user_index_key, &device_owned).await
            })
            .await?;
        if count > 0 {
            self.invalidate_stats(subject).await;
            self.events.notify_revoked(device_id, subject);
        }
        Ok(count)
    }

    /// `exists(token)` — swallows errors, returns false on any failure.
    #[instrument(skip(self))]
    pub async fn exists(&self, token: &str) -> bool {
        matches!(self.get_token_data(token).await, Ok(Some(_)))
    }

    /// `isUsed(token)` — defaults to false on any failure.
    #[instrument(skip(self))]
    pub async fn is_used(&self, token: &str) -> bool {
        matches!(self.get_token_data(token).await, Ok(Some(record)) if record.used)
    }

    async fn invalidate_stats(&self, subject: &str) {
        let stats_key = self.keys.stats_key(subject);
        let _ = self.store.delete_key(&stats_key).await;
    }

    /// Convenience over `StatsEngine`, exposed on the facade per spec §4.7's
    /// table implicitly relying on device-limit/stat reads.
    pub async fn device_count(&self, subject: &str) -> u64 {
        self.stats.device_count(subject).await
    }

    pub async fn user_stats(&self, subject: &str) -> Result<super::model::UserStats, RegistryError> {
        self.stats
            .user_stats(subject, StatsOptions {
                enable_caching: true,
                max_batch_size: self.config.max_batch_size as u64,
                stats_cache_ttl_secs: self.config.stats_cache_ttl_secs,
            })
            .await
            .map_err(RegistryError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::adapter::InMemoryTokenStore;

    fn registry() -> TokenRegistry {
        let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
        TokenRegistry::new(store, RegistryConfig::default(), EventSink::default())
    }

    fn data(subject: &str, device_id: &str) -> CreateTokenData {
        CreateTokenData {
            subject: subject.to_string(),
            device_id: device_id.to_string(),
            meta: None,
        }
    }

    #[tokio::test]
    async fn s1_lifecycle() {
        let registry = registry();
        registry.save("t1", data("u", "d")).await.unwrap();
        assert!(!registry.get_token_data("t1").await.unwrap().unwrap().used);
        assert!(registry.mark_used("t1", "u").await.unwrap());
        assert!(registry.get_token_data("t1").await.unwrap().unwrap().used);
        assert!(registry.delete("t1", "u").await.unwrap());
        assert!(registry.get_token_data("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn s2_multi_device_revocation() {
        let registry = registry();
        registry.save("mobile", data("u", "mobile")).await.unwrap();
        registry.save("web", data("u", "web")).await.unwrap();
        assert_eq!(registry.revoke_device_tokens("u", "web").await.unwrap(), 1);
        assert!(registry.get_token_data("mobile").await.unwrap().is_some());
        assert!(registry.get_token_data("web").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn s3_logout_all() {
        let registry = registry();
        registry.save("a", data("u", "d1")).await.unwrap();
        registry.save("b", data("u", "d2")).await.unwrap();
        assert_eq!(registry.device_count("u").await, 2);
        assert_eq!(registry.revoke_all_user_tokens("u").await.unwrap(), 2);
        assert_eq!(registry.device_count("u").await, 0);
    }

    #[tokio::test]
    async fn s4_device_limit() {
        let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
        let mut config = RegistryConfig::default();
        config.max_devices_per_user = 2;
        let registry = TokenRegistry::new(store, config, EventSink::default());

        registry.save("a", data("u", "d1")).await.unwrap();
        registry.save("b", data("u", "d2")).await.unwrap();
        let third = registry.save("c", data("u", "d3")).await;
        assert!(matches!(third, Err(RegistryError::DeviceLimitReached)));

        registry.revoke_device_tokens("u", "d1").await.unwrap();
        registry.save("c", data("u", "d3")).await.unwrap();
    }

    #[tokio::test]
    async fn uniqueness_invariant() {
        let registry = registry();
        registry.save("t1", data("u", "d")).await.unwrap();
        let second = registry.save("t1", data("u", "d")).await;
        assert!(matches!(second, Err(RegistryError::AlreadyExists)));
    }

    #[tokio::test]
    async fn ownership_enforcement() {
        let registry = registry();
        registry.save("t1", data("u", "d")).await.unwrap();
        assert!(!registry.mark_used("t1", "other").await.unwrap());
        assert!(!registry.delete("t1", "other").await.unwrap());
    }

    #[tokio::test]
    async fn exists_and_is_used_swallow_errors() {
        let registry = registry();
        assert!(!registry.exists("missing").await);
        assert!(!registry.is_used("missing").await);

        registry.save("t1", data("u", "d")).await.unwrap();
        assert!(registry.exists("t1").await);
        assert!(!registry.is_used("t1").await);
        registry.mark_used("t1", "u").await.unwrap();
        assert!(registry.is_used("t1").await);
    }
}
