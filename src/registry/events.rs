// Event sink (spec §4.8): best-effort, non-blocking fan-out to registered
// observers. Grounded in the teacher's optional, swallowed-failure
// analytics recording in `src/services/rate_limit.rs`
// (`if let Some(analytics) = ...; if let Err(e) = ... { warn!(...) }`),
// generalized to a list of observer trait objects dispatched concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::model::TokenRecord;

const OBSERVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Registered at construction; observers are capability values, not base
/// classes (spec §9: "Event sink as dispatch list, not inheritance").
#[async_trait]
pub trait TokenObserver: Send + Sync {
    async fn on_token_created(&self, _token: &str, _record: &TokenRecord) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_token_accessed(&self, _token: &str, _record: &TokenRecord) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_token_revoked(&self, _token: &str, _subject: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fixed list of observers set once at construction; no dynamic
/// add/remove is needed per spec.
#[derive(Clone, Default)]
pub struct EventSink {
    observers: Vec<Arc<dyn TokenObserver>>,
}

impl EventSink {
    pub fn new(observers: Vec<Arc<dyn TokenObserver>>) -> Self {
        Self { observers }
    }

    pub fn notify_created(&self, token: &str, record: &TokenRecord) {
        for observer in self.observers.clone() {
            let token = token.to_string();
            let record = record.clone();
            tokio::spawn(async move {
                dispatch("onTokenCreated", async move {
                    observer.on_token_created(&token, &record).await
                })
                .await;
            });
        }
    }

    pub fn notify_accessed(&self, token: &str, record: &TokenRecord) {
        for observer in self.observers.clone() {
            let token = token.to_string();
            let record = record.clone();
            tokio::spawn(async move {
                dispatch("onTokenAccessed", async move {
                    observer.on_token_accessed(&token, &record).await
                })
                .await;
            });
        }
    }

    pub fn notify_revoked(&self, token: &str, subject: &str) {
        for observer in self.observers.clone() {
            let token = token.to_string();
            let subject = subject.to_string();
            tokio::spawn(async move {
                dispatch("onTokenRevoked", async move {
                    observer.on_token_revoked(&token, &subject).await
                })
                .await;
            });
        }
    }
}

async fn dispatch(event: &str, fut: impl std::future::Future<Output = anyhow::Result<()>>) {
    match tokio::time::timeout(OBSERVER_TIMEOUT, fut).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(event, error = %e, "observer failed"),
        Err(_) => warn!(event, "observer timed out"),
    }
}
