// Demo binary for the refresh-token registry. Not a deliverable surface —
// the registry is consumed in-process (spec §6); this wires together
// logging, configuration, and the registry facade the way a real caller
// would, against an in-memory backend so it runs without a live Redis.

use std::sync::Arc;

use refresh_token_registry::{
    CreateTokenData, EventSink, InMemoryTokenStore, RegistryConfig, TokenRegistry, TokenStore,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refresh_token_registry=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenv::dotenv().ok();

    let config = RegistryConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "invalid registry configuration, falling back to defaults");
        RegistryConfig::default()
    });

    info!("starting refresh-token registry demo");

    let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
    let registry = TokenRegistry::new(store, config, EventSink::default());

    registry
        .save(
            "demo-token",
            CreateTokenData {
                subject: "demo-user".to_string(),
                device_id: "demo-device".to_string(),
                meta: None,
            },
        )
        .await?;

    let record = registry.get_token_data("demo-token").await?;
    info!(?record, "issued a refresh token");

    let stats = registry.user_stats("demo-user").await?;
    info!(?stats, "current stats for demo-user");

    Ok(())
}
