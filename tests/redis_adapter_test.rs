// Integration tests against a live Redis-compatible backend, grounded in
// the teacher's `tests/redis_pool_test.rs` (pool creation, health check,
// connection management exercised against a real server via `.env.test`).
// These require `REGISTRY_REDIS_URL` to point at a reachable instance and
// are not run as part of the default in-memory test suite.

use std::time::Duration;

use refresh_token_registry::{KeyNaming, RedisTokenStore, TokenStore};

fn redis_url() -> String {
    std::env::var("REGISTRY_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn connect() -> RedisTokenStore {
    dotenv::from_filename(".env.test").ok();
    RedisTokenStore::connect(
        &redis_url(),
        4,
        3,
        Duration::from_millis(50),
        KeyNaming::new("test_refresh", "test_user_tokens"),
    )
    .await
    .expect("failed to connect to Redis for adapter integration tests")
}

#[tokio::test]
#[ignore = "requires a reachable Redis instance; run with `cargo test -- --ignored`"]
async fn health_reports_true_against_a_live_server() {
    let store = connect().await;
    assert!(store.health().await);
}

#[tokio::test]
#[ignore = "requires a reachable Redis instance; run with `cargo test -- --ignored`"]
async fn save_then_mark_used_then_delete_round_trips_through_scripts() {
    let store = connect().await;
    let keys = store.keys().clone();
    let token = format!("adapter-it-{}", std::process::id());
    let key = keys.token_key(&token);
    let user_index_key = keys.user_index_key("it-user");

    store.delete_key(&key).await.ok();

    let value = serde_json::json!({
        "subject": "it-user",
        "deviceId": "it-device",
        "issuedAt": 1,
        "used": false,
    })
    .to_string();

    store
        .save_token(&key, &value, 60, "it-user", &user_index_key)
        .await
        .expect("save_token should succeed against a fresh key");

    let second = store
        .save_token(&key, &value, 60, "it-user", &user_index_key)
        .await;
    assert!(second.is_err(), "NX should reject the second save");

    let used = store
        .mark_token_used(&key, "it-user", &user_index_key, 5)
        .await
        .expect("mark_token_used should run");
    assert!(used);

    let deleted = store
        .delete_token(&key, "it-user", &user_index_key)
        .await
        .expect("delete_token should run");
    assert!(deleted);

    store.delete_key(&user_index_key).await.ok();
}

#[tokio::test]
#[ignore = "requires a reachable Redis instance; run with `cargo test -- --ignored`"]
async fn scan_user_indices_never_uses_keys_and_completes_a_full_cursor_pass() {
    let store = connect().await;
    let pattern = store.keys().user_index_scan_pattern();

    let mut cursor = 0u64;
    let mut passes = 0;
    loop {
        let (next, _keys) = store
            .scan_user_indices(&pattern, cursor, 50)
            .await
            .expect("scan_user_indices should run");
        cursor = next;
        passes += 1;
        if cursor == 0 || passes > 1000 {
            break;
        }
    }
    assert!(passes <= 1000, "cursor-based scan should terminate");
}
