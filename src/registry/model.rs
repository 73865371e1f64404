// Data model for the refresh-token registry.
// A TokenRecord is the only persisted entity; UserIndex and StatsCache are
// derived Redis structures (SET / HASH) addressed through `KeyNaming` and
// never materialized as Rust types of their own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque, caller-supplied metadata (device name, IP, UA, ...). The registry
/// never inspects these values.
pub type Meta = HashMap<String, serde_json::Value>;

/// The refresh token record stored, JSON-encoded, under `<tokenPrefix>:<token>`.
///
/// `camelCase` on the wire (`deviceId`, `issuedAt`) matches the field names
/// the Lua scripts in `adapter.rs` read via `cjson.decode` — the scripts
/// and this struct must agree on field names since both sides parse the
/// same stored JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub subject: String,
    pub device_id: String,
    pub issued_at: i64,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Input to `TokenRegistry::save` / `save_batch`.
#[derive(Debug, Clone)]
pub struct CreateTokenData {
    pub subject: String,
    pub device_id: String,
    pub meta: Option<Meta>,
}

/// Aggregated per-user view served from the stats cache hash.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct UserStats {
    pub active: u64,
    pub total: u64,
    pub devices: u64,
    pub last_updated: i64,
}

/// Totals and per-subject means across a set of subjects.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AggregateStats {
    pub total_active: u64,
    pub total_tokens: u64,
    pub total_devices: u64,
    pub mean_active: f64,
    pub mean_total: f64,
    pub mean_devices: f64,
}

/// Derives the three backend key families from the configured prefixes.
/// Scripts and the in-memory store both address state exclusively through
/// these helpers so key shape stays in one place.
#[derive(Debug, Clone)]
pub struct KeyNaming {
    pub token_prefix: String,
    pub user_prefix: String,
}

impl KeyNaming {
    pub fn new(token_prefix: impl Into<String>, user_prefix: impl Into<String>) -> Self {
        Self {
            token_prefix: token_prefix.into(),
            user_prefix: user_prefix.into(),
        }
    }

    pub fn token_key(&self, token: &str) -> String {
        format!("{}:{}", self.token_prefix, token)
    }

    pub fn user_index_key(&self, subject: &str) -> String {
        format!("{}:{}", self.user_prefix, subject)
    }

    pub fn stats_key(&self, subject: &str) -> String {
        format!("{}:stats:{}", self.user_prefix, subject)
    }

    pub fn user_index_scan_pattern(&self) -> String {
        format!("{}:*", self.user_prefix)
    }

    pub fn is_stats_key(&self, key: &str) -> bool {
        key.starts_with(&format!("{}:stats:", self.user_prefix))
    }

    /// Recovers the subject from a user-index key produced by `user_index_key`.
    pub fn subject_from_user_index_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&format!("{}:", self.user_prefix))
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_naming_round_trips_subject() {
        let keys = KeyNaming::new("refresh", "user_tokens");
        assert_eq!(keys.token_key("abc"), "refresh:abc");
        assert_eq!(keys.user_index_key("u1"), "user_tokens:u1");
        assert_eq!(keys.stats_key("u1"), "user_tokens:stats:u1");
        assert_eq!(
            keys.subject_from_user_index_key("user_tokens:u1"),
            Some("u1")
        );
        assert!(keys.is_stats_key("user_tokens:stats:u1"));
        assert!(!keys.is_stats_key("user_tokens:u1"));
    }
}
