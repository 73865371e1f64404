//! Refresh-token registry core: issue, validate, rotate, revoke, and
//! expire opaque refresh tokens against a Redis-compatible key-value
//! backend. The only contract consumed by external collaborators (HTTP
//! handlers, JWT signing, the user database — all out of scope here) is
//! `TokenRegistry`.

pub mod registry;

pub use registry::{
    AdapterError, AggregateStats, BatchEntry, BreakerConfig, BreakerError, BreakerObserver,
    CircuitBreaker, CleanupHandle, CleanupScheduler, CreateTokenData, DefaultErrorClassifier,
    ErrorClassifier, EventSink, InMemoryTokenStore, KeyNaming, Meta, RawStats, RedisTokenStore,
    RegistryConfig, RegistryError, StatsEngine, StatsOptions, TokenObserver, TokenRecord,
    TokenRegistry, TokenStore, UserStats,
};
