// Error taxonomy for the registry (spec §7) plus the domain/infrastructure
// classifier that the circuit breaker consults (spec §4.2).

use thiserror::Error;

/// Errors raised by a `TokenStore` implementation. These sit below the
/// circuit breaker: the breaker's classifier decides which variants count
/// toward its failure budget.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("operation timed out")]
    Timeout,

    #[error("token already exists")]
    AlreadyExists,

    #[error("subject does not own this token")]
    UserIdMismatch,

    #[error("malformed record payload: {0}")]
    MalformedPayload(String),

    #[error("script initialization failed: {0}")]
    Initialization(String),

    #[error("circuit breaker open")]
    CircuitOpen,
}

/// Errors surfaced by the registry facade (spec §7 kinds).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("token already exists")]
    AlreadyExists,

    #[error("token not found")]
    NotFound,

    #[error("device limit reached for subject")]
    DeviceLimitReached,

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<AdapterError> for RegistryError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::AlreadyExists => RegistryError::AlreadyExists,
            AdapterError::Initialization(msg) => RegistryError::Initialization(msg),
            AdapterError::CircuitOpen => RegistryError::CircuitOpen,
            other => RegistryError::OperationFailed(other.to_string()),
        }
    }
}

/// Decides whether an `AdapterError` counts toward the breaker's failure
/// budget. Domain errors (bad input, lost NX race) never trip the breaker;
/// only infrastructure failures do.
pub trait ErrorClassifier: Send + Sync {
    fn is_infrastructure_error(&self, err: &AdapterError) -> bool;
}

/// Default classifier matching spec §4.2: connection/timeout/script errors
/// are infrastructure, the registry's own domain errors are not.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn is_infrastructure_error(&self, err: &AdapterError) -> bool {
        matches!(
            err,
            AdapterError::Backend(_) | AdapterError::Timeout | AdapterError::Initialization(_)
        )
    }
}
