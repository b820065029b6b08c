//! Top-level error types for the chat kernel.

use std::time::Duration;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping the kernel's error taxonomy.
///
/// Every variant maps to a stable `code()` and, where applicable, carries the
/// adapter it originated from so callers can branch on it without matching
/// the `Display` string.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not acquire lease for thread {thread_id}")]
    Lock { thread_id: String },

    #[error("rate limited{}", retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    RateLimit { retry_after_ms: Option<u64> },

    #[error("not implemented: {feature}")]
    NotImplemented { feature: String },

    #[error("validation failed for adapter {adapter}: {message}")]
    Validation { adapter: String, message: String },

    #[error("authentication failed")]
    Authentication,

    #[error("permission denied")]
    Permission,

    #[error("resource not found")]
    ResourceNotFound,

    #[error("network error: {0}")]
    Network(String),

    #[error("adapter {adapter} error: {message}")]
    Adapter { adapter: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Short machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Lock { .. } => "lock_error",
            Error::RateLimit { .. } => "rate_limit",
            Error::NotImplemented { .. } => "not_implemented",
            Error::Validation { .. } => "validation",
            Error::Authentication => "authentication",
            Error::Permission => "permission",
            Error::ResourceNotFound => "resource_not_found",
            Error::Network(_) => "network",
            Error::Adapter { .. } => "adapter",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }

    /// The adapter this error originated from, if any.
    pub fn adapter_name(&self) -> Option<&str> {
        match self {
            Error::Validation { adapter, .. } => Some(adapter),
            Error::Adapter { adapter, .. } => Some(adapter),
            _ => None,
        }
    }

    pub fn lock(thread_id: impl Into<String>) -> Self {
        Error::Lock {
            thread_id: thread_id.into(),
        }
    }

    pub fn rate_limit(retry_after: Option<Duration>) -> Self {
        Error::RateLimit {
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        }
    }

    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Error::NotImplemented {
            feature: feature.into(),
        }
    }

    pub fn validation(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            adapter: adapter.into(),
            message: message.into(),
        }
    }

    pub fn adapter(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Adapter {
            adapter: adapter.into(),
            message: message.into(),
        }
    }

    /// Maps an outbound HTTP status code to the corresponding typed error.
    pub fn from_http_status(adapter: &str, status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            401 => Error::Authentication,
            403 => Error::Permission,
            404 => Error::ResourceNotFound,
            429 => Error::rate_limit(retry_after),
            _ => Error::adapter(adapter, format!("unexpected HTTP status {status}")),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}
