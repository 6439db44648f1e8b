//! Error types for the embeddings system.

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// The embedding backend failed. Never retried here.
    #[error("embedding provider failed: {0}")]
    Provider(#[from] ProviderError),

    /// A record mapping is missing a required field or has the wrong shape.
    #[error("schema error: {0}")]
    Schema(String),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// No record with the given ID.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmbeddingError {
    /// Whether this error came from the embedding backend.
    pub fn is_provider_error(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

/// Failures reported by an [`EmbeddingProvider`](crate::EmbeddingProvider).
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Provider not configured.
    #[error("embedding provider not configured")]
    NotConfigured,

    /// API request failed.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Text too long for embedding.
    #[error("text too long: {length} characters, max {max_length}")]
    TextTooLong { length: usize, max_length: usize },

    /// The model itself failed (resource exhaustion, bad weights, ...).
    #[error("model error: {0}")]
    Model(String),
}
