use pmq_storage::StoreError;
use thiserror::Error;

/// Failure of one completion or search call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("completion failed: {0}")]
    Failed(String),
}

impl CompletionError {
    /// Classify a free-form failure message, recognizing quota and rate-limit
    /// signatures.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_signature(&message) {
            CompletionError::RateLimited(message)
        } else {
            CompletionError::Failed(message)
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CompletionError::RateLimited(_))
    }
}

pub fn is_rate_limit_signature(message: &str) -> bool {
    let lowered = message.to_lowercase();
    [
        "quota",
        "rate limit",
        "rate-limit",
        "ratelimit",
        "rate_limit",
        "429",
        "too many requests",
        "resource_exhausted",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
}

/// Rejection of an analyzer-proposed filter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RewriteError {
    #[error("filter is empty")]
    Empty,
    #[error("only SELECT statements are allowed")]
    NotReadOnly,
    #[error("multiple statements are not allowed")]
    MultipleStatements,
    #[error("forbidden keyword {0}")]
    ForbiddenKeyword(String),
    #[error("unsupported construct: {0}")]
    Unsupported(String),
}

/// Request-level failures surfaced by `process_query`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("market data is temporarily unavailable ({0}); please try again shortly")]
    StoreUnavailable(String),
    #[error("the language model API is rate limited ({0}); wait a moment and try again")]
    RateLimited(String),
    #[error("semantic scoring failed for every batch: {0}")]
    ScoringFailed(String),
    #[error("no usable filter: {0}")]
    InvalidFilter(String),
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { .. } => QueryError::StoreUnavailable(err.to_string()),
            StoreError::InvalidQuery(message) => QueryError::InvalidFilter(message),
        }
    }
}
