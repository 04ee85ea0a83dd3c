use thiserror::Error;

/// Errors raised by the collector, persistence, and notification layers.
///
/// Transport errors are the only variant the retry combinators in
/// [`crate::extractor`] and [`crate::notifier`] treat as retryable; every
/// other variant is surfaced to the caller on first occurrence.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),

    #[error("schema file missing: {0}")]
    SchemaMissing(String),

    #[error("transport error (status {status:?}): {body}")]
    Transport { status: Option<u16>, body: String },

    #[error("configuration incomplete: {0}")]
    ConfigIncomplete(String),

    #[error("notification task has an event_time in the future")]
    FutureEventAnomaly,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}
