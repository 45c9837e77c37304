// src/error.rs
//! Failure taxonomy for the ingestion pipeline.
//!
//! Record-level problems (`RejectReason`) are non-fatal and never abort a
//! provider or a cycle; transport-level problems (`FetchError`) are retried
//! or converted to an empty fetch at the provider boundary.

use thiserror::Error;

/// Outbound call failure. `Transport`, `Timeout` and 5xx `Status` values are
/// transient and eligible for retry; 4xx and `CircuitOpen` are not.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("circuit open for endpoint `{0}`")]
    CircuitOpen(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout => true,
            FetchError::Status(code) => *code >= 500,
            FetchError::CircuitOpen(_) => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

/// A payload that did not match the provider's expected shape at all.
/// Malformed individual rows/records are skipped silently instead; this is
/// only for responses where nothing could be extracted.
#[derive(Debug, Error)]
#[error("malformed {what} payload: {detail}")]
pub struct ParseError {
    pub what: &'static str,
    pub detail: String,
}

impl ParseError {
    pub fn new(what: &'static str, detail: impl ToString) -> Self {
        Self {
            what,
            detail: detail.to_string(),
        }
    }
}

/// Why the normalizer or validator refused a record.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, serde::Serialize)]
pub enum RejectReason {
    #[error("magnitude outside [0, 10]")]
    MagnitudeOutOfRange,
    #[error("depth outside [0, 1000] km")]
    DepthOutOfRange,
    #[error("coordinates outside geographic range")]
    CoordinatesOutOfRange,
    #[error("empty location label")]
    EmptyLocation,
    #[error("timestamp missing or unparseable")]
    UnparseableTimestamp,
    #[error("timestamp too far in the future")]
    TimestampInFuture,
    #[error("timestamp too far in the past")]
    TimestampTooOld,
    #[error("near-duplicate of an already published event")]
    DuplicateOfPublished,
    #[error("magnitude disagrees with other sources")]
    CrossSourceDisagreement,
    #[error("statistical outlier against the trailing window")]
    StatisticalOutlier,
    #[error("advisory assessment flagged an anomaly")]
    AdvisoryAnomaly,
    #[error("confidence below accept floor")]
    LowConfidence,
}

impl RejectReason {
    /// Hard reasons reject regardless of source trust.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            RejectReason::MagnitudeOutOfRange
                | RejectReason::DepthOutOfRange
                | RejectReason::CoordinatesOutOfRange
                | RejectReason::EmptyLocation
                | RejectReason::UnparseableTimestamp
                | RejectReason::TimestampInFuture
                | RejectReason::TimestampTooOld
        )
    }
}

/// Cache store failures. `Corrupt` triggers a purge and a fresh empty start.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
