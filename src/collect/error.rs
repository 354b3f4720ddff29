// src/collect/error.rs
use thiserror::Error;

/// Failure of a single upstream call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("upstream timed out")]
    Timeout,
    #[error("upstream rate-limited the request")]
    RateLimited,
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
    #[error("unknown postal code: {0}")]
    UnknownCode(String),
}

impl SourceError {
    /// Worth another attempt: timeouts, 5xx, upstream throttling, dropped connections.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Timeout | SourceError::RateLimited | SourceError::Transport(_) => true,
            SourceError::Status(code) => *code >= 500,
            SourceError::Malformed(_) | SourceError::UnknownCode(_) => false,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else if let Some(status) = e.status() {
            if status.as_u16() == 429 {
                SourceError::RateLimited
            } else {
                SourceError::Status(status.as_u16())
            }
        } else if e.is_decode() {
            SourceError::Malformed(e.to_string())
        } else {
            SourceError::Transport(e.to_string())
        }
    }
}

/// A page could not be fetched, after retries where the cause was transient.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("fetch failed for {code} after {attempts} attempt(s): {cause}")]
pub struct FetchError {
    pub code: String,
    pub attempts: u32,
    #[source]
    pub cause: SourceError,
}

/// Why a raw record was dropped by the normalizer.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
pub enum SkipReason {
    #[error("missing property id")]
    MissingPropertyId,
    #[error("missing street address")]
    MissingAddress,
    #[error("missing city")]
    MissingCity,
    #[error("missing state")]
    MissingState,
    #[error("missing zip code")]
    MissingZipCode,
    #[error("missing or unparseable sale date")]
    MissingSaleDate,
    #[error("missing or invalid sale price")]
    MissingSalePrice,
}
