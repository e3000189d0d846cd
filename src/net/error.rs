//! Error taxonomy for network and download operations.
//!
//! Every failure maps to a stable kind string recorded in the work
//! journal's history trail, so operators can grep `work.json` files for
//! why a candidate failed.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::budget::BudgetExceeded;

/// Errors surfaced by the HTTP executor and download workers.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Non-retryable HTTP client error (4xx except 429).
    #[error("HTTP {status} for {url}")]
    ClientError { url: String, status: u16 },

    /// HTTP 429 after the retry budget was spent.
    #[error("rate limited by server for {url}")]
    RateLimited { url: String },

    /// Transient failure: 5xx, connection reset, DNS, read timeout.
    #[error("transient error for {url}: {detail}")]
    Transient { url: String, detail: String },

    /// The provider's circuit breaker is open.
    #[error("circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    /// The provider's daily quota is spent.
    #[error("quota exhausted for provider {provider}; resets at {ready_at}")]
    QuotaExhausted {
        provider: String,
        ready_at: DateTime<Utc>,
        wait_for_reset: bool,
    },

    /// A download budget limit was hit.
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    /// The worker deadline elapsed and the task was cancelled.
    #[error("download timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Local filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The URL could not be parsed or is unusable.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// All attempts were spent; wraps the last error observed.
    #[error("gave up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    /// Provider payload could not be interpreted.
    #[error("unusable response from {url}: {detail}")]
    BadPayload { url: String, detail: String },

    /// TLS certificate verification failed and policy forbids retrying
    /// without verification.
    #[error("TLS verification failed for {url}")]
    TlsVerification { url: String },

    /// The HTTP client itself could not be constructed.
    #[error("failed to initialize HTTP client: {0}")]
    ClientInit(String),
}

impl FetchError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable kind string for journal history and summaries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientError { .. } => "client-error",
            Self::RateLimited { .. } => "rate-limited",
            Self::Transient { .. } => "transient",
            Self::CircuitOpen { .. } => "circuit-open",
            Self::QuotaExhausted { .. } => "quota-exhausted",
            Self::BudgetExceeded(_) => "budget-exceeded",
            Self::Timeout { .. } => "timeout",
            Self::Io { .. } => "io-error",
            Self::InvalidUrl { .. } => "invalid-url",
            Self::BadPayload { .. } => "bad-payload",
            Self::TlsVerification { .. } => "tls-verification",
            Self::ClientInit(_) => "client-init",
            Self::Exhausted { last, .. } => last.kind(),
        }
    }

    /// Whether this terminal outcome counts against the circuit breaker.
    ///
    /// Only exhausted retryable errors trip the breaker: a 4xx or a budget
    /// refusal says nothing about provider health.
    #[must_use]
    pub fn is_breaker_trip(&self) -> bool {
        match self {
            Self::Exhausted { last, .. } => {
                matches!(**last, Self::RateLimited { .. } | Self::Transient { .. })
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(
            FetchError::ClientError {
                url: "u".into(),
                status: 404
            }
            .kind(),
            "client-error"
        );
        assert_eq!(FetchError::Timeout { seconds: 30 }.kind(), "timeout");
        assert_eq!(
            FetchError::CircuitOpen {
                provider: "ia".into()
            }
            .kind(),
            "circuit-open"
        );
    }

    #[test]
    fn test_exhausted_reports_inner_kind() {
        let err = FetchError::Exhausted {
            url: "u".into(),
            attempts: 5,
            last: Box::new(FetchError::Transient {
                url: "u".into(),
                detail: "503".into(),
            }),
        };
        assert_eq!(err.kind(), "transient");
    }

    #[test]
    fn test_breaker_trip_classification() {
        let exhausted_transient = FetchError::Exhausted {
            url: "u".into(),
            attempts: 5,
            last: Box::new(FetchError::Transient {
                url: "u".into(),
                detail: "reset".into(),
            }),
        };
        assert!(exhausted_transient.is_breaker_trip());

        let exhausted_rate = FetchError::Exhausted {
            url: "u".into(),
            attempts: 5,
            last: Box::new(FetchError::RateLimited { url: "u".into() }),
        };
        assert!(exhausted_rate.is_breaker_trip());

        let client = FetchError::ClientError {
            url: "u".into(),
            status: 404,
        };
        assert!(!client.is_breaker_trip());

        let transient_not_exhausted = FetchError::Transient {
            url: "u".into(),
            detail: "tls".into(),
        };
        assert!(!transient_not_exhausted.is_breaker_trip());
    }
}
