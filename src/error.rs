//! Error taxonomy for the mirroring pipeline.
//!
//! Every failure that crosses a component boundary is classified into one of
//! these kinds before anyone acts on it. Policy hangs off the kind:
//! transient errors are retried, ambiguous outcomes are reconciled, and only
//! storage and configuration failures stop the process.

use thiserror::Error;

/// Classified failure of a mirroring component.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Network or venue hiccup; retry with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// We cannot tell whether the venue acted on a request.
    #[error("ambiguous outcome: {0}")]
    AmbiguousOutcome(String),

    /// Follower capital limits prevent the mirror.
    #[error("capital constraint: {0}")]
    CapitalConstraint(String),

    /// Invalid configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Durable state is unreachable; fatal to the process.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The venue refused the order.
    #[error("venue rejected order: {0}")]
    VenueRejection(String),

    /// A leader event we cannot interpret; fatal to that event only.
    #[error("malformed leader event: {0}")]
    MalformedEvent(String),
}

pub type MirrorResult<T> = std::result::Result<T, MirrorError>;

impl MirrorError {
    /// Whether the operation may be retried after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MirrorError::TransientNetwork(_))
    }

    /// Whether the process must stop rather than continue with the next event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MirrorError::StorageUnavailable(_) | MirrorError::Configuration(_)
        )
    }
}

impl From<sqlx::Error> for MirrorError {
    fn from(e: sqlx::Error) -> Self {
        MirrorError::StorageUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                MirrorError::VenueRejection(e.to_string())
            }
            _ => MirrorError::TransientNetwork(e.to_string()),
        }
    }
}

impl From<rust_decimal::Error> for MirrorError {
    fn from(e: rust_decimal::Error) -> Self {
        MirrorError::MalformedEvent(e.to_string())
    }
}
