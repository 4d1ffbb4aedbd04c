use std::sync::Arc;

use thiserror::Error;

/// A boxed error as returned by producers and event recorders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the caches in this crate.
///
/// The error is cheap to clone, as a single producer failure is fanned out to every caller that
/// was waiting on the same in-flight computation.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The cache was constructed with an unusable configuration.
    ///
    /// This only happens at construction time and is never recovered from.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
    /// The key is not present in the store, or has already expired.
    #[error("not found")]
    NotFound,
    /// The producer failed to create a value.
    ///
    /// The error is forwarded as-is, so callers see the error of the underlying provider.
    #[error(transparent)]
    Producer(Arc<dyn std::error::Error + Send + Sync + 'static>),
    /// The producer panicked while creating a value.
    #[error("producer panicked")]
    ProducerPanicked,
    /// The caller stopped waiting for the value.
    #[error("cancelled while waiting for the value")]
    Cancelled,
}

impl CacheError {
    /// Wraps a producer error.
    pub fn producer<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Producer(Arc::from(err.into()))
    }

    /// Returns a short, static name for this error to be used in metrics tags.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            CacheError::InvalidConfig(_) => "invalid_config",
            CacheError::NotFound => "not_found",
            CacheError::Producer(_) => "producer",
            CacheError::ProducerPanicked => "panicked",
            CacheError::Cancelled => "cancelled",
        }
    }
}

impl PartialEq for CacheError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidConfig(l), Self::InvalidConfig(r)) => l == r,
            (Self::Producer(l), Self::Producer(r)) => {
                Arc::ptr_eq(l, r) || l.to_string() == r.to_string()
            }
            (Self::NotFound, Self::NotFound)
            | (Self::ProducerPanicked, Self::ProducerPanicked)
            | (Self::Cancelled, Self::Cancelled) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_error_is_transparent() {
        let err = CacheError::producer("token exchange failed: 403 Forbidden");
        assert_eq!(err.to_string(), "token exchange failed: 403 Forbidden");
        assert_eq!(err.metrics_tag(), "producer");

        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "sts timed out");
        let err = CacheError::producer(io_err);
        assert_eq!(err.to_string(), "sts timed out");
    }

    #[test]
    fn test_clones_compare_equal() {
        let err = CacheError::producer("nope");
        assert_eq!(err.clone(), err);
        assert_ne!(err, CacheError::NotFound);
        assert_eq!(CacheError::Cancelled, CacheError::Cancelled);
    }
}
