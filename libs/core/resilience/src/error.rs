use thiserror::Error;

/// Outcome of a call routed through a [`crate::CircuitBreaker`].
///
/// `Open` and `TooManyRequests` mean the wrapped call never ran.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{0}' is open")]
    Open(String),

    #[error("circuit breaker '{0}' is half-open and at its probe limit")]
    TooManyRequests(String),

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the breaker refused the call without running it
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open(_) | Self::TooManyRequests(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
