//! Error types for the platform client.

/// Result type alias using [`PlatformError`].
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Errors that can occur talking to the platform API.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The circuit breaker is open; the request was refused locally.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// Credentials were rejected (401/403 or in-band auth error). The
    /// client refuses further requests until the latch is cleared.
    #[error("platform rejected credentials")]
    AuthRejected,

    /// The platform's rate limit is exhausted.
    #[error("platform rate limit exhausted")]
    RateLimited,

    /// Network failure, timeout, or 5xx from the platform. Recorded
    /// against the circuit breaker; callers retry on the next tick.
    #[error("transport error: {0}")]
    Transport(String),

    /// The platform answered with in-band API errors.
    #[error("platform API error: {0}")]
    Api(String),

    /// The response body did not have the expected shape.
    #[error("invalid platform response: {0}")]
    InvalidResponse(String),

    /// The stream reconnect budget is exhausted.
    #[error("log stream gave up after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Client construction failed.
    #[error("client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl PlatformError {
    /// Whether this failure should be recorded against the circuit breaker.
    ///
    /// Auth rejections and locally refused requests are not transient: they
    /// must not cycle the breaker.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_classification() {
        assert!(PlatformError::Transport("timeout".into()).is_transient());
        assert!(PlatformError::RateLimited.is_transient());
        assert!(!PlatformError::AuthRejected.is_transient());
        assert!(!PlatformError::CircuitOpen.is_transient());
        assert!(!PlatformError::Api("boom".into()).is_transient());
    }
}
