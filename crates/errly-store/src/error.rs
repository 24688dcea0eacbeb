//! Error types for the store.

/// Result type alias using [`StoreError`].
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store initialisation failed.
    #[error("store initialisation failed: {0}")]
    Init(String),

    /// Row not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A row that must exist is missing - a hard invariant violation that
    /// must surface as a fatal error to the caller.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Stored value could not be (de)serialised.
    #[error("serialisation error: {0}")]
    Serialisation(String),
}

impl StoreError {
    /// Create a not-found error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invariant-violation error.
    #[must_use]
    pub fn invariant(what: impl Into<String>) -> Self {
        Self::InvariantViolation(what.into())
    }
}
