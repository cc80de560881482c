//! Error types for store operations.

/// Error type shared by the storage contract and every backend driver.
///
/// Errors are cheap to clone so a single terminal error can travel through
/// an iterator's error latch and still be inspected by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The requested key (or column) is not present.
    NotFound,

    /// The caller passed an empty value to a store that is not opted into
    /// empty values.
    EmptyValueRejected,

    /// The consumer's cancellation token was tripped while an operation was
    /// in flight.
    Canceled,

    /// Transient backend failures: network errors, engine unavailability,
    /// request deadlines. Never retried internally.
    Storage(String),

    /// Invalid caller input or configuration: malformed DSN, unknown
    /// option value, contract misuse detectable at the call site.
    InvalidInput(String),

    /// Internal errors indicating bugs or invariant violations.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "key not found"),
            Error::EmptyValueRejected => write!(f, "empty values are not enabled on this store"),
            Error::Canceled => write!(f, "operation canceled"),
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl Error {
    /// Converts any displayable backend error into [`Error::Storage`].
    pub fn storage(e: impl std::fmt::Display) -> Self {
        Error::Storage(e.to_string())
    }

    /// Converts any displayable error into [`Error::InvalidInput`].
    pub fn invalid(e: impl std::fmt::Display) -> Self {
        Error::InvalidInput(e.to_string())
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_display_not_found() {
        assert_eq!(Error::NotFound.to_string(), "key not found");
    }

    #[test]
    fn should_wrap_backend_error_message() {
        // given
        let err = Error::storage("connection reset");

        // then
        assert_eq!(err, Error::Storage("connection reset".to_string()));
        assert_eq!(err.to_string(), "Storage error: connection reset");
    }
}
