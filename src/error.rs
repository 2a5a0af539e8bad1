//! Error types for the patch installer core

use thiserror::Error;

/// Error types for verification and install operations
#[derive(Error, Debug)]
pub enum Error {
    /// Cooperative cancellation was observed
    #[error("operation cancelled")]
    Cancelled,

    /// The index reported a part as unverifiable, which a well-formed index
    /// never does
    #[error("index reports part {part} of target {target} as unverifiable")]
    InvariantViolated {
        /// Target file index
        target: usize,
        /// Part index within the target
        part: usize,
    },

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A fresh ranged response produced no body part at all
    #[error("ranged response ended before the first body part")]
    UnexpectedEndOfStream,

    /// The ranged response body could not be parsed
    #[error("malformed ranged response: {reason}")]
    MalformedResponse {
        /// What was wrong with the response
        reason: String,
    },

    /// Programmer misuse of the installer API
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the call
        reason: String,
    },

    /// An install task gave up after consecutive transient failures
    #[error("install task gave up after {attempts} attempts")]
    ExhaustedRetries {
        /// Number of attempts made
        attempts: u32,
        /// The last transient failure observed
        #[source]
        cause: Option<Box<Error>>,
    },

    /// A worker task terminated abnormally
    #[error("install worker terminated abnormally: {0}")]
    TaskPanicked(String),
}

/// Result type for installer operations
pub type Result<T> = std::result::Result<T, Error>;

// Helper methods for common error construction
impl Error {
    /// Create a malformed response error
    pub fn malformed_response(reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an exhausted retries error wrapping the last failure
    pub fn exhausted_retries(attempts: u32, cause: Option<Error>) -> Self {
        Self::ExhaustedRetries {
            attempts,
            cause: cause.map(Box::new),
        }
    }

    /// Whether this error is worth retrying inside an install task
    ///
    /// Covers network and IO failures plus responses the multipart reader
    /// could not make sense of. Cancellation, index invariant violations and
    /// API misuse are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Io(_) | Self::UnexpectedEndOfStream | Self::MalformedResponse { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::UnexpectedEndOfStream.is_transient());
        assert!(Error::malformed_response("bad boundary").is_transient());
        assert!(Error::Io(std::io::Error::other("boom")).is_transient());

        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::invalid_argument("nope").is_transient());
        assert!(!Error::InvariantViolated { target: 0, part: 0 }.is_transient());
        assert!(!Error::exhausted_retries(8, None).is_transient());
    }

    #[test]
    fn exhausted_retries_keeps_cause() {
        let err = Error::exhausted_retries(8, Some(Error::UnexpectedEndOfStream));
        let source = std::error::Error::source(&err).expect("cause should be chained");
        assert!(source.to_string().contains("ranged response ended"));
    }
}
