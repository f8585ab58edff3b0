//! Error taxonomy for the credential lifecycle.
//!
//! Every fallible operation in this crate resolves to [`Error`]; the session
//! manager never lets an error escape as a panic. Only [`Error::Network`] is
//! retryable; everything else is surfaced or handled locally.

use std::time::Duration;
use thiserror::Error;

/// Why an access token failed the integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityReason {
    /// The claims segment could not be decoded.
    Undecodable,
    /// The `exp` claim is absent or in the past.
    Expired,
    /// A required claim is missing.
    MissingClaim(&'static str),
}

impl std::fmt::Display for IntegrityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undecodable => write!(f, "claims cannot be decoded"),
            Self::Expired => write!(f, "token is expired"),
            Self::MissingClaim(claim) => write!(f, "missing claim: {claim}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The server response is malformed (missing or mistyped field).
    #[error("invalid field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// The access token failed the claims/expiry check.
    ///
    /// No signature is verified client-side; this is a liveness check on the
    /// claims, not a security boundary.
    #[error("token integrity: {0}")]
    Integrity(IntegrityReason),

    /// Too many login attempts for this identity inside the window.
    #[error("rate limited, retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Transport-level failure. The only retryable variant.
    #[error("network error: {0}")]
    Network(String),

    /// The server rejected the request (4xx). Never retried.
    #[error("auth failure ({status}): {message}")]
    Auth { status: u16, message: String },

    /// Encryption, decryption, or persistence failure. The stored entry is
    /// treated as corrupt and purged by the caller.
    #[error("storage error: {0}")]
    Storage(String),

    /// Operation invoked while the session is in an incompatible state.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
}

impl Error {
    /// Whether a bounded retry with backoff is appropriate.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_transient() {
        assert!(Error::Network("connection reset".to_string()).is_transient());
        assert!(!Error::Auth {
            status: 401,
            message: "bad credentials".to_string()
        }
        .is_transient());
        assert!(!Error::RateLimited {
            retry_after: Duration::from_secs(30)
        }
        .is_transient());
        assert!(!Error::Storage("corrupt blob".to_string()).is_transient());
    }

    #[test]
    fn integrity_reason_display() {
        assert_eq!(
            Error::Integrity(IntegrityReason::MissingClaim("sub")).to_string(),
            "token integrity: missing claim: sub"
        );
    }

    #[test]
    fn rate_limited_display_includes_seconds() {
        let err = Error::RateLimited {
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(err.to_string(), "rate limited, retry in 42s");
    }
}
