//! Error types for certwarden
//!
//! Errors are structured with fields to aid debugging in production. The
//! rotation loop distinguishes three classes:
//!
//! - transient errors (API reads/writes, in-flux secrets) that are retried
//!   with backoff and only surface once attempts are exhausted
//! - partial failures while injecting into one consumer among many
//! - terminal errors (certificates never mounted, CA never injected) that
//!   must stop the process from serving

use certwarden_pki::PkiError;
use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for certwarden operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Certificate generation or parsing error
    #[error("pki error: {source}")]
    Pki {
        /// The underlying PKI error
        #[from]
        source: PkiError,
    },

    /// Trust bundle could not be injected into a consumer resource
    #[error("injection error for {kind} {name}: {message}")]
    Injection {
        /// Consumer resource kind (ValidatingWebhookConfiguration, ...)
        kind: String,
        /// Consumer resource name
        name: String,
        /// Description of what's wrong with the resource
        message: String,
    },

    /// Unrecoverable readiness failure; the process must not keep serving
    #[error("terminal error: {message}")]
    Terminal {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "rotator", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create an injection error for a consumer resource
    pub fn injection(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Injection {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a terminal error
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Check if this error is retryable
    ///
    /// Terminal errors never are. Malformed resources need an outside fix
    /// but are still worth retrying since another writer may repair them.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Pki { .. } => true,
            Error::Injection { .. } => true,
            Error::Terminal { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "NotFound".to_string(),
            code,
        }))
    }

    #[test]
    fn not_found_is_detected_from_api_status() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(409).is_not_found());
        assert!(!Error::internal("x").is_not_found());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!Error::terminal("could not mount certs").is_retryable());
        assert!(api_error(500).is_retryable());
        let err = Error::injection("CustomResourceDefinition", "widgets", "no conversion");
        assert!(err.is_retryable());
    }

    #[test]
    fn injection_error_names_the_consumer() {
        let err = Error::injection("MutatingWebhookConfiguration", "mutator", "webhooks missing");
        let msg = err.to_string();
        assert!(msg.contains("MutatingWebhookConfiguration"));
        assert!(msg.contains("mutator"));
        assert!(msg.contains("webhooks missing"));
    }

    #[test]
    fn pki_errors_convert() {
        let err: Error = PkiError::MalformedSecret("missing ca.crt".to_string()).into();
        assert!(err.to_string().contains("missing ca.crt"));
    }

    #[test]
    fn internal_error_carries_context() {
        match Error::internal_with_context("rotator", "join failed") {
            Error::Internal { context, message } => {
                assert_eq!(context, "rotator");
                assert_eq!(message, "join failed");
            }
            _ => panic!("Expected Internal variant"),
        }
    }
}
