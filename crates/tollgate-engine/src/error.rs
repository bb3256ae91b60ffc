//! Error types for the execution engine.

use crate::cache::CacheError;
use crate::config::ConfigError;
use tollgate_abstraction::{EndpointError, EndpointFamily};
use thiserror::Error;

/// Batch-level errors.
///
/// Every variant aborts the whole `execute` call. Failures of individual requests are never
/// reported here; they come back as unsuccessful [`crate::Response`]s.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A request lacks a field every request must carry.
    #[error("Request {index} is missing required field `{field}`")]
    MissingField {
        /// Position of the request in the batch.
        index: usize,
        /// Name of the missing field.
        field: &'static str,
    },

    /// The endpoint identity has no entry in the price table.
    #[error("Unknown endpoint `{0}`: not registered in the price table")]
    UnknownEndpoint(String),

    /// Uncached work exists but the family's credential is not set.
    #[error("Missing credential for '{family}': set `{variable}`")]
    MissingCredential {
        /// The endpoint family.
        family: EndpointFamily,
        /// The environment variable that should hold the credential.
        variable: String,
    },

    /// Counting input tokens failed for a request.
    #[error("Token counting failed for request {index}: {message}")]
    TokenCount {
        /// Position of the request in the batch.
        index: usize,
        /// What went wrong.
        message: String,
    },

    /// The operator declined the estimated spend.
    #[error("Execution declined at estimated cost ${estimated_cost:.2}")]
    Declined {
        /// The maximum estimated cost that was put to the operator.
        estimated_cost: f64,
    },

    /// Execution was cancelled before every request completed.
    #[error("Execution cancelled")]
    Cancelled,

    /// The response cache could not be read or written.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The engine configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An endpoint-level error outside of an individual request.
    #[error(transparent)]
    Endpoint(EndpointError),
}

impl From<EndpointError> for EngineError {
    fn from(err: EndpointError) -> Self {
        match err {
            EndpointError::MissingCredential { family, variable } => {
                Self::MissingCredential { family, variable }
            }
            other => Self::Endpoint(other),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credential_is_lifted() {
        let err: EngineError = EndpointError::MissingCredential {
            family: EndpointFamily::Anthropic,
            variable: "ANTHROPIC_API_KEY".to_string(),
        }
        .into();
        assert!(matches!(err, EngineError::MissingCredential { family: EndpointFamily::Anthropic, .. }));
    }

    #[test]
    fn test_declined_display() {
        let err = EngineError::Declined { estimated_cost: 12.5 };
        assert_eq!(err.to_string(), "Execution declined at estimated cost $12.50");
    }
}
