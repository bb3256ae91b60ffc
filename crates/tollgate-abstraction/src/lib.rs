//! Endpoint abstraction layer for Tollgate.
//!
//! This crate defines the vendor-agnostic boundary between the execution engine and the
//! generation APIs it drives: opaque request payloads, raw HTTP replies, and the
//! [`Endpoint`] trait every concrete API client implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// An opaque request body (a JSON object).
///
/// The engine only reads the handful of fields it needs through descriptor accessors; every
/// other field passes through to the endpoint untouched.
pub type Payload = serde_json::Map<String, Value>;

/// The API family a request is addressed to.
///
/// Families differ in wire format, credential, and the way they report quota state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointFamily {
    /// Anthropic Messages API.
    Anthropic,
    /// OpenAI Chat Completions API.
    OpenAI,
    /// Local Ollama server.
    Ollama,
}

impl EndpointFamily {
    /// All supported families.
    pub const ALL: [Self; 3] = [Self::Anthropic, Self::OpenAI, Self::Ollama];

    /// Lower-case name used for cache directories, config files and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
            Self::Ollama => "ollama",
        }
    }

    /// Environment variable holding the family's credential, if it needs one.
    #[must_use]
    pub const fn credential_var(self) -> Option<&'static str> {
        match self {
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::Ollama => None,
        }
    }
}

impl fmt::Display for EndpointFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointFamily {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            other => Err(EndpointError::Other(format!("Unknown endpoint family: {other}"))),
        }
    }
}

/// Represents an error that prevented an API call from producing a reply at all.
///
/// HTTP error statuses are *not* errors at this layer; they arrive as an [`ApiReply`] so the
/// engine can tell quota-exceeded replies apart from terminal failures.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointError {
    /// The request could not be delivered (connection refused, timeout, TLS, ...).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The reply body could not be decoded.
    #[error("Serialization Error: {0}")]
    SerializationError(String),

    /// The family's credential is not available.
    #[error("Missing credential for '{family}': set `{variable}`")]
    MissingCredential {
        /// The endpoint family.
        family: EndpointFamily,
        /// The environment variable that should hold the credential.
        variable: String,
    },

    /// Other unexpected errors.
    #[error("Other Endpoint Error: {0}")]
    Other(String),
}

/// A raw reply from an endpoint: status, headers and decoded JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiReply {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, names lower-cased.
    pub headers: HashMap<String, String>,
    /// Decoded body; `Value::Null` when the body was empty or not JSON.
    pub body: Value,
}

impl ApiReply {
    /// Creates a reply without headers.
    #[must_use]
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, headers: HashMap::new(), body }
    }

    /// Adds a header, lower-casing its name.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    /// Looks up a header by (case-insensitive) name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// A generation API the engine can drive.
///
/// All endpoints must be `Send + Sync` so one instance can serve many concurrent calls.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// The family this endpoint speaks.
    fn family(&self) -> EndpointFamily;

    /// Rewrites a caller payload into the exact body this endpoint expects.
    ///
    /// Runs before fingerprinting, so the cache key covers what is actually sent.
    fn prepare(&self, payload: Payload) -> Payload {
        payload
    }

    /// Checks that the credential needed for network calls is present.
    ///
    /// # Errors
    /// Returns `EndpointError::MissingCredential` if it is not.
    fn ensure_credentials(&self) -> Result<(), EndpointError>;

    /// Counts the input tokens the payload will consume.
    ///
    /// # Errors
    /// Returns an `EndpointError` if counting requires a call and that call fails.
    async fn count_input_tokens(&self, payload: &Payload) -> Result<u32, EndpointError>;

    /// Sends the payload and returns the raw reply, whatever its status.
    ///
    /// # Errors
    /// Returns an `EndpointError` only when no reply was obtained.
    async fn send(&self, payload: &Payload) -> Result<ApiReply, EndpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_family_round_trips_through_str() {
        for family in EndpointFamily::ALL {
            assert_eq!(family.as_str().parse::<EndpointFamily>().unwrap(), family);
        }
        assert_eq!("Claude".parse::<EndpointFamily>().unwrap(), EndpointFamily::Anthropic);
        assert!("bedrock".parse::<EndpointFamily>().is_err());
    }

    #[test]
    fn test_credential_vars() {
        assert_eq!(EndpointFamily::Anthropic.credential_var(), Some("ANTHROPIC_API_KEY"));
        assert_eq!(EndpointFamily::OpenAI.credential_var(), Some("OPENAI_API_KEY"));
        assert_eq!(EndpointFamily::Ollama.credential_var(), None);
    }

    #[test]
    fn test_reply_headers_are_case_insensitive() {
        let reply = ApiReply::new(200, json!({}))
            .with_header("Anthropic-RateLimit-Requests-Remaining", "49");
        assert_eq!(reply.header("anthropic-ratelimit-requests-remaining"), Some("49"));
        assert_eq!(reply.header("ANTHROPIC-RATELIMIT-REQUESTS-REMAINING"), Some("49"));
        assert_eq!(reply.header("missing"), None);
    }

    #[test]
    fn test_missing_credential_display() {
        let err = EndpointError::MissingCredential {
            family: EndpointFamily::OpenAI,
            variable: "OPENAI_API_KEY".to_string(),
        };
        assert_eq!(err.to_string(), "Missing credential for 'openai': set `OPENAI_API_KEY`");
    }
}
