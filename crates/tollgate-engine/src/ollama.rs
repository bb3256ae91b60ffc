//! Ollama chat endpoint.
//!
//! Ollama keeps sampling settings under `options`, streams by default, and needs no credential.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use tollgate_abstraction::{ApiReply, Endpoint, EndpointError, EndpointFamily, Payload};

use crate::descriptor::input_token_bound;
use crate::http::{env_base_url, send_for_reply};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Context window requested from the server for every call.
pub const NUM_CTX: u32 = 128_000;

/// Ollama endpoint.
#[derive(Debug, Clone)]
pub struct OllamaEndpoint {
    /// The base URL for the Ollama API (default: "http://localhost:11434").
    base_url: String,
    client: Client,
}

impl Default for OllamaEndpoint {
    fn default() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }
}

impl OllamaEndpoint {
    /// Creates an endpoint configured from `OLLAMA_BASE_URL`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_base_url(env_base_url("OLLAMA_BASE_URL", DEFAULT_BASE_URL))
    }

    /// Creates an endpoint for a server at `base_url`.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into().trim_end_matches('/').to_string(), client: Client::new() }
    }
}

fn set_option(payload: &mut Payload, key: &str, value: Value) {
    let options = payload.entry("options").or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(map) = options {
        map.insert(key.to_string(), value);
    } else {
        let mut map = Map::new();
        map.insert(key.to_string(), value);
        *options = Value::Object(map);
    }
}

#[async_trait]
impl Endpoint for OllamaEndpoint {
    fn family(&self) -> EndpointFamily {
        EndpointFamily::Ollama
    }

    fn prepare(&self, mut payload: Payload) -> Payload {
        for key in ["seed", "temperature"] {
            if let Some(value) = payload.remove(key) {
                set_option(&mut payload, key, value);
            }
        }

        let max_completion = payload.remove("max_completion_tokens");
        let max_tokens = payload.remove("max_tokens");
        if let Some(max) = max_completion.or(max_tokens).filter(|v| !v.is_null()) {
            set_option(&mut payload, "num_predict", max);
        }

        payload.insert("stream".to_string(), Value::Bool(false));
        set_option(&mut payload, "num_ctx", Value::from(NUM_CTX));
        payload
    }

    fn ensure_credentials(&self) -> Result<(), EndpointError> {
        Ok(())
    }

    // Model tokenizers are not available offline; byte-level BPE never exceeds one token per byte.
    async fn count_input_tokens(&self, payload: &Payload) -> Result<u32, EndpointError> {
        Ok(u32::try_from(input_token_bound(payload)).unwrap_or(u32::MAX))
    }

    async fn send(&self, payload: &Payload) -> Result<ApiReply, EndpointError> {
        let request = self.client.post(format!("{}/api/chat", self.base_url)).json(payload);
        send_for_reply(EndpointFamily::Ollama, request).await
    }
}
