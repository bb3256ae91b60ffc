//! OpenAI Chat Completions endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tiktoken_rs::{CoreBPE, get_bpe_from_model};
use tollgate_abstraction::{ApiReply, Endpoint, EndpointError, EndpointFamily, Payload};
use tracing::debug;

use crate::descriptor::{input_token_bound, prompt_parts};
use crate::http::{env_api_key, env_base_url, require_key, send_for_reply};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat formatting tokens added around every message.
const TOKENS_PER_MESSAGE: u64 = 4;
/// Tokens priming the assistant reply.
const REPLY_PRIMING_TOKENS: u64 = 3;

// Loading an encoding parses a large vocabulary, so each model's is built once per process.
fn encoder(model: &str) -> Option<Arc<CoreBPE>> {
    static ENCODERS: OnceLock<Mutex<HashMap<String, Option<Arc<CoreBPE>>>>> = OnceLock::new();
    let mut encoders = ENCODERS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    encoders
        .entry(model.to_string())
        .or_insert_with(|| match get_bpe_from_model(model) {
            Ok(bpe) => Some(Arc::new(bpe)),
            Err(e) => {
                debug!(model, error = %e, "No tokenizer for model, bounding input size instead");
                None
            }
        })
        .clone()
}

/// Input tokens of a chat payload, counted with the model's tiktoken encoding.
///
/// Includes the chat formatting overhead. Models without a known encoding (for example local
/// servers behind `OPENAI_BASE_URL`) fall back to [`input_token_bound`].
#[must_use]
pub fn count_prompt_tokens(payload: &Payload) -> u64 {
    let model = payload.get("model").and_then(Value::as_str).unwrap_or_default();
    let Some(bpe) = encoder(model) else {
        return input_token_bound(payload);
    };
    let messages = payload.get("messages").and_then(Value::as_array).map_or(0, Vec::len) as u64;
    let text: u64 = prompt_parts(payload)
        .iter()
        .map(|part| bpe.encode_with_special_tokens(part).len() as u64)
        .sum();
    text + messages * TOKENS_PER_MESSAGE + REPLY_PRIMING_TOKENS
}

/// OpenAI endpoint.
#[derive(Debug, Clone)]
pub struct OpenAIEndpoint {
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

impl OpenAIEndpoint {
    /// Creates an endpoint configured from `OPENAI_API_KEY` and `OPENAI_BASE_URL`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            api_key: env_api_key(EndpointFamily::OpenAI),
            base_url: env_base_url("OPENAI_BASE_URL", DEFAULT_BASE_URL),
            client: Client::new(),
        }
    }

    /// Creates an endpoint with an explicit API key.
    #[must_use]
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: Client::new(),
        }
    }

    /// Points the endpoint at another server.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Endpoint for OpenAIEndpoint {
    fn family(&self) -> EndpointFamily {
        EndpointFamily::OpenAI
    }

    fn ensure_credentials(&self) -> Result<(), EndpointError> {
        require_key(EndpointFamily::OpenAI, self.api_key.as_deref())
    }

    // No counting endpoint; tokenized locally.
    async fn count_input_tokens(&self, payload: &Payload) -> Result<u32, EndpointError> {
        let payload = payload.clone();
        let tokens = tokio::task::spawn_blocking(move || count_prompt_tokens(&payload))
            .await
            .map_err(|e| EndpointError::Other(format!("token counting task failed: {e}")))?;
        Ok(u32::try_from(tokens).unwrap_or(u32::MAX))
    }

    async fn send(&self, payload: &Payload) -> Result<ApiReply, EndpointError> {
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.as_deref().unwrap_or_default())
            .json(payload);
        send_for_reply(EndpointFamily::OpenAI, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prepare_passes_through() {
        let endpoint = OpenAIEndpoint::with_api_key("k");
        let payload = json!({"model": "m", "messages": [], "seed": 1}).as_object().cloned().unwrap();
        assert_eq!(endpoint.prepare(payload.clone()), payload);
    }

    fn chat(model: &str, content: &str) -> Payload {
        json!({"model": model, "messages": [{"role": "user", "content": content}]})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_count_uses_model_encoding() {
        let endpoint = OpenAIEndpoint::with_api_key("k");
        let payload = chat("gpt-4o-2024-08-06", "hello world");
        // two text tokens plus formatting
        assert_eq!(endpoint.count_input_tokens(&payload).await.unwrap(), 9);
    }

    #[test]
    fn test_count_of_numeric_prompt() {
        let numbers: Vec<String> = (1..=200).map(|n| n.to_string()).collect();
        let payload = chat("gpt-4o-mini-2024-07-18", &numbers.join(","));
        let tokens = count_prompt_tokens(&payload);
        // one token per number and one per comma
        assert!(tokens >= 399, "counted {tokens}");
        assert!(tokens <= input_token_bound(&payload));
    }

    #[test]
    fn test_unknown_model_uses_bound() {
        let payload = chat("qwen2.5:7b", "12345678");
        assert_eq!(count_prompt_tokens(&payload), 8);
    }

    #[tokio::test]
    async fn test_send_uses_bearer_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("x-ratelimit-remaining-tokens", "29000")
            .with_body(r#"{"choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}]}"#)
            .create_async()
            .await;

        let endpoint = OpenAIEndpoint::with_api_key("test-key").with_base_url(format!("{}/v1/", server.url()));
        let payload = json!({"model": "m", "messages": []}).as_object().cloned().unwrap();
        let reply = endpoint.send(&payload).await.unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("x-ratelimit-remaining-tokens"), Some("29000"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        let endpoint = OpenAIEndpoint::with_api_key("k").with_base_url("http://127.0.0.1:1");
        let payload = json!({"model": "m", "messages": []}).as_object().cloned().unwrap();
        assert!(matches!(endpoint.send(&payload).await, Err(EndpointError::RequestError(_))));
    }
}
