//! Anthropic Messages API endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tollgate_abstraction::{ApiReply, Endpoint, EndpointError, EndpointFamily, Payload};
use tracing::{debug, error};

use crate::http::{env_api_key, env_base_url, require_key, select_fields, send_for_reply};
use crate::pricing::PriceTable;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Fields the token-counting endpoint accepts.
const COUNT_FIELDS: [&str; 5] = ["model", "messages", "system", "tools", "tool_choice"];

/// Claude endpoint.
#[derive(Debug, Clone)]
pub struct ClaudeEndpoint {
    /// The API key, if one was found.
    api_key: Option<String>,
    /// The base URL for the Claude API.
    base_url: String,
    /// HTTP client for making requests.
    client: Client,
    /// Used to fill in a missing `max_tokens`.
    prices: Arc<PriceTable>,
}

impl ClaudeEndpoint {
    /// Creates an endpoint configured from `ANTHROPIC_API_KEY` and `ANTHROPIC_BASE_URL`.
    ///
    /// A missing key is only reported by [`Endpoint::ensure_credentials`].
    #[must_use]
    pub fn from_env(prices: Arc<PriceTable>) -> Self {
        Self {
            api_key: env_api_key(EndpointFamily::Anthropic),
            base_url: env_base_url("ANTHROPIC_BASE_URL", DEFAULT_BASE_URL),
            client: Client::new(),
            prices,
        }
    }

    /// Creates an endpoint with an explicit API key.
    #[must_use]
    pub fn with_api_key(api_key: impl Into<String>, prices: Arc<PriceTable>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: Client::new(),
            prices,
        }
    }

    /// Points the endpoint at another server.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/{path}", self.base_url))
            .header("x-api-key", self.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
    }
}

#[async_trait]
impl Endpoint for ClaudeEndpoint {
    fn family(&self) -> EndpointFamily {
        EndpointFamily::Anthropic
    }

    /// Anthropic has no `seed`, calls the output ceiling `max_tokens`, and requires it.
    fn prepare(&self, mut payload: Payload) -> Payload {
        payload.remove("seed");
        if let Some(max) = payload.remove("max_completion_tokens") {
            payload.insert("max_tokens".to_string(), max);
        }
        if payload.get("max_tokens").is_none_or(Value::is_null) {
            let ceiling = payload
                .get("model")
                .and_then(Value::as_str)
                .and_then(|model| self.prices.get(model).ok())
                .map(|params| params.max_output_tokens);
            if let Some(ceiling) = ceiling {
                payload.insert("max_tokens".to_string(), Value::from(ceiling));
            }
        }
        payload
    }

    fn ensure_credentials(&self) -> Result<(), EndpointError> {
        require_key(EndpointFamily::Anthropic, self.api_key.as_deref())
    }

    async fn count_input_tokens(&self, payload: &Payload) -> Result<u32, EndpointError> {
        let body = select_fields(payload, &COUNT_FIELDS);
        let reply = send_for_reply(EndpointFamily::Anthropic, self.post("messages/count_tokens").json(&body))
            .await?;

        if reply.status != 200 {
            error!(status = reply.status, body = %reply.body, "count_tokens failed");
            return Err(EndpointError::RequestError(format!(
                "count_tokens returned status {}: {}",
                reply.status, reply.body
            )));
        }

        let tokens = reply.body.get("input_tokens").and_then(Value::as_u64).ok_or_else(|| {
            EndpointError::SerializationError("count_tokens reply has no `input_tokens`".to_string())
        })?;
        debug!(tokens, "Counted input tokens");
        Ok(u32::try_from(tokens).unwrap_or(u32::MAX))
    }

    async fn send(&self, payload: &Payload) -> Result<ApiReply, EndpointError> {
        send_for_reply(EndpointFamily::Anthropic, self.post("messages").json(payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint(base_url: &str) -> ClaudeEndpoint {
        ClaudeEndpoint::with_api_key("test-key", PriceTable::shared_builtin())
            .with_base_url(format!("{base_url}/v1"))
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_prepare() {
        let claude = endpoint("http://unused");
        let prepared = claude.prepare(payload(json!({
            "model": "claude-3-5-haiku-20241022",
            "messages": [],
            "seed": 42,
            "max_completion_tokens": 100,
        })));
        assert_eq!(
            Value::Object(prepared),
            json!({"model": "claude-3-5-haiku-20241022", "messages": [], "max_tokens": 100})
        );

        let filled = claude.prepare(payload(json!({"model": "claude-3-5-haiku-20241022", "messages": []})));
        assert_eq!(filled["max_tokens"], 8_192);

        let unknown = claude.prepare(payload(json!({"model": "claude-x", "messages": []})));
        assert!(!unknown.contains_key("max_tokens"));
    }

    #[test]
    fn test_missing_key() {
        let claude = ClaudeEndpoint {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: Client::new(),
            prices: PriceTable::shared_builtin(),
        };
        assert!(matches!(
            claude.ensure_credentials(),
            Err(EndpointError::MissingCredential { family: EndpointFamily::Anthropic, .. })
        ));
    }

    #[tokio::test]
    async fn test_count_input_tokens_sends_only_countable_fields() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages/count_tokens")
            .match_header("x-api-key", "test-key")
            .match_header("anthropic-version", API_VERSION)
            .match_body(mockito::Matcher::Json(json!({
                "model": "claude-3-5-sonnet-20241022",
                "messages": [{"role": "user", "content": "hi"}],
                "system": "be brief",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"input_tokens": 14}"#)
            .create_async()
            .await;

        let tokens = endpoint(&server.url())
            .count_input_tokens(&payload(json!({
                "model": "claude-3-5-sonnet-20241022",
                "messages": [{"role": "user", "content": "hi"}],
                "system": "be brief",
                "max_tokens": 10,
                "temperature": 0,
            })))
            .await
            .unwrap();

        assert_eq!(tokens, 14);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_count_input_tokens_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/messages/count_tokens")
            .with_status(500)
            .with_body(r#"{"type": "error"}"#)
            .create_async()
            .await;

        let result = endpoint(&server.url())
            .count_input_tokens(&payload(json!({"model": "m", "messages": []})))
            .await;
        assert!(matches!(result, Err(EndpointError::RequestError(_))));
    }

    #[tokio::test]
    async fn test_send_returns_reply_with_quota_headers() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("anthropic-ratelimit-requests-remaining", "49")
            .with_body(r#"{"type": "message", "content": [{"type": "text", "text": "Hello"}]}"#)
            .create_async()
            .await;

        let reply = endpoint(&server.url())
            .send(&payload(json!({"model": "m", "messages": []})))
            .await
            .unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("anthropic-ratelimit-requests-remaining"), Some("49"));
        assert_eq!(reply.body["content"][0]["text"], "Hello");
    }

    #[tokio::test]
    async fn test_overload_is_a_reply_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/messages")
            .with_status(529)
            .with_body(r#"{"type": "error", "error": {"type": "overloaded_error"}}"#)
            .create_async()
            .await;

        let reply = endpoint(&server.url())
            .send(&payload(json!({"model": "m", "messages": []})))
            .await
            .unwrap();
        assert_eq!(reply.status, 529);
    }
}
