//! Response descriptor.

use serde::Serialize;
use serde_json::Value;
use tollgate_abstraction::EndpointFamily;

use crate::pricing::ModelParameters;

/// Tokens a call actually consumed, split by billing category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// Input tokens billed at the plain input rate.
    pub input_tokens: u64,
    /// Input tokens written to the vendor's prompt cache.
    pub cache_creation_input_tokens: u64,
    /// Input tokens served from the vendor's prompt cache.
    pub cache_read_input_tokens: u64,
    /// Output tokens.
    pub output_tokens: u64,
}

impl Usage {
    /// All input tokens, whatever their billing category.
    #[must_use]
    pub fn total_input_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.cache_creation_input_tokens)
            .saturating_add(self.cache_read_input_tokens)
    }

    /// Input plus output.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens().saturating_add(self.output_tokens)
    }

    /// Cost of this usage at the given prices.
    #[must_use]
    pub fn cost(&self, params: &ModelParameters) -> f64 {
        params.input_cost(self.input_tokens)
            + params.cache_creation_cost(self.cache_creation_input_tokens)
            + params.cache_read_cost(self.cache_read_input_tokens)
            + params.output_cost(self.output_tokens)
    }
}

/// A response payload plus its success classification and usage.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    family: EndpointFamily,
    payload: Value,
    succeeded: bool,
}

impl Response {
    /// Classifies a body by the family's success convention.
    #[must_use]
    pub fn from_body(family: EndpointFamily, payload: Value) -> Self {
        let succeeded = is_success_body(family, &payload);
        Self { family, payload, succeeded }
    }

    /// A failed response carrying whatever body came back (`null` when none did).
    #[must_use]
    pub fn failed(family: EndpointFamily, payload: Value) -> Self {
        Self { family, payload, succeeded: false }
    }

    /// The endpoint family.
    #[must_use]
    pub fn family(&self) -> EndpointFamily {
        self.family
    }

    /// Whether the call produced a usable result.
    #[must_use]
    pub fn was_successful(&self) -> bool {
        self.succeeded
    }

    /// The raw body.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consumes the descriptor, returning the raw body.
    #[must_use]
    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Actual usage; zero for a failed response.
    #[must_use]
    pub fn usage(&self) -> Usage {
        if !self.succeeded {
            return Usage::default();
        }
        let Some(usage) = self.payload.get("usage").or_else(|| self.ollama_usage_root()) else {
            return Usage::default();
        };
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);

        match self.family {
            EndpointFamily::Anthropic => Usage {
                input_tokens: field("input_tokens"),
                cache_creation_input_tokens: field("cache_creation_input_tokens"),
                cache_read_input_tokens: field("cache_read_input_tokens"),
                output_tokens: field("output_tokens"),
            },
            EndpointFamily::OpenAI => {
                let prompt = field("prompt_tokens");
                let cached = usage
                    .pointer("/prompt_tokens_details/cached_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
                    .min(prompt);
                Usage {
                    input_tokens: prompt - cached,
                    cache_creation_input_tokens: 0,
                    cache_read_input_tokens: cached,
                    output_tokens: field("completion_tokens"),
                }
            }
            EndpointFamily::Ollama => Usage {
                input_tokens: field("prompt_eval_count"),
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
                output_tokens: field("eval_count"),
            },
        }
    }

    // Ollama reports counters at the top level of the body.
    fn ollama_usage_root(&self) -> Option<&Value> {
        (self.family == EndpointFamily::Ollama).then_some(&self.payload)
    }

    /// Actual cost at the given prices; zero for a failed response.
    #[must_use]
    pub fn actual_cost(&self, params: &ModelParameters) -> f64 {
        self.usage().cost(params)
    }
}

/// Whether a decoded body is a successful result for the family.
#[must_use]
pub fn is_success_body(family: EndpointFamily, body: &Value) -> bool {
    match family {
        EndpointFamily::Anthropic => body.get("type").and_then(Value::as_str) == Some("message"),
        EndpointFamily::OpenAI => body.get("choices").is_some(),
        EndpointFamily::Ollama => body.get("message").is_some() && body.get("error").is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PriceTable;
    use serde_json::json;

    #[test]
    fn test_anthropic_usage_and_cost() {
        let body = json!({
            "type": "message",
            "content": [{"type": "text", "text": "hi"}],
            "usage": {
                "input_tokens": 1000,
                "cache_creation_input_tokens": 1000,
                "cache_read_input_tokens": 1000,
                "output_tokens": 1000,
            },
        });
        let response = Response::from_body(EndpointFamily::Anthropic, body);
        assert!(response.was_successful());
        assert_eq!(response.usage().total_input_tokens(), 3000);

        let prices = PriceTable::builtin();
        let cost = response.actual_cost(prices.get("claude-3-5-sonnet-20241022").unwrap());
        assert!((cost - (0.003 + 0.00375 + 0.0003 + 0.015)).abs() < 1e-12);
    }

    #[test]
    fn test_openai_cached_tokens_split() {
        let body = json!({
            "choices": [],
            "usage": {
                "prompt_tokens": 1000,
                "completion_tokens": 10,
                "prompt_tokens_details": {"cached_tokens": 400},
            },
        });
        let usage = Response::from_body(EndpointFamily::OpenAI, body).usage();
        assert_eq!(usage.input_tokens, 600);
        assert_eq!(usage.cache_read_input_tokens, 400);
        assert_eq!(usage.output_tokens, 10);
        assert_eq!(usage.total_tokens(), 1010);
    }

    #[test]
    fn test_ollama_usage_from_top_level() {
        let body = json!({"message": {"content": "x"}, "prompt_eval_count": 12, "eval_count": 3});
        let usage = Response::from_body(EndpointFamily::Ollama, body).usage();
        assert_eq!((usage.input_tokens, usage.output_tokens), (12, 3));
    }

    #[test]
    fn test_usage_totals_saturate() {
        let body = json!({
            "type": "message",
            "usage": {"input_tokens": u64::MAX, "cache_read_input_tokens": 5, "output_tokens": 1},
        });
        let usage = Response::from_body(EndpointFamily::Anthropic, body).usage();
        assert_eq!(usage.total_input_tokens(), u64::MAX);
        assert_eq!(usage.total_tokens(), u64::MAX);
    }

    #[test]
    fn test_failed_response_has_zero_usage() {
        let body = json!({"type": "error", "usage": {"input_tokens": 50}});
        let response = Response::from_body(EndpointFamily::Anthropic, body);
        assert!(!response.was_successful());
        assert_eq!(response.usage(), Usage::default());

        let forced = Response::failed(EndpointFamily::OpenAI, Value::Null);
        assert_eq!(forced.usage().total_tokens(), 0);
    }

    #[test]
    fn test_success_classification() {
        assert!(is_success_body(EndpointFamily::OpenAI, &json!({"choices": []})));
        assert!(!is_success_body(EndpointFamily::OpenAI, &json!({"error": {}})));
        assert!(!is_success_body(
            EndpointFamily::Ollama,
            &json!({"message": {}, "error": "model not found"})
        ));
    }
}
