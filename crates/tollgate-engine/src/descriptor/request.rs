//! Request descriptor.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tollgate_abstraction::{EndpointFamily, Payload};
use tracing::warn;

use crate::cache::Fingerprint;
use crate::error::Result;
use crate::pricing::{ModelParameters, PriceTable};

/// A structurally required field is absent from a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("missing required field `{0}`")]
pub struct MissingField(pub &'static str);

/// Maximum token usage a request can incur.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageEstimate {
    /// Input tokens, counted or bounded from above.
    pub max_input_tokens: u64,
    /// The requested output ceiling.
    pub max_output_tokens: u64,
}

impl UsageEstimate {
    /// Input plus output.
    #[must_use]
    pub fn max_total_tokens(&self) -> u64 {
        self.max_input_tokens.saturating_add(self.max_output_tokens)
    }

    /// Maximum cost of this usage at the given prices.
    #[must_use]
    pub fn cost(&self, params: &ModelParameters) -> f64 {
        params.input_cost(self.max_input_tokens) + params.output_cost(self.max_output_tokens)
    }
}

/// A reproducibility or sizing problem found by [`Request::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationWarning {
    /// Input alone exceeds the context window.
    ContextOverflow { input_tokens: u64, max_context: u32 },
    /// Requested output exceeds what the model can produce.
    OutputCeilingExceeded { requested: u64, max_output_tokens: u32 },
    /// Input plus requested output exceeds the context window.
    TotalOverflow { total_tokens: u64, max_context: u32 },
    /// Sampling is not pinned to temperature 0.
    NonZeroTemperature(Option<f64>),
    /// No sampling seed is set.
    MissingSeed,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextOverflow { input_tokens, max_context } => {
                write!(f, "input of {input_tokens} tokens exceeds the context window of {max_context}")
            }
            Self::OutputCeilingExceeded { requested, max_output_tokens } => write!(
                f,
                "requested output of {requested} tokens exceeds the model maximum of {max_output_tokens}"
            ),
            Self::TotalOverflow { total_tokens, max_context } => write!(
                f,
                "input plus requested output ({total_tokens} tokens) exceeds the context window of {max_context}"
            ),
            Self::NonZeroTemperature(Some(t)) => {
                write!(f, "temperature is {t}; responses will not be reproducible")
            }
            Self::NonZeroTemperature(None) => {
                write!(f, "temperature is not set; responses will not be reproducible")
            }
            Self::MissingSeed => write!(f, "no seed is set; responses will not be reproducible"),
        }
    }
}

/// An immutable request payload plus the values derived from it.
///
/// Cloning is cheap; the payload is shared.
#[derive(Debug, Clone)]
pub struct Request {
    family: EndpointFamily,
    payload: Arc<Payload>,
    model: String,
    fingerprint: Fingerprint,
    input_tokens: Option<u32>,
}

impl Request {
    /// Wraps a (prepared) payload.
    ///
    /// # Errors
    /// Returns `MissingField` if `model` or `messages` is absent.
    pub fn new(family: EndpointFamily, payload: Payload) -> std::result::Result<Self, MissingField> {
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .ok_or(MissingField("model"))?
            .to_string();
        if !payload.contains_key("messages") {
            return Err(MissingField("messages"));
        }

        let fingerprint = Fingerprint::of(&payload);
        Ok(Self { family, payload: Arc::new(payload), model, fingerprint, input_tokens: None })
    }

    /// Attaches a counted input size.
    #[must_use]
    pub fn with_input_tokens(mut self, tokens: u32) -> Self {
        self.input_tokens = Some(tokens);
        self
    }

    /// The endpoint family.
    #[must_use]
    pub fn family(&self) -> EndpointFamily {
        self.family
    }

    /// The endpoint identity.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The payload as sent.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The content fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The counted input size, if counting has run.
    #[must_use]
    pub fn input_tokens(&self) -> Option<u32> {
        self.input_tokens
    }

    /// The output ceiling the payload itself asks for.
    #[must_use]
    pub fn requested_output_tokens(&self) -> Option<u64> {
        let p = &self.payload;
        match self.family {
            EndpointFamily::Anthropic => p.get("max_tokens").and_then(Value::as_u64),
            EndpointFamily::OpenAI => p
                .get("max_completion_tokens")
                .or_else(|| p.get("max_tokens"))
                .and_then(Value::as_u64),
            EndpointFamily::Ollama => p
                .get("options")
                .and_then(|o| o.get("num_predict"))
                .and_then(Value::as_u64),
        }
    }

    /// Sampling temperature, wherever the family keeps it.
    #[must_use]
    pub fn temperature(&self) -> Option<f64> {
        self.sampling_field("temperature").and_then(Value::as_f64)
    }

    /// Sampling seed, wherever the family keeps it.
    #[must_use]
    pub fn seed(&self) -> Option<&Value> {
        self.sampling_field("seed").filter(|v| !v.is_null())
    }

    fn sampling_field(&self, name: &str) -> Option<&Value> {
        match self.family {
            EndpointFamily::Ollama => self.payload.get("options").and_then(|o| o.get(name)),
            _ => self.payload.get(name),
        }
    }

    /// Maximum input and output usage.
    ///
    /// Input comes from the counted size, or [`input_token_bound`] when counting
    /// has not run; output from the requested ceiling, or the model maximum.
    #[must_use]
    pub fn estimate_usage(&self, params: &ModelParameters) -> UsageEstimate {
        let max_input_tokens = self
            .input_tokens
            .map_or_else(|| input_token_bound(&self.payload), u64::from);
        let max_output_tokens = self
            .requested_output_tokens()
            .unwrap_or_else(|| u64::from(params.max_output_tokens));
        UsageEstimate { max_input_tokens, max_output_tokens }
    }

    /// Maximum cost, at the price table's rates for this identity.
    ///
    /// # Errors
    /// Returns `EngineError::UnknownEndpoint` if the identity is not registered.
    pub fn estimate_cost(&self, prices: &PriceTable) -> Result<f64> {
        let params = prices.get(&self.model)?;
        Ok(self.estimate_usage(params).cost(params))
    }

    /// Checks sizing and reproducibility settings, logging each problem found.
    ///
    /// Warnings never stop execution.
    ///
    /// # Errors
    /// Returns `EngineError::UnknownEndpoint` if the identity is not registered.
    pub fn validate(&self, prices: &PriceTable) -> Result<Vec<ValidationWarning>> {
        let params = prices.get(&self.model)?;
        let usage = self.estimate_usage(params);
        let mut warnings = Vec::new();

        if usage.max_input_tokens > u64::from(params.max_context) {
            warnings.push(ValidationWarning::ContextOverflow {
                input_tokens: usage.max_input_tokens,
                max_context: params.max_context,
            });
        } else if usage.max_total_tokens() > u64::from(params.max_context) {
            warnings.push(ValidationWarning::TotalOverflow {
                total_tokens: usage.max_total_tokens(),
                max_context: params.max_context,
            });
        }
        if usage.max_output_tokens > u64::from(params.max_output_tokens) {
            warnings.push(ValidationWarning::OutputCeilingExceeded {
                requested: usage.max_output_tokens,
                max_output_tokens: params.max_output_tokens,
            });
        }

        match self.temperature() {
            Some(t) if t.abs() < f64::EPSILON => {}
            other => warnings.push(ValidationWarning::NonZeroTemperature(other)),
        }
        // Anthropic has no seed parameter
        if self.family != EndpointFamily::Anthropic && self.seed().is_none() {
            warnings.push(ValidationWarning::MissingSeed);
        }

        for warning in &warnings {
            warn!(model = %self.model, fingerprint = %self.fingerprint, "{warning}");
        }
        Ok(warnings)
    }
}

/// System and message text of a payload, in order.
#[must_use]
pub fn prompt_parts(payload: &Payload) -> Vec<&str> {
    let mut parts = Vec::new();
    if let Some(system) = payload.get("system") {
        collect_text(system, &mut parts);
    }
    if let Some(Value::Array(messages)) = payload.get("messages") {
        for message in messages {
            if let Some(content) = message.get("content") {
                collect_text(content, &mut parts);
            }
        }
    }
    parts
}

/// Input size no byte-level tokenizer can exceed: one token per UTF-8 byte of prompt text.
///
/// Used where the exact count is unavailable, so that cost and budget estimates stay upper
/// bounds.
#[must_use]
pub fn input_token_bound(payload: &Payload) -> u64 {
    prompt_parts(payload).iter().map(|part| part.len() as u64).sum()
}

fn collect_text<'a>(value: &'a Value, parts: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => parts.push(s),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) => parts.push(s),
                    other => {
                        if let Some(text) = other.get("text") {
                            collect_text(text, parts);
                        }
                    }
                }
            }
        }
        _ => {}
    }
}
