//! Static per-model price and limit table.
//!
//! Prices are USD per 1k tokens, as published by the vendors. Entries can be added or
//! overridden at runtime (the CLI reads `[[models]]` tables from its config file).

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tollgate_abstraction::EndpointFamily;

/// Price and limit information for one endpoint identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// The endpoint identity (model name) as used in request payloads.
    pub model: String,
    /// The family serving this model.
    pub family: EndpointFamily,
    /// USD per 1k uncached input tokens.
    pub cost_per_1k_input_tokens: f64,
    /// USD per 1k output tokens.
    pub cost_per_1k_output_tokens: f64,
    /// USD per 1k input tokens written to the vendor's prompt cache.
    #[serde(default)]
    pub cost_per_1k_cache_creation_input_tokens: Option<f64>,
    /// USD per 1k input tokens served from the vendor's prompt cache.
    #[serde(default)]
    pub cost_per_1k_cache_read_input_tokens: Option<f64>,
    /// Context window in tokens (input + output).
    pub max_context: u32,
    /// Largest output the model can produce.
    pub max_output_tokens: u32,
}

impl ModelParameters {
    /// Cost of `tokens` uncached input tokens.
    #[must_use]
    pub fn input_cost(&self, tokens: u64) -> f64 {
        tokens as f64 * self.cost_per_1k_input_tokens / 1000.0
    }

    /// Cost of `tokens` output tokens.
    #[must_use]
    pub fn output_cost(&self, tokens: u64) -> f64 {
        tokens as f64 * self.cost_per_1k_output_tokens / 1000.0
    }

    /// Cost of `tokens` cache-creation input tokens; billed as plain input when no rate is known.
    #[must_use]
    pub fn cache_creation_cost(&self, tokens: u64) -> f64 {
        let rate = self
            .cost_per_1k_cache_creation_input_tokens
            .unwrap_or(self.cost_per_1k_input_tokens);
        tokens as f64 * rate / 1000.0
    }

    /// Cost of `tokens` cache-read input tokens; billed as plain input when no rate is known.
    #[must_use]
    pub fn cache_read_cost(&self, tokens: u64) -> f64 {
        let rate = self
            .cost_per_1k_cache_read_input_tokens
            .unwrap_or(self.cost_per_1k_input_tokens);
        tokens as f64 * rate / 1000.0
    }
}

/// Lookup table from endpoint identity to [`ModelParameters`].
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    models: HashMap<String, ModelParameters>,
}

impl PriceTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table.
    #[must_use]
    pub fn builtin() -> Self {
        let mut table = Self::new();
        for params in builtin_models() {
            table.insert(params);
        }
        table
    }

    /// Shared handle to the built-in table.
    pub fn shared_builtin() -> Arc<Self> {
        static BUILTIN: OnceLock<Arc<PriceTable>> = OnceLock::new();
        Arc::clone(BUILTIN.get_or_init(|| Arc::new(Self::builtin())))
    }

    /// Adds or replaces an entry.
    pub fn insert(&mut self, params: ModelParameters) {
        self.models.insert(params.model.clone(), params);
    }

    /// Adds or replaces several entries.
    #[must_use]
    pub fn with_models(mut self, models: impl IntoIterator<Item = ModelParameters>) -> Self {
        for params in models {
            self.insert(params);
        }
        self
    }

    /// Looks up an identity.
    ///
    /// # Errors
    /// Returns `EngineError::UnknownEndpoint` if the identity is not registered.
    pub fn get(&self, model: &str) -> Result<&ModelParameters> {
        self.models.get(model).ok_or_else(|| EngineError::UnknownEndpoint(model.to_string()))
    }

    /// Entries sorted by family, then model name.
    #[must_use]
    pub fn entries(&self) -> Vec<&ModelParameters> {
        let mut entries: Vec<_> = self.models.values().collect();
        entries.sort_by(|a, b| {
            a.family.as_str().cmp(b.family.as_str()).then_with(|| a.model.cmp(&b.model))
        });
        entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

fn anthropic(model: &str, input: f64, output: f64, write: f64, read: f64) -> ModelParameters {
    ModelParameters {
        model: model.to_string(),
        family: EndpointFamily::Anthropic,
        cost_per_1k_input_tokens: input,
        cost_per_1k_output_tokens: output,
        cost_per_1k_cache_creation_input_tokens: Some(write),
        cost_per_1k_cache_read_input_tokens: Some(read),
        max_context: 200_000,
        max_output_tokens: 8_192,
    }
}

fn openai(model: &str, input: f64, output: f64, cached: f64) -> ModelParameters {
    ModelParameters {
        model: model.to_string(),
        family: EndpointFamily::OpenAI,
        cost_per_1k_input_tokens: input,
        cost_per_1k_output_tokens: output,
        cost_per_1k_cache_creation_input_tokens: None,
        cost_per_1k_cache_read_input_tokens: Some(cached),
        max_context: 128_000,
        max_output_tokens: 16_384,
    }
}

fn ollama(model: &str) -> ModelParameters {
    ModelParameters {
        model: model.to_string(),
        family: EndpointFamily::Ollama,
        cost_per_1k_input_tokens: 0.0,
        cost_per_1k_output_tokens: 0.0,
        cost_per_1k_cache_creation_input_tokens: None,
        cost_per_1k_cache_read_input_tokens: None,
        max_context: 128_000,
        max_output_tokens: 128_000,
    }
}

// see https://docs.anthropic.com/en/docs/about-claude/models and https://openai.com/api/pricing/
fn builtin_models() -> Vec<ModelParameters> {
    vec![
        anthropic("claude-3-5-sonnet-20240620", 0.0030, 0.0150, 0.00375, 0.0003),
        anthropic("claude-3-5-sonnet-20241022", 0.0030, 0.0150, 0.00375, 0.0003),
        anthropic("claude-3-5-haiku-20241022", 0.0008, 0.0040, 0.001, 0.00008),
        openai("gpt-4o-2024-08-06", 0.0025, 0.0100, 0.00125),
        openai("gpt-4o-mini-2024-07-18", 0.00015, 0.0006, 0.000_075),
        ollama("llama3.1:8b-instruct-fp16"),
        ollama("llama3.1:70b-instruct-fp16"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let table = PriceTable::builtin();
        let sonnet = table.get("claude-3-5-sonnet-20241022").unwrap();
        assert_eq!(sonnet.family, EndpointFamily::Anthropic);
        assert_eq!(sonnet.max_output_tokens, 8_192);
        assert!((sonnet.input_cost(1000) - 0.003).abs() < 1e-12);
        assert!((sonnet.output_cost(1000) - 0.015).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_model() {
        let table = PriceTable::builtin();
        assert!(matches!(table.get("gpt-9"), Err(EngineError::UnknownEndpoint(m)) if m == "gpt-9"));
    }

    #[test]
    fn test_override_replaces_builtin() {
        let mut custom = ollama("llama3.1:8b-instruct-fp16");
        custom.max_context = 8_192;
        let table = PriceTable::builtin().with_models([custom]);
        assert_eq!(table.get("llama3.1:8b-instruct-fp16").unwrap().max_context, 8_192);
        assert_eq!(table.len(), PriceTable::builtin().len());
    }

    #[test]
    fn test_cache_rates_fall_back_to_input_rate() {
        let params = ollama("local");
        assert_eq!(params.cache_read_cost(1000), 0.0);
        let gpt = openai("m", 0.002, 0.004, 0.001);
        assert!((gpt.cache_creation_cost(1000) - 0.002).abs() < 1e-12);
        assert!((gpt.cache_read_cost(1000) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_entries_are_sorted() {
        let table = PriceTable::builtin();
        let entries = table.entries();
        assert_eq!(entries.first().unwrap().family, EndpointFamily::Anthropic);
        assert_eq!(entries.last().unwrap().family, EndpointFamily::OpenAI);
    }
}
