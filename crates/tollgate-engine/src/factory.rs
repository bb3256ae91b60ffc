//! Endpoint factory for creating endpoints from configuration.
//!
//! Credentials and base URLs not given explicitly are read from the environment.

use std::sync::Arc;
use tollgate_abstraction::{Endpoint, EndpointFamily};
use tracing::debug;

use crate::pricing::PriceTable;
use crate::{ClaudeEndpoint, OllamaEndpoint, OpenAIEndpoint};

/// Endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// The family to create.
    pub family: EndpointFamily,
    /// Optional API key (if not provided, will be loaded from environment).
    pub api_key: Option<String>,
    /// Optional base URL (if not provided, the environment override or the vendor default).
    pub base_url: Option<String>,
}

impl EndpointConfig {
    /// Creates a configuration that reads everything from the environment.
    #[must_use]
    pub fn new(family: EndpointFamily) -> Self {
        Self { family, api_key: None, base_url: None }
    }

    /// Sets the API key.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// Factory for creating endpoint instances.
pub struct EndpointFactory;

impl EndpointFactory {
    /// Creates an endpoint from the given configuration.
    ///
    /// Never fails: a missing credential is reported by `ensure_credentials`, and only once a
    /// batch actually needs the network.
    pub fn create(config: EndpointConfig, prices: Arc<PriceTable>) -> Arc<dyn Endpoint> {
        debug!(
            family = %config.family,
            explicit_key = config.api_key.is_some(),
            base_url = ?config.base_url,
            "Creating endpoint"
        );

        match config.family {
            EndpointFamily::Anthropic => {
                let mut endpoint = match config.api_key {
                    Some(key) => ClaudeEndpoint::with_api_key(key, prices),
                    None => ClaudeEndpoint::from_env(prices),
                };
                if let Some(url) = config.base_url {
                    endpoint = endpoint.with_base_url(url);
                }
                Arc::new(endpoint)
            }
            EndpointFamily::OpenAI => {
                let mut endpoint = match config.api_key {
                    Some(key) => OpenAIEndpoint::with_api_key(key),
                    None => OpenAIEndpoint::from_env(),
                };
                if let Some(url) = config.base_url {
                    endpoint = endpoint.with_base_url(url);
                }
                Arc::new(endpoint)
            }
            EndpointFamily::Ollama => Arc::new(match config.base_url {
                Some(url) => OllamaEndpoint::with_base_url(url),
                None => OllamaEndpoint::from_env(),
            }),
        }
    }

    /// Creates an endpoint for `family` configured entirely from the environment.
    pub fn from_env(family: EndpointFamily, prices: Arc<PriceTable>) -> Arc<dyn Endpoint> {
        Self::create(EndpointConfig::new(family), prices)
    }
}
