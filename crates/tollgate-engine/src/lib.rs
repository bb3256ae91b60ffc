//! Request execution engine for Tollgate.
//!
//! This crate turns a batch of opaque request payloads into a batch of response payloads,
//! in input order, while keeping spend and vendor quotas under control.
//!
//! # Pipeline
//!
//! 1. **Cache**: payloads are fingerprinted and answered from a content-addressed directory
//!    when possible.
//! 2. **Pre-flight**: uncached requests get their input counted, their usage estimated against
//!    the price table, and the total maximum spend put through the cost gate.
//! 3. **Dispatch**: an adaptive loop admits calls against per-endpoint budgets, sequentially
//!    until the endpoint proves healthy and in parallel afterwards, re-queueing on quota
//!    replies.
//!
//! # Supported Endpoints
//!
//! - **Mock**: Testing and development
//! - **Claude**: Anthropic's Messages API (API key required)
//! - **OpenAI**: OpenAI's Chat Completions API (API key required)
//! - **Ollama**: Local models via Ollama (no API key, local execution)

pub mod budget;
pub mod cache;
pub mod claude;
pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod factory;
mod http;
pub mod ollama;
pub mod openai;
pub mod pricing;
pub mod progress;

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tollgate_abstraction::{ApiReply, Endpoint, EndpointError, EndpointFamily, Payload};
use tracing::debug;

pub use budget::{Admission, AdmissionPolicy, BudgetRegistry, BudgetState, DispatchMode, QuotaSnapshot};
pub use cache::{CacheError, CacheStats, Fingerprint, ResponseCache};
pub use claude::ClaudeEndpoint;
pub use config::{ConfigError, EngineConfig, SequentialScope};
pub use descriptor::{Request, Response, Usage, UsageEstimate, ValidationWarning};
pub use dispatch::{Approver, AutoApprover, BatchEstimate, Engine, RetryPolicy, StdinApprover};
pub use error::{EngineError, Result};
pub use extract::{FinishReason, UnknownFinishReason, extract_finish_reason, extract_text};
pub use factory::{EndpointConfig, EndpointFactory};
pub use ollama::OllamaEndpoint;
pub use openai::OpenAIEndpoint;
pub use pricing::{ModelParameters, PriceTable};
pub use progress::{Bottleneck, ProgressObserver, ProgressSnapshot, ProgressTracker};

/// Executes `payloads` against the default endpoint of `family`.
///
/// The endpoint is configured from the environment; budgets are shared process-wide and spend
/// above `auto_approve` is confirmed on stdin. Returns one response payload per input, in
/// input order.
///
/// # Errors
/// Returns an `EngineError` if the batch as a whole cannot be executed.
pub async fn execute_requests(
    payloads: Vec<Payload>,
    family: EndpointFamily,
    auto_approve: Option<f64>,
) -> Result<Vec<Value>> {
    let prices = PriceTable::shared_builtin();
    let endpoint = EndpointFactory::from_env(family, Arc::clone(&prices));
    let config = EngineConfig { auto_approve, ..EngineConfig::default() };
    let engine = Engine::new(endpoint, config)?.with_prices(prices);

    let responses = engine.execute(payloads).await?;
    Ok(responses.into_iter().map(Response::into_payload).collect())
}

type Responder = dyn Fn(&Payload) -> std::result::Result<ApiReply, EndpointError> + Send + Sync;

/// A scriptable implementation of the `Endpoint` trait for testing and demonstration.
///
/// Replies are taken from the scripted queue first, then from the responder (if any), and
/// otherwise a successful family-shaped body echoing the last message is produced.
pub struct MockEndpoint {
    family: EndpointFamily,
    script: Mutex<VecDeque<std::result::Result<ApiReply, EndpointError>>>,
    responder: Option<Box<Responder>>,
    latency: Duration,
    has_credentials: bool,
    failing_counts: AtomicU32,
    calls: Mutex<Vec<Payload>>,
    count_calls: AtomicUsize,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
}

impl std::fmt::Debug for MockEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEndpoint")
            .field("family", &self.family)
            .field("latency", &self.latency)
            .field("has_credentials", &self.has_credentials)
            .finish_non_exhaustive()
    }
}

impl MockEndpoint {
    /// Creates a new `MockEndpoint` speaking `family`.
    #[must_use]
    pub fn new(family: EndpointFamily) -> Self {
        Self {
            family,
            script: Mutex::new(VecDeque::new()),
            responder: None,
            latency: Duration::ZERO,
            has_credentials: true,
            failing_counts: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
            count_calls: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Queues a reply for the next unscripted call.
    #[must_use]
    pub fn with_reply(self, reply: ApiReply) -> Self {
        lock(&self.script).push_back(Ok(reply));
        self
    }

    /// Queues a transport failure for the next unscripted call.
    #[must_use]
    pub fn with_error(self, error: EndpointError) -> Self {
        lock(&self.script).push_back(Err(error));
        self
    }

    /// Answers calls the script does not cover with `responder`.
    #[must_use]
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Payload) -> std::result::Result<ApiReply, EndpointError> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Delays every `send` by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes `ensure_credentials` fail.
    #[must_use]
    pub fn without_credentials(mut self) -> Self {
        self.has_credentials = false;
        self
    }

    /// Makes the first `failures` token-counting calls fail.
    #[must_use]
    pub fn failing_token_counts(self, failures: u32) -> Self {
        self.failing_counts.store(failures, Ordering::SeqCst);
        self
    }

    /// Payloads sent so far, in call order.
    pub fn calls(&self) -> Vec<Payload> {
        lock(&self.calls).clone()
    }

    /// Number of `send` calls so far.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Number of token-counting calls so far, failed ones included.
    pub fn token_count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `send` calls that were in progress at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_reply(&self, payload: &Payload) -> std::result::Result<ApiReply, EndpointError> {
        if let Some(scripted) = lock(&self.script).pop_front() {
            return scripted;
        }
        match &self.responder {
            Some(responder) => responder(payload),
            None => Ok(ApiReply::new(200, success_body(self.family, payload))),
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn family(&self) -> EndpointFamily {
        self.family
    }

    fn ensure_credentials(&self) -> std::result::Result<(), EndpointError> {
        if self.has_credentials {
            return Ok(());
        }
        Err(EndpointError::MissingCredential {
            family: self.family,
            variable: self.family.credential_var().unwrap_or("MOCK_API_KEY").to_string(),
        })
    }

    async fn count_input_tokens(&self, payload: &Payload) -> std::result::Result<u32, EndpointError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failing_counts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EndpointError::RequestError("mock token counting failure".to_string()));
        }
        Ok(u32::try_from(mock_token_count(payload)).unwrap_or(u32::MAX))
    }

    async fn send(&self, payload: &Payload) -> std::result::Result<ApiReply, EndpointError> {
        lock(&self.calls).push(payload.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(Arc::clone(&self.active));
        self.max_active.fetch_max(active, Ordering::SeqCst);

        debug!(family = %self.family, active, "MockEndpoint sending");
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.next_reply(payload)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn last_message_text(payload: &Payload) -> String {
    let Some(content) = payload
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.last())
        .and_then(|message| message.get("content"))
    else {
        return String::new();
    };
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Simulated tokenizer: four bytes of prompt text per token.
fn mock_token_count(payload: &Payload) -> u64 {
    descriptor::input_token_bound(payload).div_ceil(4)
}

/// Count tokens in a string (simplified: word count).
fn count_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// A successful reply body in `family`'s format echoing the last message of `payload`.
#[must_use]
pub fn success_body(family: EndpointFamily, payload: &Payload) -> Value {
    let model = payload.get("model").cloned().unwrap_or(Value::Null);
    let text = format!("Mock response for: {}", last_message_text(payload));
    let input_tokens = mock_token_count(payload);
    let output_tokens = count_tokens(&text);

    match family {
        EndpointFamily::Anthropic => json!({
            "id": "msg_mock",
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [{"type": "text", "text": text}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
        }),
        EndpointFamily::OpenAI => json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": input_tokens,
                "completion_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens,
            },
        }),
        EndpointFamily::Ollama => json!({
            "model": model,
            "message": {"role": "assistant", "content": text},
            "done": true,
            "prompt_eval_count": input_tokens,
            "eval_count": output_tokens,
        }),
    }
}
