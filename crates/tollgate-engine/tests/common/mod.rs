//! Shared test utilities for Tollgate engine integration tests.

#![allow(dead_code)]

use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tollgate_abstraction::{EndpointFamily, Payload};
use tollgate_engine::{Approver, AutoApprover, BudgetRegistry, Engine, EngineConfig, MockEndpoint};

pub const SONNET: &str = "claude-3-5-sonnet-20241022";

/// An Anthropic-style payload with one user message.
pub fn request(text: &str, max_tokens: u64) -> Payload {
    object(json!({
        "model": SONNET,
        "max_tokens": max_tokens,
        "temperature": 0.0,
        "messages": [{"role": "user", "content": text}],
    }))
}

pub fn object(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be a JSON object")
}

/// Engine configuration writing into `dir`, with fast polling and a generous auto-approve.
pub fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        cache_dir: dir.path().to_path_buf(),
        auto_approve: Some(100.0),
        min_poll_interval_ms: 1,
        max_poll_interval_ms: 20,
        ..EngineConfig::default()
    }
}

/// An engine over `endpoint` with a private registry and an approver that always proceeds.
pub fn engine(endpoint: &Arc<MockEndpoint>, config: EngineConfig) -> (Engine, Arc<BudgetRegistry>) {
    let registry = Arc::new(BudgetRegistry::new());
    (engine_with_registry(endpoint, config, &registry), registry)
}

/// An engine over `endpoint` sharing `registry`, with an approver that always proceeds.
pub fn engine_with_registry(
    endpoint: &Arc<MockEndpoint>,
    config: EngineConfig,
    registry: &Arc<BudgetRegistry>,
) -> Engine {
    Engine::new(endpoint.clone(), config)
        .expect("valid config")
        .with_registry(Arc::clone(registry))
        .with_approver(Arc::new(AutoApprover))
}

/// Number of cache files below `dir`.
pub fn cache_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, |entries| {
        entries
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .count()
    })
}

pub fn anthropic_cache(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join(format!("{}_cache", EndpointFamily::Anthropic.as_str()))
}

/// Text of the last user message of a payload.
pub fn prompt_of(payload: &Payload) -> String {
    payload["messages"][0]["content"].as_str().unwrap_or_default().to_string()
}

/// Records what it was asked and answers with a fixed decision.
pub struct RecordingApprover {
    pub decision: bool,
    pub asked: AtomicUsize,
}

impl RecordingApprover {
    pub fn new(decision: bool) -> Self {
        Self { decision, asked: AtomicUsize::new(0) }
    }

    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl Approver for RecordingApprover {
    fn approve(&self, _estimated_cost: f64, _uncached: usize) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.decision
    }
}
