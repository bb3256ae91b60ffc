//! The execution engine: cache, pre-flight checks and the adaptive dispatch loop.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tollgate_abstraction::{Endpoint, EndpointError, EndpointFamily, Payload};
use tracing::{debug, error, info, warn};

use super::approval::{Approver, StdinApprover};
use super::pair::{Pair, PairStatus, dispatch_order};
use super::retry::RetryPolicy;
use crate::budget::{Admission, AdmissionPolicy, BudgetRegistry, CallOutcome, DispatchMode, Permit, QuotaSnapshot};
use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::descriptor::{MissingField, Request, Response};
use crate::error::{EngineError, Result};
use crate::pricing::PriceTable;
use crate::progress::{Bottleneck, ProgressObserver, ProgressTracker};

/// Whether a reply status means "over quota, try again later".
#[must_use]
pub fn is_quota_exceeded(family: EndpointFamily, status: u16) -> bool {
    status == 429 || (family == EndpointFamily::Anthropic && status == 529)
}

/// Pre-flight summary of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BatchEstimate {
    /// Requests in the batch.
    pub total: usize,
    /// Requests answered by the cache.
    pub cached: usize,
    /// Requests that would be sent.
    pub uncached: usize,
    /// Upper bound of the input tokens to be sent.
    pub max_input_tokens: u64,
    /// Upper bound of the output tokens to be produced.
    pub max_output_tokens: u64,
    /// Upper bound of the spend in USD.
    pub max_cost: f64,
}

enum CallResult {
    Resolved(Response),
    Requeue,
}

#[derive(Clone)]
struct CallContext {
    endpoint: Arc<dyn Endpoint>,
    cache: ResponseCache,
}

/// Executes batches of request payloads against one endpoint.
///
/// Responses are returned in input order, one per payload. Previously obtained responses are
/// served from the cache; the rest are admitted against the shared [`BudgetRegistry`] and sent
/// either inline (sequential mode) or on background tasks (parallel mode).
pub struct Engine {
    endpoint: Arc<dyn Endpoint>,
    config: EngineConfig,
    prices: Arc<PriceTable>,
    registry: Arc<BudgetRegistry>,
    cache: ResponseCache,
    approver: Arc<dyn Approver>,
    observer: Option<Arc<dyn ProgressObserver>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("family", &self.endpoint.family())
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine using the built-in price table, the process-wide budget registry and
    /// a stdin approver.
    ///
    /// # Errors
    /// Returns `EngineError::Config` if the configuration is invalid.
    pub fn new(endpoint: Arc<dyn Endpoint>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let cache = ResponseCache::new(config.family_cache_dir(endpoint.family()));
        Ok(Self {
            endpoint,
            config,
            prices: PriceTable::shared_builtin(),
            registry: BudgetRegistry::global(),
            cache,
            approver: Arc::new(StdinApprover),
            observer: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Uses another price table.
    #[must_use]
    pub fn with_prices(mut self, prices: Arc<PriceTable>) -> Self {
        self.prices = prices;
        self
    }

    /// Uses another budget registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<BudgetRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Uses another approver for the cost gate.
    #[must_use]
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    /// Reports progress to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Token that cancels running and future executions.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The response cache.
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            parallel_ceiling: self.config.parallel_ceiling,
            sequential_scope: self.config.sequential_scope,
        }
    }

    fn tracker(&self, total: usize) -> ProgressTracker {
        let tracker = ProgressTracker::new(total);
        match &self.observer {
            Some(observer) => tracker.with_observer(Arc::clone(observer)),
            None => tracker,
        }
    }

    /// Executes a batch.
    ///
    /// Individual failures come back as unsuccessful responses (with a `null` payload for
    /// transport failures); only batch-level problems are errors.
    ///
    /// # Errors
    /// - `MissingField` if a payload lacks `model` or `messages`
    /// - `MissingCredential` if uncached work exists and the credential is absent
    /// - `UnknownEndpoint` if an uncached request names an unregistered identity
    /// - `TokenCount` if counting input tokens keeps failing
    /// - `Declined` if the operator refuses the estimated spend
    /// - `Cancelled` if the cancellation token fires
    /// - `Cache` if the cache directory cannot be read
    pub async fn execute(&self, payloads: Vec<Payload>) -> Result<Vec<Response>> {
        let total = payloads.len();
        let progress = self.tracker(total);
        let mut pairs = self.wrap(payloads)?;

        self.cache_phase(&mut pairs, &progress).await?;
        let uncached = pairs.iter().filter(|p| p.is_open()).count();
        if uncached == 0 {
            info!(total, "All requests answered from cache");
            return Ok(self.collect(pairs));
        }

        self.endpoint.ensure_credentials()?;
        self.count_phase(&mut pairs).await?;
        let max_cost = self.estimate_phase(&mut pairs)?;
        self.cost_gate(max_cost, uncached).await?;

        info!(
            total,
            cached = total - uncached,
            uncached,
            max_cost = %format!("${max_cost:.2}"),
            "Executing requests"
        );
        self.dispatch_loop(&mut pairs, &progress).await?;

        let snapshot = progress.snapshot();
        info!(
            failed = snapshot.failed,
            cost = %format!("${:.2}", snapshot.cost),
            "Execution finished"
        );
        Ok(self.collect(pairs))
    }

    /// Runs the pre-flight phases without sending anything.
    ///
    /// Input sizes are counted when the credential is available and bounded from above otherwise.
    ///
    /// # Errors
    /// Same as [`Engine::execute`] up to the cost gate, except that a missing credential only
    /// degrades counting.
    pub async fn estimate(&self, payloads: Vec<Payload>) -> Result<BatchEstimate> {
        let total = payloads.len();
        let progress = self.tracker(total);
        let mut pairs = self.wrap(payloads)?;

        self.cache_phase(&mut pairs, &progress).await?;
        let uncached = pairs.iter().filter(|p| p.is_open()).count();
        if uncached > 0 {
            match self.endpoint.ensure_credentials() {
                Ok(()) => self.count_phase(&mut pairs).await?,
                Err(e) => warn!(error = %e, "Approximating input sizes"),
            }
        }
        let max_cost = self.estimate_phase(&mut pairs)?;

        let open = pairs.iter().filter(|p| p.is_open());
        Ok(BatchEstimate {
            total,
            cached: total - uncached,
            uncached,
            max_input_tokens: open.clone().fold(0_u64, |sum, p| sum.saturating_add(p.estimate.max_input_tokens)),
            max_output_tokens: open.fold(0_u64, |sum, p| sum.saturating_add(p.estimate.max_output_tokens)),
            max_cost,
        })
    }

    fn wrap(&self, payloads: Vec<Payload>) -> Result<Vec<Pair>> {
        let family = self.endpoint.family();
        payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| {
                let request = Request::new(family, self.endpoint.prepare(payload))
                    .map_err(|MissingField(field)| EngineError::MissingField { index, field })?;
                Ok(Pair::new(index, request))
            })
            .collect()
    }

    async fn cache_phase(&self, pairs: &mut [Pair], progress: &ProgressTracker) -> Result<()> {
        let family = self.endpoint.family();
        for pair in pairs.iter_mut() {
            if let Some(body) = self.cache.lookup(&pair.request).await? {
                pair.resolve(Response::from_body(family, body));
                progress.record_cached();
            }
        }
        let stats = self.cache.stats();
        debug!(hits = stats.hits, misses = stats.misses, "Cache phase done");
        Ok(())
    }

    async fn count_phase(&self, pairs: &mut [Pair]) -> Result<()> {
        let policy = RetryPolicy::with_max_retries(self.config.token_count_retries);
        let jobs: Vec<(usize, Payload)> = pairs
            .iter()
            .filter(|p| p.is_open())
            .map(|p| (p.index, p.request.payload().clone()))
            .collect();

        let counting = stream::iter(jobs)
            .map(|(index, payload)| {
                let policy = &policy;
                async move { (index, self.count_with_retry(index, &payload, policy).await) }
            })
            .buffer_unordered(self.config.token_count_concurrency)
            .collect::<Vec<_>>();

        let counts = tokio::select! {
            () = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            counts = counting => counts,
        };

        for (index, count) in counts {
            let pair = &mut pairs[index];
            pair.request = pair.request.clone().with_input_tokens(count?);
        }
        Ok(())
    }

    async fn count_with_retry(&self, index: usize, payload: &Payload, policy: &RetryPolicy) -> Result<u32> {
        let mut retry_count = 0;
        loop {
            match self.endpoint.count_input_tokens(payload).await {
                Ok(tokens) => return Ok(tokens),
                Err(e @ EndpointError::MissingCredential { .. }) => return Err(e.into()),
                Err(e) if retry_count < policy.max_retries => {
                    let delay = policy.calculate_delay(retry_count);
                    warn!(index, error = %e, delay_ms = delay.as_millis(), "Token counting failed, retrying");
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => {
                    return Err(EngineError::TokenCount { index, message: e.to_string() });
                }
            }
        }
    }

    // Computes every open pair's estimate, validates it, and returns the total maximum cost.
    fn estimate_phase(&self, pairs: &mut [Pair]) -> Result<f64> {
        let mut max_cost = 0.0;
        for pair in pairs.iter_mut().filter(|p| p.is_open()) {
            let params = self.prices.get(pair.request.model())?;
            pair.estimate = pair.request.estimate_usage(params);
            max_cost += pair.estimate.cost(params);
            pair.request.validate(&self.prices)?;
        }
        Ok(max_cost)
    }

    async fn cost_gate(&self, max_cost: f64, uncached: usize) -> Result<()> {
        if self.config.auto_approve.is_some_and(|ceiling| max_cost <= ceiling) {
            debug!(max_cost, "Estimated cost within auto-approve ceiling");
            return Ok(());
        }

        let approver = Arc::clone(&self.approver);
        let approved = tokio::task::spawn_blocking(move || approver.approve(max_cost, uncached))
            .await
            .unwrap_or(false);
        if approved {
            info!(max_cost, "Estimated cost approved");
            Ok(())
        } else {
            warn!(max_cost, "Estimated cost declined");
            Err(EngineError::Declined { estimated_cost: max_cost })
        }
    }

    async fn dispatch_loop(&self, pairs: &mut [Pair], progress: &ProgressTracker) -> Result<()> {
        let order = dispatch_order(pairs);
        let policy = self.policy();
        let ctx = CallContext { endpoint: Arc::clone(&self.endpoint), cache: self.cache.clone() };
        let min_wait = self.config.min_poll_interval();
        let max_wait = self.config.max_poll_interval();

        let mut tasks: JoinSet<CallResult> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut backoff = min_wait;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancel_all(tasks).await);
            }

            let mut progressed = false;
            let mut rate_limited = false;
            let mut throttled = false;
            let mut refill_eta: Option<Duration> = None;

            for &index in &order {
                if !pairs[index].is_open() {
                    continue;
                }
                pairs[index].status = PairStatus::Waiting;

                let pair = &pairs[index];
                let admission = self.registry.try_acquire(
                    pair.request.model(),
                    pair.estimate,
                    &policy,
                    Instant::now(),
                );
                let permit = match admission {
                    Admission::Granted(permit) => permit,
                    Admission::OverBudget { retry_after } => {
                        pairs[index].status = PairStatus::Open;
                        rate_limited = true;
                        if let Some(eta) = retry_after {
                            refill_eta = Some(refill_eta.map_or(eta, |current| current.min(eta)));
                        }
                        continue;
                    }
                    Admission::Throttled => {
                        pairs[index].status = PairStatus::Open;
                        throttled = true;
                        continue;
                    }
                };

                progressed = true;
                pairs[index].status = PairStatus::Running;
                progress.record_started();
                let request = pairs[index].request.clone();

                match permit.mode() {
                    DispatchMode::Sequential => {
                        progress.set_bottleneck(Bottleneck::Sequential);
                        debug!(index, model = request.model(), "Dispatching inline");
                        let result = tokio::select! {
                            () = self.cancel.cancelled() => return Err(self.cancel_all(tasks).await),
                            result = run_call(ctx.clone(), request, permit) => result,
                        };
                        self.apply(&mut pairs[index], result, progress);
                    }
                    DispatchMode::Parallel => {
                        progress.set_bottleneck(Bottleneck::Parallel);
                        debug!(index, model = request.model(), "Dispatching on background task");
                        let handle = tasks.spawn(run_call(ctx.clone(), request, permit));
                        running.insert(handle.id(), index);
                    }
                }
            }

            if pairs.iter().all(Pair::is_done) {
                return Ok(());
            }

            let any_open = pairs.iter().any(Pair::is_open);
            if !any_open {
                progress.set_bottleneck(Bottleneck::Stragglers);
            } else if rate_limited {
                progress.set_bottleneck(Bottleneck::RateLimit);
            } else if throttled {
                progress.set_bottleneck(Bottleneck::Slots);
            }

            if progressed {
                backoff = min_wait;
            }
            let wait = refill_eta.map_or(backoff, |eta| backoff.min(eta.max(min_wait)));

            tokio::select! {
                () = self.cancel.cancelled() => return Err(self.cancel_all(tasks).await),
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    self.on_joined(joined, pairs, &mut running, progress);
                    backoff = min_wait;
                }
                () = tokio::time::sleep(wait), if any_open => {
                    backoff = (backoff * 2).min(max_wait);
                }
            }
        }
    }

    fn on_joined(
        &self,
        joined: std::result::Result<(tokio::task::Id, CallResult), tokio::task::JoinError>,
        pairs: &mut [Pair],
        running: &mut HashMap<tokio::task::Id, usize>,
        progress: &ProgressTracker,
    ) {
        match joined {
            Ok((id, result)) => {
                if let Some(index) = running.remove(&id) {
                    self.apply(&mut pairs[index], result, progress);
                }
            }
            Err(e) => {
                if let Some(index) = running.remove(&e.id()) {
                    error!(index, error = %e, "Request task failed");
                    pairs[index].resolve(Response::failed(self.endpoint.family(), Value::Null));
                    progress.record_finished(false, 0.0);
                }
            }
        }
    }

    fn apply(&self, pair: &mut Pair, result: CallResult, progress: &ProgressTracker) {
        match result {
            CallResult::Resolved(response) => {
                let cost = self
                    .prices
                    .get(pair.request.model())
                    .map_or(0.0, |params| response.actual_cost(params));
                progress.record_finished(response.was_successful(), cost);
                pair.resolve(response);
            }
            CallResult::Requeue => {
                progress.record_requeued();
                pair.reopen();
            }
        }
    }

    async fn cancel_all(&self, mut tasks: JoinSet<CallResult>) -> EngineError {
        warn!(in_flight = tasks.len(), "Execution cancelled");
        tasks.shutdown().await;
        EngineError::Cancelled
    }

    fn collect(&self, pairs: Vec<Pair>) -> Vec<Response> {
        let family = self.endpoint.family();
        pairs
            .into_iter()
            .map(|pair| pair.response.unwrap_or_else(|| Response::failed(family, Value::Null)))
            .collect()
    }
}

async fn run_call(ctx: CallContext, request: Request, permit: Permit) -> CallResult {
    let family = ctx.endpoint.family();
    let reply = match ctx.endpoint.send(request.payload()).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(model = request.model(), error = %e, "Request failed");
            permit.settle(&QuotaSnapshot::empty(), CallOutcome::Failed);
            return CallResult::Resolved(Response::failed(family, Value::Null));
        }
    };

    let quota = QuotaSnapshot::from_reply(family, &reply);
    if is_quota_exceeded(family, reply.status) {
        warn!(model = request.model(), status = reply.status, "Quota exceeded, requeueing");
        permit.settle(&quota, CallOutcome::QuotaExceeded);
        return CallResult::Requeue;
    }

    let response = if (200..300).contains(&reply.status) {
        Response::from_body(family, reply.body)
    } else {
        Response::failed(family, reply.body)
    };

    if response.was_successful() {
        permit.settle(&quota, CallOutcome::Success(response.usage()));
        if let Err(e) = ctx.cache.store(&request, response.payload()).await {
            error!(fingerprint = %request.fingerprint(), error = %e, "Failed to cache response");
        }
    } else {
        warn!(model = request.model(), status = reply.status, body = %response.payload(), "Request failed");
        permit.settle(&quota, CallOutcome::Failed);
    }
    CallResult::Resolved(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_exceeded_statuses() {
        assert!(is_quota_exceeded(EndpointFamily::OpenAI, 429));
        assert!(is_quota_exceeded(EndpointFamily::Anthropic, 529));
        assert!(!is_quota_exceeded(EndpointFamily::OpenAI, 529));
        assert!(!is_quota_exceeded(EndpointFamily::Ollama, 500));
    }
}
