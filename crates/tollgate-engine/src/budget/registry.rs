//! Process-wide registry of budget states and in-flight calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::headers::QuotaSnapshot;
use super::state::{BudgetState, DispatchMode};
use crate::config::SequentialScope;
use crate::descriptor::{Usage, UsageEstimate};

/// Concurrency limits applied at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Maximum in-flight calls per identity in parallel mode.
    pub parallel_ceiling: usize,
    /// Which in-flight calls block a sequential dispatch.
    pub sequential_scope: SequentialScope,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self { parallel_ceiling: 20, sequential_scope: SequentialScope::Global }
    }
}

/// Result of an admission attempt.
#[derive(Debug)]
pub enum Admission {
    /// The call may proceed; the permit holds its slot and reservation.
    Granted(Permit),
    /// The budget does not cover the estimate yet.
    OverBudget {
        /// Time until refills make room, if it can be known.
        retry_after: Option<Duration>,
    },
    /// The budget covers the estimate but no concurrency slot is free.
    Throttled,
}

/// How a dispatched call ended, for settling its permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// A successful result with its actual usage.
    Success(Usage),
    /// The endpoint refused the call for quota reasons; it will be retried.
    QuotaExceeded,
    /// Any other failure; it will not be retried.
    Failed,
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<String, BudgetState>,
    in_flight: HashMap<String, usize>,
    total_in_flight: usize,
}

/// Owns one [`BudgetState`] per endpoint identity plus the in-flight counters.
///
/// All check-and-mutate steps run under one lock which is never held across a network call.
#[derive(Debug, Default)]
pub struct BudgetRegistry {
    inner: Mutex<Inner>,
}

impl BudgetRegistry {
    /// A private, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every engine in the process.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<BudgetRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tries to admit a call for `model`.
    ///
    /// Refills the identity's budget, checks it against the estimate, then checks the
    /// concurrency limit of the current mode. On success the estimate is reserved and an
    /// in-flight slot is taken until the returned permit is dropped.
    pub fn try_acquire(
        self: &Arc<Self>,
        model: &str,
        estimate: UsageEstimate,
        policy: &AdmissionPolicy,
        now: Instant,
    ) -> Admission {
        let mut inner = self.lock();
        let Inner { states, in_flight, total_in_flight } = &mut *inner;

        let state = states.entry(model.to_string()).or_insert_with(|| BudgetState::new(now));
        state.refill(now);

        if !state.admit(&estimate) {
            return Admission::OverBudget { retry_after: state.time_until_admissible(&estimate) };
        }

        let own = in_flight.get(model).copied().unwrap_or(0);
        let mode = state.mode();
        let busy = match mode {
            DispatchMode::Sequential => match policy.sequential_scope {
                SequentialScope::Global => *total_in_flight > 0,
                SequentialScope::PerEndpoint => own > 0,
            },
            DispatchMode::Parallel => own >= policy.parallel_ceiling,
        };
        if busy {
            return Admission::Throttled;
        }

        state.reserve(&estimate);
        *in_flight.entry(model.to_string()).or_insert(0) += 1;
        *total_in_flight += 1;
        debug!(model, %mode, in_flight = own + 1, "Admitted call");

        Admission::Granted(Permit {
            registry: Arc::clone(self),
            model: model.to_string(),
            estimate,
            mode,
        })
    }

    /// A copy of an identity's state.
    #[must_use]
    pub fn state(&self, model: &str) -> Option<BudgetState> {
        self.lock().states.get(model).cloned()
    }

    /// An identity's current mode; sequential if it was never used.
    #[must_use]
    pub fn mode(&self, model: &str) -> DispatchMode {
        self.lock().states.get(model).map(BudgetState::mode).unwrap_or_default()
    }

    /// Replaces an identity's state.
    pub fn insert_state(&self, model: &str, state: BudgetState) {
        self.lock().states.insert(model.to_string(), state);
    }

    /// In-flight calls for one identity.
    #[must_use]
    pub fn in_flight(&self, model: &str) -> usize {
        self.lock().in_flight.get(model).copied().unwrap_or(0)
    }

    /// In-flight calls across all identities.
    #[must_use]
    pub fn total_in_flight(&self) -> usize {
        self.lock().total_in_flight
    }

    fn settle(&self, model: &str, estimate: &UsageEstimate, quota: &QuotaSnapshot, outcome: CallOutcome) {
        let mut inner = self.lock();
        let state = inner
            .states
            .entry(model.to_string())
            .or_insert_with(|| BudgetState::new(Instant::now()));

        state.sync(quota);
        match outcome {
            CallOutcome::Success(usage) => {
                state.reconcile(estimate, &usage);
                if state.mode() == DispatchMode::Sequential {
                    state.to_parallel();
                    info!(model, "Call succeeded, switching to parallel dispatch");
                }
            }
            CallOutcome::QuotaExceeded => {
                if state.mode() == DispatchMode::Parallel {
                    state.to_sequential();
                    warn!(model, "Quota exceeded, switching to sequential dispatch");
                }
            }
            CallOutcome::Failed => {}
        }
    }

    fn release(&self, model: &str) {
        let mut inner = self.lock();
        if let Some(count) = inner.in_flight.get_mut(model) {
            *count = count.saturating_sub(1);
        }
        inner.total_in_flight = inner.total_in_flight.saturating_sub(1);
    }
}

/// An admitted call's in-flight slot and budget reservation.
///
/// Dropping the permit frees the slot, whether or not it was settled, so aborted calls
/// cannot leak slots.
#[derive(Debug)]
pub struct Permit {
    registry: Arc<BudgetRegistry>,
    model: String,
    estimate: UsageEstimate,
    mode: DispatchMode,
}

impl Permit {
    /// The identity this permit was granted for.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The mode the identity was in at admission.
    #[must_use]
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// The reserved estimate.
    #[must_use]
    pub fn estimate(&self) -> UsageEstimate {
        self.estimate
    }

    /// Applies the reported quota and the call's outcome to the identity's budget, then frees
    /// the slot.
    ///
    /// Success reconciles the reservation and moves a sequential identity to parallel;
    /// quota-exceeded moves a parallel identity back to sequential.
    pub fn settle(self, quota: &QuotaSnapshot, outcome: CallOutcome) {
        self.registry.settle(&self.model, &self.estimate, quota, outcome);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.registry.release(&self.model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Dimension;

    fn estimate() -> UsageEstimate {
        UsageEstimate { max_input_tokens: 100, max_output_tokens: 100 }
    }

    fn granted(admission: Admission) -> Permit {
        match admission {
            Admission::Granted(permit) => permit,
            other => panic!("expected a permit, got {other:?}"),
        }
    }

    #[test]
    fn test_sequential_allows_one_call() {
        let registry = Arc::new(BudgetRegistry::new());
        let policy = AdmissionPolicy::default();
        let now = Instant::now();

        let permit = granted(registry.try_acquire("m", estimate(), &policy, now));
        assert_eq!(permit.mode(), DispatchMode::Sequential);
        assert!(matches!(registry.try_acquire("m", estimate(), &policy, now), Admission::Throttled));

        drop(permit);
        assert_eq!(registry.in_flight("m"), 0);
        assert!(matches!(registry.try_acquire("m", estimate(), &policy, now), Admission::Granted(_)));
    }

    #[test]
    fn test_global_scope_couples_identities() {
        let registry = Arc::new(BudgetRegistry::new());
        let now = Instant::now();
        let global = AdmissionPolicy::default();
        let scoped = AdmissionPolicy { sequential_scope: SequentialScope::PerEndpoint, ..global };

        let _a = granted(registry.try_acquire("a", estimate(), &global, now));
        assert!(matches!(registry.try_acquire("b", estimate(), &global, now), Admission::Throttled));
        assert!(matches!(registry.try_acquire("b", estimate(), &scoped, now), Admission::Granted(_)));
    }

    #[test]
    fn test_success_switches_to_parallel() {
        let registry = Arc::new(BudgetRegistry::new());
        let policy = AdmissionPolicy { parallel_ceiling: 2, ..AdmissionPolicy::default() };
        let now = Instant::now();

        let permit = granted(registry.try_acquire("m", estimate(), &policy, now));
        permit.settle(&QuotaSnapshot::empty(), CallOutcome::Success(Usage::default()));
        assert_eq!(registry.mode("m"), DispatchMode::Parallel);
        assert_eq!(registry.total_in_flight(), 0);

        let a = granted(registry.try_acquire("m", estimate(), &policy, now));
        let _b = granted(registry.try_acquire("m", estimate(), &policy, now));
        assert!(matches!(registry.try_acquire("m", estimate(), &policy, now), Admission::Throttled));

        a.settle(&QuotaSnapshot::empty(), CallOutcome::QuotaExceeded);
        assert_eq!(registry.mode("m"), DispatchMode::Sequential);
        assert_eq!(registry.in_flight("m"), 1);
    }

    #[test]
    fn test_quota_exceeded_while_sequential_keeps_mode() {
        let registry = Arc::new(BudgetRegistry::new());
        let permit = granted(registry.try_acquire("m", estimate(), &AdmissionPolicy::default(), Instant::now()));
        permit.settle(&QuotaSnapshot::empty(), CallOutcome::QuotaExceeded);
        assert_eq!(registry.mode("m"), DispatchMode::Sequential);
    }

    #[test]
    fn test_over_budget_reports_refill_time() {
        let registry = Arc::new(BudgetRegistry::new());
        let now = Instant::now();
        let mut state = BudgetState::new(now);
        state.set_bucket(Dimension::Tokens, Some(6_000), Some(0.0));
        registry.insert_state("m", state);

        match registry.try_acquire("m", estimate(), &AdmissionPolicy::default(), now) {
            Admission::OverBudget { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("expected over budget, got {other:?}"),
        }
        assert_eq!(registry.in_flight("m"), 0);
    }

    #[test]
    fn test_settle_syncs_reported_quota() {
        let registry = Arc::new(BudgetRegistry::new());
        let permit = granted(registry.try_acquire("m", estimate(), &AdmissionPolicy::default(), Instant::now()));
        let quota = QuotaSnapshot::empty().with(Dimension::Requests, Some(50), Some(10));
        permit.settle(&quota, CallOutcome::Failed);

        let state = registry.state("m").unwrap();
        assert_eq!(state.bucket(Dimension::Requests).remaining, Some(10.0));
        assert_eq!(state.mode(), DispatchMode::Sequential);
    }
}
