//! Per-identity budget state machine.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

use super::headers::{Dimension, QuotaSnapshot};
use crate::descriptor::{Usage, UsageEstimate};

/// How calls for an identity are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One call at a time, used while quota knowledge is absent or was just violated.
    #[default]
    Sequential,
    /// Bounded concurrent calls, used once headroom has been demonstrated.
    Parallel,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => f.write_str("sequential"),
            Self::Parallel => f.write_str("parallel"),
        }
    }
}

/// Ceiling and remaining allowance of one dimension.
///
/// Both stay `None` until the endpoint reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bucket {
    /// Per-minute ceiling.
    pub ceiling: Option<u64>,
    /// Remaining allowance. Fractional so that short refill intervals accumulate.
    pub remaining: Option<f64>,
}

const WINDOW_SECS: f64 = 60.0;

/// Budget state for one endpoint identity.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetState {
    mode: DispatchMode,
    buckets: [Bucket; 4],
    last_refill: Instant,
}

fn requirement(estimate: &UsageEstimate, dimension: Dimension) -> f64 {
    let amount = match dimension {
        Dimension::Requests => 1,
        Dimension::Tokens => estimate.max_total_tokens(),
        Dimension::InputTokens => estimate.max_input_tokens,
        Dimension::OutputTokens => estimate.max_output_tokens,
    };
    amount as f64
}

impl BudgetState {
    /// A fresh state: sequential, nothing known.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self { mode: DispatchMode::Sequential, buckets: [Bucket::default(); 4], last_refill: now }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// One dimension's bucket.
    #[must_use]
    pub fn bucket(&self, dimension: Dimension) -> Bucket {
        self.buckets[dimension.index()]
    }

    /// Sets one dimension's ceiling and remaining count.
    pub fn set_bucket(&mut self, dimension: Dimension, ceiling: Option<u64>, remaining: Option<f64>) {
        self.buckets[dimension.index()] = Bucket { ceiling, remaining };
    }

    /// Switches to parallel dispatch.
    pub fn to_parallel(&mut self) {
        self.mode = DispatchMode::Parallel;
    }

    /// Switches to sequential dispatch.
    pub fn to_sequential(&mut self) {
        self.mode = DispatchMode::Sequential;
    }

    /// Refills every dimension whose ceiling is known, pro rata for the time since the last
    /// refill, never above the ceiling.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        for bucket in &mut self.buckets {
            if let (Some(ceiling), Some(remaining)) = (bucket.ceiling, bucket.remaining.as_mut()) {
                let ceiling = ceiling as f64;
                *remaining = (*remaining + ceiling * elapsed / WINDOW_SECS).min(ceiling);
            }
        }
        self.last_refill = now;
    }

    // A requirement above the ceiling can never be met; it is admitted once the bucket is full.
    fn needed(bucket: &Bucket, estimate: &UsageEstimate, dimension: Dimension) -> f64 {
        let need = requirement(estimate, dimension);
        bucket.ceiling.map_or(need, |c| need.min(c as f64))
    }

    /// Whether every dimension with a known remaining count covers the estimate.
    #[must_use]
    pub fn admit(&self, estimate: &UsageEstimate) -> bool {
        Dimension::ALL.iter().all(|&dimension| {
            let bucket = self.bucket(dimension);
            bucket
                .remaining
                .is_none_or(|remaining| remaining >= Self::needed(&bucket, estimate, dimension))
        })
    }

    /// Subtracts the estimate from every known remaining count.
    pub fn reserve(&mut self, estimate: &UsageEstimate) {
        for dimension in Dimension::ALL {
            if let Some(remaining) = self.buckets[dimension.index()].remaining.as_mut() {
                *remaining -= requirement(estimate, dimension);
            }
        }
    }

    /// Credits back the part of a reservation that the call did not use.
    pub fn reconcile(&mut self, estimate: &UsageEstimate, actual: &Usage) {
        let unused = [
            (Dimension::Tokens, estimate.max_total_tokens(), actual.total_tokens()),
            (Dimension::InputTokens, estimate.max_input_tokens, actual.total_input_tokens()),
            (Dimension::OutputTokens, estimate.max_output_tokens, actual.output_tokens),
        ];
        for (dimension, reserved, used) in unused {
            let bucket = &mut self.buckets[dimension.index()];
            if let Some(remaining) = bucket.remaining.as_mut() {
                let credit = reserved.saturating_sub(used) as f64;
                *remaining += credit;
                if let Some(ceiling) = bucket.ceiling {
                    *remaining = remaining.min(ceiling as f64);
                }
            }
        }
    }

    /// Adopts reported ceilings, and reported remaining counts where they are lower than the
    /// local estimate (or no local estimate exists).
    pub fn sync(&mut self, quota: &QuotaSnapshot) {
        for dimension in Dimension::ALL {
            let reported = quota.get(dimension);
            let bucket = &mut self.buckets[dimension.index()];
            if let Some(limit) = reported.limit {
                bucket.ceiling = Some(limit);
            }
            if let Some(reported) = reported.remaining {
                let reported = reported as f64;
                if bucket.remaining.is_none_or(|local| reported < local) {
                    bucket.remaining = Some(reported);
                }
            }
        }
    }

    /// How long refilling takes until the estimate is admissible.
    ///
    /// `Some(Duration::ZERO)` if it already is; `None` if a short dimension has no known
    /// ceiling and so will not refill until the endpoint reports one.
    #[must_use]
    pub fn time_until_admissible(&self, estimate: &UsageEstimate) -> Option<Duration> {
        let mut wait = 0.0_f64;
        for dimension in Dimension::ALL {
            let bucket = self.bucket(dimension);
            let Some(remaining) = bucket.remaining else { continue };
            let deficit = Self::needed(&bucket, estimate, dimension) - remaining;
            if deficit <= 0.0 {
                continue;
            }
            match bucket.ceiling {
                Some(ceiling) if ceiling > 0 => {
                    wait = wait.max(deficit * WINDOW_SECS / ceiling as f64);
                }
                _ => return None,
            }
        }
        Some(Duration::from_secs_f64(wait))
    }
}
