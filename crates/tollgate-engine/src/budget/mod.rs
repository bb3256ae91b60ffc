//! Per-endpoint budget tracking.
//!
//! Each endpoint identity has a [`BudgetState`]: per-minute ceilings and remaining allowances
//! for requests, tokens, input tokens and output tokens, plus a [`DispatchMode`]. Calls are
//! admitted pessimistically (the estimate is reserved before the call) and reconciled with
//! actual usage afterwards. Authoritative values arrive through response headers.
//!
//! The mode is a small self-correcting control loop:
//!
//! - `sequential -> parallel` on a success while sequential
//! - `parallel -> sequential` on a quota-exceeded reply while parallel

pub mod headers;
pub mod registry;
pub mod state;

pub use headers::{Dimension, QuotaSnapshot, ReportedQuota};
pub use registry::{Admission, AdmissionPolicy, BudgetRegistry, CallOutcome, Permit};
pub use state::{Bucket, BudgetState, DispatchMode};
