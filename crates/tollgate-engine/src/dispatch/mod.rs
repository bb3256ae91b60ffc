//! Adaptive dispatch of request batches.
//!
//! One coordinating loop per batch scans the pending pairs in dispatch order, asks the budget
//! registry for admission, and runs admitted calls inline (sequential mode) or on a `JoinSet`
//! (parallel mode). Between scans it waits for the next task to finish, a backoff timer, or
//! cancellation.

pub mod approval;
pub mod engine;
pub mod pair;
pub mod retry;

pub use approval::{Approver, AutoApprover, StdinApprover};
pub use engine::{BatchEstimate, Engine, is_quota_exceeded};
pub use pair::PairStatus;
pub use retry::RetryPolicy;
