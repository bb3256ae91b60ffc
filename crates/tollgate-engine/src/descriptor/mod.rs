//! Request and response descriptors.
//!
//! Payloads stay opaque documents; descriptors read the few fields the engine needs (identity,
//! output ceiling, sampling settings, usage) through accessors and derive estimates from them.

pub mod request;
pub mod response;

pub use request::{MissingField, Request, UsageEstimate, ValidationWarning, input_token_bound, prompt_parts};
pub use response::{Response, Usage, is_success_body};
