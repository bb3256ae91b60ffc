//! Content-addressable response cache.
//!
//! Every successful response is persisted as one JSON file named after the fingerprint of the
//! request that produced it. A lookup only hits when the stored request equals the current one,
//! so a fingerprint collision degrades to a miss.

pub mod store;
pub mod types;

pub use store::{CacheError, ResponseCache};
pub use types::{CacheEntry, CacheStats, Fingerprint};
