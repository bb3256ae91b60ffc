//! Quota state reported through response headers.

use tollgate_abstraction::{ApiReply, EndpointFamily};

/// One budget dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Calls per minute.
    Requests,
    /// Input plus output tokens per minute.
    Tokens,
    /// Input tokens per minute.
    InputTokens,
    /// Output tokens per minute.
    OutputTokens,
}

impl Dimension {
    /// Every dimension, in storage order.
    pub const ALL: [Self; 4] = [Self::Requests, Self::Tokens, Self::InputTokens, Self::OutputTokens];

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Requests => 0,
            Self::Tokens => 1,
            Self::InputTokens => 2,
            Self::OutputTokens => 3,
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Tokens => "tokens",
            Self::InputTokens => "input_tokens",
            Self::OutputTokens => "output_tokens",
        }
    }
}

/// Ceiling and remaining count for one dimension, as reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportedQuota {
    /// Per-minute ceiling.
    pub limit: Option<u64>,
    /// Remaining allowance in the current window.
    pub remaining: Option<u64>,
}

/// Authoritative quota values extracted from one reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaSnapshot {
    dims: [ReportedQuota; 4],
}

impl QuotaSnapshot {
    /// A snapshot reporting nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sets one dimension.
    #[must_use]
    pub fn with(mut self, dimension: Dimension, limit: Option<u64>, remaining: Option<u64>) -> Self {
        self.dims[dimension.index()] = ReportedQuota { limit, remaining };
        self
    }

    /// The reported values for a dimension.
    #[must_use]
    pub fn get(&self, dimension: Dimension) -> ReportedQuota {
        self.dims[dimension.index()]
    }

    /// Whether nothing was reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dims.iter().all(|d| d.limit.is_none() && d.remaining.is_none())
    }

    /// Parses the family's rate-limit headers from a reply.
    ///
    /// Anthropic reports `anthropic-ratelimit-<dimension>-{limit,remaining}` for requests,
    /// tokens, input tokens and output tokens. OpenAI reports
    /// `x-ratelimit-{limit,remaining}-{requests,tokens}`. Ollama reports nothing.
    #[must_use]
    pub fn from_reply(family: EndpointFamily, reply: &ApiReply) -> Self {
        let num = |name: &str| reply.header(name).and_then(|v| v.trim().parse::<u64>().ok());
        let mut snapshot = Self::empty();

        match family {
            EndpointFamily::Anthropic => {
                for (dimension, key) in [
                    (Dimension::Requests, "requests"),
                    (Dimension::Tokens, "tokens"),
                    (Dimension::InputTokens, "input-tokens"),
                    (Dimension::OutputTokens, "output-tokens"),
                ] {
                    snapshot = snapshot.with(
                        dimension,
                        num(&format!("anthropic-ratelimit-{key}-limit")),
                        num(&format!("anthropic-ratelimit-{key}-remaining")),
                    );
                }
            }
            EndpointFamily::OpenAI => {
                for (dimension, key) in [(Dimension::Requests, "requests"), (Dimension::Tokens, "tokens")] {
                    snapshot = snapshot.with(
                        dimension,
                        num(&format!("x-ratelimit-limit-{key}")),
                        num(&format!("x-ratelimit-remaining-{key}")),
                    );
                }
            }
            EndpointFamily::Ollama => {}
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_anthropic_headers() {
        let reply = ApiReply::new(200, json!({}))
            .with_header("anthropic-ratelimit-requests-limit", "50")
            .with_header("anthropic-ratelimit-requests-remaining", "49")
            .with_header("anthropic-ratelimit-input-tokens-limit", "40000")
            .with_header("anthropic-ratelimit-input-tokens-remaining", "39000")
            .with_header("anthropic-ratelimit-output-tokens-limit", "8000");
        let snapshot = QuotaSnapshot::from_reply(EndpointFamily::Anthropic, &reply);

        assert_eq!(
            snapshot.get(Dimension::Requests),
            ReportedQuota { limit: Some(50), remaining: Some(49) }
        );
        assert_eq!(snapshot.get(Dimension::InputTokens).remaining, Some(39_000));
        assert_eq!(
            snapshot.get(Dimension::OutputTokens),
            ReportedQuota { limit: Some(8_000), remaining: None }
        );
        assert_eq!(snapshot.get(Dimension::Tokens), ReportedQuota::default());
    }

    #[test]
    fn test_openai_headers() {
        let reply = ApiReply::new(200, json!({}))
            .with_header("X-RateLimit-Limit-Requests", "500")
            .with_header("X-RateLimit-Remaining-Requests", "499")
            .with_header("x-ratelimit-limit-tokens", "30000")
            .with_header("x-ratelimit-remaining-tokens", "garbage");
        let snapshot = QuotaSnapshot::from_reply(EndpointFamily::OpenAI, &reply);

        assert_eq!(snapshot.get(Dimension::Requests).remaining, Some(499));
        assert_eq!(
            snapshot.get(Dimension::Tokens),
            ReportedQuota { limit: Some(30_000), remaining: None }
        );
    }

    #[test]
    fn test_ollama_reports_nothing() {
        let reply = ApiReply::new(200, json!({})).with_header("x-ratelimit-limit-requests", "5");
        assert!(QuotaSnapshot::from_reply(EndpointFamily::Ollama, &reply).is_empty());
    }
}
