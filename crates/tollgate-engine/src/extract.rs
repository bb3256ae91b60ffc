//! Field extraction from vendor response bodies.
//!
//! Works on any body the engine returns, including cached ones, by recognising the vendor from
//! the body's shape.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Why generation stopped, normalised across vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end or stop sequence.
    Stop,
    /// Output ceiling reached.
    Length,
    /// The model asked for a tool call.
    ToolCalls,
    /// Output withheld by a content filter.
    ContentFilter,
}

impl FinishReason {
    /// OpenAI-style name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A body reported a stop reason this crate does not know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {vendor} stop reason `{reason}`")]
pub struct UnknownFinishReason {
    /// Vendor whose body carried the reason.
    pub vendor: &'static str,
    /// The reason as reported.
    pub reason: String,
}

/// Generated text of a body, or `None` for failed or unrecognised bodies.
#[must_use]
pub fn extract_text(body: &Value) -> Option<&str> {
    let text = if body.get("choices").is_some() {
        body.pointer("/choices/0/message/content")
    } else if body.get("content").is_some() {
        body.pointer("/content/0/text")
    } else if body.get("message").is_some() {
        body.pointer("/message/content")
    } else if body.get("output").is_some() {
        // AWS Bedrock Converse
        body.pointer("/output/message/content/0/text")
    } else {
        None
    };
    text.and_then(Value::as_str)
}

/// Normalised finish reason of a body, or `None` for failed or unrecognised bodies.
///
/// # Errors
/// Returns `UnknownFinishReason` if the vendor reported a reason outside the known set.
pub fn extract_finish_reason(body: &Value) -> Result<Option<FinishReason>, UnknownFinishReason> {
    let unknown = |vendor: &'static str, reason: &str| UnknownFinishReason {
        vendor,
        reason: reason.to_string(),
    };

    if body.get("choices").is_some() {
        let Some(reason) = body.pointer("/choices/0/finish_reason").and_then(Value::as_str) else {
            return Ok(None);
        };
        return match reason {
            "stop" => Ok(Some(FinishReason::Stop)),
            "length" => Ok(Some(FinishReason::Length)),
            "tool_calls" | "function_call" => Ok(Some(FinishReason::ToolCalls)),
            "content_filter" => Ok(Some(FinishReason::ContentFilter)),
            other => Err(unknown("openai", other)),
        };
    }

    for (key, vendor) in [("stop_reason", "anthropic"), ("stopReason", "bedrock")] {
        if let Some(reason) = body.get(key).and_then(Value::as_str) {
            return match reason {
                "end_turn" | "stop_sequence" => Ok(Some(FinishReason::Stop)),
                "max_tokens" => Ok(Some(FinishReason::Length)),
                "tool_use" => Ok(Some(FinishReason::ToolCalls)),
                other => Err(unknown(vendor, other)),
            };
        }
    }

    if let Some(reason) = body.get("done_reason").and_then(Value::as_str) {
        return match reason {
            "stop" => Ok(Some(FinishReason::Stop)),
            "length" => Ok(Some(FinishReason::Length)),
            other => Err(unknown("ollama", other)),
        };
    }

    Ok(None)
}
