//! Plumbing shared by the HTTP endpoints.

use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use tollgate_abstraction::{ApiReply, EndpointError, EndpointFamily, Payload};
use tracing::{debug, error};

/// Sends a request and turns whatever comes back into an [`ApiReply`].
///
/// Only transport failures are errors; HTTP error statuses become replies.
pub(crate) async fn send_for_reply(
    family: EndpointFamily,
    request: RequestBuilder,
) -> Result<ApiReply, EndpointError> {
    let response = request.send().await.map_err(|e| {
        error!(%family, error = %e, "Failed to send request");
        EndpointError::RequestError(format!("Network error: {e}"))
    })?;
    into_reply(family, response).await
}

async fn into_reply(family: EndpointFamily, response: Response) -> Result<ApiReply, EndpointError> {
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_lowercase(), value.to_str().ok()?.to_string())))
        .collect();

    let bytes = response.bytes().await.map_err(|e| {
        error!(%family, status, error = %e, "Failed to read response body");
        EndpointError::RequestError(format!("Failed to read body: {e}"))
    })?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            debug!(%family, status, error = %e, "Response body is not JSON");
            Value::Null
        })
    };

    Ok(ApiReply { status, headers, body })
}

/// Reads the API key for a family from the environment, treating an empty value as absent.
#[allow(clippy::disallowed_methods)] // env::var is needed for API key loading
pub(crate) fn env_api_key(family: EndpointFamily) -> Option<String> {
    family
        .credential_var()
        .and_then(|var| std::env::var(var).ok())
        .filter(|key| !key.trim().is_empty())
}

/// Reads a base URL override from the environment.
#[allow(clippy::disallowed_methods)]
pub(crate) fn env_base_url(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Fails with `MissingCredential` unless a key is present.
pub(crate) fn require_key(family: EndpointFamily, key: Option<&str>) -> Result<(), EndpointError> {
    match key {
        Some(key) if !key.is_empty() => Ok(()),
        _ => Err(EndpointError::MissingCredential {
            family,
            variable: family.credential_var().unwrap_or_default().to_string(),
        }),
    }
}

/// Copies the named fields of a payload, skipping absent ones.
pub(crate) fn select_fields(payload: &Payload, fields: &[&str]) -> Payload {
    fields
        .iter()
        .filter_map(|&field| payload.get(field).map(|v| (field.to_string(), v.clone())))
        .collect()
}
