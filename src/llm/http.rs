//! HTTP plumbing shared by the hosted model clients.
//!
//! Every completion is a single POST. Failures are reported once and never
//! retried; the pipeline records them as generation failures and the user
//! decides whether to ask again.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{ParleyError, Result};

/// Text of the error reported when a model answers with nothing usable.
pub const EMPTY_RESPONSE: &str = "no response from model";

/// Identifies a provider in error messages.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Provider {
    pub name: &'static str,
    /// Environment variable holding the key, if the provider needs one.
    pub key_var: Option<&'static str>,
}

/// Builds a reqwest client whose requests give up after `timeout`.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ParleyError::llm(format!("Failed to create HTTP client: {e}")))
}

/// Sends `request` once and decodes a successful body as `T`.
pub(crate) async fn send_json<T: DeserializeOwned>(
    provider: Provider,
    request: RequestBuilder,
) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(provider, &e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ParleyError::llm(format!("Failed to read {} response: {e}", provider.name)))?;
    debug!(provider = provider.name, %status, body_len = body.len(), "Model API responded");

    if !status.is_success() {
        return Err(status_error(provider, status, &body));
    }

    serde_json::from_str(&body)
        .map_err(|e| ParleyError::llm(format!("Failed to parse {} response: {e}", provider.name)))
}

/// Rejects responses that carry no text.
pub(crate) fn require_text(text: Option<String>) -> Result<String> {
    text.filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ParleyError::llm(EMPTY_RESPONSE))
}

fn transport_error(provider: Provider, error: &reqwest::Error) -> ParleyError {
    if error.is_timeout() {
        ParleyError::llm(format!("{} request timed out", provider.name))
    } else if error.is_connect() {
        ParleyError::llm(format!("Cannot reach the {} API", provider.name))
    } else {
        ParleyError::llm(format!("{} request failed: {error}", provider.name))
    }
}

/// Error bodies come as `{"error": {"message": ..}}` or `{"error": ".."}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Nested { error: ErrorDetail },
    Flat { error: String },
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

fn status_error(provider: Provider, status: StatusCode, body: &str) -> ParleyError {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        if let Some(var) = provider.key_var {
            return ParleyError::llm(format!(
                "{} rejected the API key. Check {var}.",
                provider.name
            ));
        }
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ParleyError::llm(format!("{} rate limit reached", provider.name));
    }

    let detail = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody::Nested { error }) => error.message,
        Ok(ErrorBody::Flat { error }) => error,
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => format!("{status}: {}", body.trim()),
    };
    ParleyError::llm(format!("{} API error: {detail}", provider.name))
}
