// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{AppError, Result};

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(user_agent: &str, timeout_secs: u64) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(timeout_secs))
        .gzip(true)
        .build()?;
    Ok(client)
}

/// Send a request and decode a JSON body, mapping non-success statuses
/// to [`AppError::Upstream`].
pub async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    context: &str,
) -> Result<T> {
    let body = send_checked(request, context).await?;
    serde_json::from_slice(&body)
        .map_err(|e| AppError::upstream(context, format!("invalid JSON response: {e}")))
}

/// Send a request and return the raw body of a successful response.
pub async fn send_checked(request: reqwest::RequestBuilder, context: &str) -> Result<Vec<u8>> {
    let response = request
        .send()
        .await
        .map_err(|e| AppError::upstream(context, e))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| AppError::upstream(context, e))?;

    if !status.is_success() {
        let snippet: String = String::from_utf8_lossy(&body).chars().take(200).collect();
        return Err(AppError::upstream(context, format!("HTTP {status}: {snippet}")));
    }
    Ok(body.to_vec())
}
