use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;

use super::{ProviderRequest, ProviderResponse};
use crate::errors::RelayError;
use crate::runtime_config::RelayConfig;

const UPSTREAM_POOL_MAX_IDLE_PER_HOST: usize = 32;
const UPSTREAM_POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const ERROR_DETAIL_MAX_CHARS: usize = 512;

pub fn build_client(config: &RelayConfig, proxy: Option<&str>) -> Result<Client, String> {
    let mut builder = Client::builder()
        .connect_timeout(config.upstream_connect_timeout)
        .pool_max_idle_per_host(UPSTREAM_POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(UPSTREAM_POOL_IDLE_TIMEOUT_SECS)));
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| e.to_string())?);
    }
    builder.build().map_err(|e| e.to_string())
}

pub fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim().trim_end_matches('/'), path)
}

pub(crate) fn apply_request(client: &Client, request: &ProviderRequest) -> RequestBuilder {
    let mut builder = client
        .request(request.method.clone(), &request.url)
        .timeout(request.timeout.max(Duration::from_millis(1)));
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
        builder = builder.json(body);
    }
    builder
}

/// Sends and buffers the whole body. Any status is returned as a response;
/// only transport failures become errors here.
pub fn send(client: &Client, request: ProviderRequest) -> Result<ProviderResponse, RelayError> {
    let response = apply_request(client, &request)
        .send()
        .map_err(|err| classify_transport_error(&err))?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .map_err(|err| classify_transport_error(&err))?;
    Ok(ProviderResponse { status, body })
}

/// Opens a streaming response; non-success statuses are classified immediately.
pub fn open_stream(client: &Client, request: ProviderRequest) -> Result<Response, RelayError> {
    let response = apply_request(client, &request)
        .send()
        .map_err(|err| classify_transport_error(&err))?;
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body = response.text().unwrap_or_default();
        return Err(classify_status(status, &body));
    }
    Ok(response)
}

pub fn classify_transport_error(err: &reqwest::Error) -> RelayError {
    if err.is_timeout() {
        return RelayError::timeout(504, format!("upstream request timed out: {err}"));
    }
    RelayError::upstream_status(502, format!("upstream request failed: {err}"))
}

/// Maps a non-success upstream status to a fault. Credential and upstream-quota
/// failures are channel faults; everything else is classified by status.
pub fn classify_status(status: u16, body: &str) -> RelayError {
    let detail = error_detail(body);
    match status {
        401 | 403 => RelayError::channel(status, "upstream_auth_failed", detail),
        429 if detail.to_ascii_lowercase().contains("insufficient_quota") => {
            RelayError::channel(status, "upstream_quota_exhausted", detail)
        }
        _ => RelayError::upstream_status(status, format!("upstream status {status}: {detail}")),
    }
}

/// Best human-readable message from an upstream error body.
pub fn error_detail(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.pointer("/error/code"),
            value.get("msg"),
            value.get("message"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(text) = candidate.as_str().filter(|text| !text.trim().is_empty()) {
                return truncate(text.trim());
            }
        }
    }
    truncate(body.trim())
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= ERROR_DETAIL_MAX_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(ERROR_DETAIL_MAX_CHARS).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FaultKind;

    #[test]
    fn credential_failures_are_channel_faults() {
        let err = classify_status(401, r#"{"error":{"message":"invalid api key"}}"#);
        assert_eq!(err.kind, FaultKind::Channel);
        assert_eq!(err.message, "invalid api key");

        let err = classify_status(429, r#"{"error":{"code":"insufficient_quota"}}"#);
        assert_eq!(err.kind, FaultKind::Channel);

        let err = classify_status(429, r#"{"msg":"slow down"}"#);
        assert_eq!(err.kind, FaultKind::Upstream);
        assert_eq!(err.status_code, 429);
    }

    #[test]
    fn detail_falls_back_to_raw_body() {
        assert_eq!(error_detail("  plain failure "), "plain failure");
        assert!(error_detail(&"x".repeat(2000)).ends_with("..."));
        assert_eq!(join_url("https://api.example.com/", "/v1/x"), "https://api.example.com/v1/x");
    }
}
