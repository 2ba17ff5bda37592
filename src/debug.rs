//! Request and response dumps for debug tracing.
//!
//! Credentials never reach the logs: sensitive header values are replaced by
//! their length and SHA-256 digest.

use reqwest::{
    header::{HeaderMap, HeaderName, AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, SET_COOKIE},
    ResponseBuilderExt,
};
use sha2::{Digest, Sha256};

use crate::{ApiError, Result};

const SENSITIVE_HEADERS: [HeaderName; 4] = [AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE, SET_COOKIE];

fn is_sensitive(name: &HeaderName) -> bool {
    SENSITIVE_HEADERS.contains(name)
}

pub(crate) fn redact(value: &[u8]) -> String {
    format!(
        "<apiclient: redacted {} bytes; SHA256={:x}>",
        value.len(),
        Sha256::digest(value)
    )
}

/// Renders headers one per line, redacting sensitive values.
pub(crate) fn sanitize_headers(headers: &HeaderMap) -> String {
    let mut lines = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        let shown = if is_sensitive(name) || value.is_sensitive() {
            redact(value.as_bytes())
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        lines.push(format!("{name}: {shown}"));
    }
    lines.join("\n")
}

pub(crate) fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn dump_request(request_id: u64, request: &reqwest::Request, with_body: bool) {
    tracing::debug!(
        req_id = request_id,
        "request headers:\n{}",
        indent(&sanitize_headers(request.headers()), "   - ")
    );
    if !with_body {
        return;
    }
    if let Some(body) = request.body().and_then(|body| body.as_bytes()) {
        if !body.is_empty() {
            tracing::debug!(
                req_id = request_id,
                "request body:\n{}",
                indent(&String::from_utf8_lossy(body), "   > ")
            );
        }
    }
}

/// Logs response headers and, when `with_body` is set, the body. Reading the
/// body consumes it, so an equivalent response is rebuilt around the bytes.
pub(crate) async fn dump_response(
    request_id: u64,
    response: reqwest::Response,
    with_body: bool,
) -> Result<reqwest::Response> {
    tracing::debug!(
        req_id = request_id,
        "response headers:\n{}",
        indent(&sanitize_headers(response.headers()), "   - ")
    );
    if !with_body {
        return Ok(response);
    }

    let status = response.status();
    let version = response.version();
    let url = response.url().clone();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(ApiError::Transport)?;
    if !body.is_empty() {
        tracing::debug!(
            req_id = request_id,
            "response body:\n{}",
            indent(&String::from_utf8_lossy(&body), "   < ")
        );
    }

    let mut builder = http::Response::builder()
        .status(status)
        .version(version)
        .url(url);
    if let Some(target) = builder.headers_mut() {
        *target = headers;
    }
    let rebuilt = builder
        .body(body)
        .map_err(|err| ApiError::Request(format!("could not restore response: {err}")))?;
    Ok(reqwest::Response::from(rebuilt))
}
