use axum::http::{HeaderMap, StatusCode};
use serde_json::Value;
use tracing::warn;

use crate::error::{ApiError, coerce_upstream_status};
use crate::logging::{ExchangeLog, http_warn_options, make_body_preview};

const PLAIN_ERROR_MAX_CHARS: usize = 200;

fn header_value_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn looks_like_cloudflare_challenge_html(headers: &HeaderMap, body: &[u8]) -> bool {
    let ct = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !ct.starts_with("text/html") {
        return false;
    }
    contains_bytes(body, b"__CF$cv$params")
        || contains_bytes(body, b"/cdn-cgi/")
        || contains_bytes(body, b"challenge-platform")
        || contains_bytes(body, b"cf-chl-")
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct UpstreamClass {
    pub class: Option<&'static str>,
    pub hint: Option<&'static str>,
    pub cf_ray: Option<String>,
}

/// Labels upstream failures that come from the CDN in front of the site
/// rather than from the completion API itself.
pub(super) fn classify_upstream_response(status: u16, headers: &HeaderMap, body: &[u8]) -> UpstreamClass {
    let cf_ray = header_value_str(headers, "cf-ray");
    let server = header_value_str(headers, "server")
        .unwrap_or_default()
        .to_ascii_lowercase();
    let looks_cf = server.contains("cloudflare") || cf_ray.is_some();

    if looks_cf && status == 524 {
        return UpstreamClass {
            class: Some("cloudflare_timeout"),
            hint: Some(
                "Cloudflare 524: the origin did not answer in time; check upstream latency and whether the first SSE bytes are flushed promptly",
            ),
            cf_ray,
        };
    }

    if looks_like_cloudflare_challenge_html(headers, body) {
        return UpstreamClass {
            class: Some("cloudflare_challenge"),
            hint: Some(
                "Cloudflare/WAF challenge page (text/html with cdn-cgi markers); the egress path or browser headers are being blocked",
            ),
            cf_ray,
        };
    }

    UpstreamClass {
        cf_ray,
        ..Default::default()
    }
}

/// Best-effort human message from an upstream JSON error body.
pub(super) fn extract_error_message(body: &Value) -> String {
    let candidates = [
        body.get("error").and_then(|e| e.get("message")),
        body.get("message"),
        body.get("error"),
        body.get("detail"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(Value::as_str)
        .unwrap_or("Unknown error")
        .to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Consumes a non-200 upstream response and maps it to the client error.
/// JSON object bodies are forwarded untouched; anything else is summarized.
pub(super) async fn upstream_error(resp: reqwest::Response, log: &ExchangeLog) -> ApiError {
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(err) => {
            log.error(&format!("read body: {err} | status={}", status.as_u16()));
            return ApiError::Upstream {
                status,
                message: format!("Upstream error (status {})", status.as_u16()),
            };
        }
    };

    let class = classify_upstream_response(status.as_u16(), &headers, &bytes);
    if let Some(cls) = class.class {
        warn!(
            "[{}] upstream {} class={} cf_ray={} hint: {}",
            log.id,
            status.as_u16(),
            cls,
            class.cf_ray.as_deref().unwrap_or("-"),
            class.hint.unwrap_or("-")
        );
    }
    let opts = http_warn_options();
    if opts.verbose {
        let ct = headers.get("content-type").and_then(|v| v.to_str().ok());
        let preview = make_body_preview(&bytes, ct, opts.max_body_bytes);
        warn!(
            "[{}] upstream error body ({} bytes, {}): {}",
            log.id, preview.original_len, preview.encoding, preview.data
        );
    }

    if let Ok(json @ Value::Object(_)) = serde_json::from_slice::<Value>(&bytes) {
        log.error(&format!(
            "msg={} | status={}",
            extract_error_message(&json),
            status.as_u16()
        ));
        return ApiError::UpstreamBody {
            status: coerce_upstream_status(status),
            body: bytes,
        };
    }

    let text = truncate_chars(&String::from_utf8_lossy(&bytes), PLAIN_ERROR_MAX_CHARS);
    log.error(&format!("msg={} | status={}", text, status.as_u16()));
    ApiError::Upstream {
        status: coerce_upstream_status(status),
        message: format!("Upstream error: {text}"),
    }
}
