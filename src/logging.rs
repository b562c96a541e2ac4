use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use base64::Engine;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn env_bool(key: &str) -> bool {
    let Ok(v) = std::env::var(key) else {
        return false;
    };
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

#[derive(Debug, Clone, Copy)]
pub struct HttpWarnOptions {
    /// Log the full (capped) upstream error body instead of a one-line summary.
    pub verbose: bool,
    pub max_body_bytes: usize,
}

pub fn http_warn_options() -> HttpWarnOptions {
    static OPT: OnceLock<HttpWarnOptions> = OnceLock::new();
    *OPT.get_or_init(|| {
        let verbose = env_bool("GATEWAY_HTTP_WARN");
        let max_body_bytes = std::env::var("GATEWAY_HTTP_WARN_BODY_MAX")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(4 * 1024);
        HttpWarnOptions {
            verbose,
            max_body_bytes,
        }
    })
}

#[derive(Debug, Serialize, Clone)]
pub struct BodyPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub encoding: String,
    pub data: String,
    pub truncated: bool,
    pub original_len: usize,
}

fn normalize_content_type(content_type: Option<&str>) -> Option<&str> {
    let ct = content_type?.trim();
    let (base, _) = ct.split_once(';').unwrap_or((ct, ""));
    let base = base.trim();
    if base.is_empty() { None } else { Some(base) }
}

fn is_textual(content_type: Option<&str>, bytes: &[u8]) -> bool {
    match normalize_content_type(content_type) {
        Some(ct) => {
            ct.starts_with("text/")
                || ct == "application/json"
                || ct.ends_with("+json")
                || ct == "application/xml"
                || ct.ends_with("+xml")
        }
        // 无 Content-Type 时按内容判断
        None => std::str::from_utf8(bytes).is_ok(),
    }
}

/// Capped preview of a body for logs; non-text bodies are base64 encoded.
pub fn make_body_preview(bytes: &[u8], content_type: Option<&str>, max: usize) -> BodyPreview {
    let original_len = bytes.len();
    let take = original_len.min(max);
    let truncated = original_len > take;
    let slice = &bytes[..take];

    let (encoding, data) = if is_textual(content_type, slice) {
        let mut text = String::from_utf8_lossy(slice).into_owned();
        if truncated {
            text.push_str("...");
        }
        ("utf8", text)
    } else {
        (
            "base64",
            base64::engine::general_purpose::STANDARD.encode(slice),
        )
    };
    BodyPreview {
        content_type: normalize_content_type(content_type).map(|s| s.to_string()),
        encoding: encoding.to_string(),
        data,
        truncated,
        original_len,
    }
}

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

/// The three log lines of one client exchange: `⇣ REQ`, `⇡ UP`, and a summary.
#[derive(Debug, Clone)]
pub struct ExchangeLog {
    pub id: String,
    kind: &'static str,
    started: Instant,
}

impl ExchangeLog {
    pub fn new(kind: &'static str) -> Self {
        Self {
            id: new_request_id(),
            kind,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn request(&self, model: &str, route: &str, messages: usize, stream: bool, client: Option<SocketAddr>) {
        let client = client.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
        info!(
            "[{}] ⇣ REQ ({}) model={} route={} msgs={} stream={} client={}",
            self.id, self.kind, model, route, messages, stream, client
        );
    }

    pub fn upstream(&self, status: u16, path: &str, detail: &str) {
        if detail.is_empty() {
            info!("[{}] ⇡ UP  status={} via={}", self.id, status, path);
        } else {
            info!("[{}] ⇡ UP  status={} via={} {}", self.id, status, path, detail);
        }
    }

    pub fn ok(&self, summary: &str) {
        info!("[{}] ✔ OK  {} duration={:?}", self.id, summary, self.elapsed());
    }

    pub fn empty(&self, summary: &str) {
        warn!(
            "[{}] ⚠ WARN {} duration={:?} | no data received",
            self.id,
            summary,
            self.elapsed()
        );
    }

    pub fn error(&self, summary: &str) {
        warn!("[{}] ✘ ERR {} duration={:?}", self.id, summary, self.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_previews_are_capped_and_marked() {
        let p = make_body_preview(b"hello world", Some("text/plain; charset=utf-8"), 5);
        assert_eq!(p.encoding, "utf8");
        assert_eq!(p.data, "hello...");
        assert!(p.truncated);
        assert_eq!(p.original_len, 11);
        assert_eq!(p.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn binary_previews_are_base64() {
        let p = make_body_preview(&[0xff, 0xfe, 0x00], Some("application/octet-stream"), 16);
        assert_eq!(p.encoding, "base64");
        assert_eq!(p.data, "//4A");
        assert!(!p.truncated);
    }

    #[test]
    fn untyped_utf8_is_treated_as_text() {
        let p = make_body_preview(b"{\"a\":1}", None, 64);
        assert_eq!(p.encoding, "utf8");
        assert_eq!(p.data, "{\"a\":1}");
    }

    #[test]
    fn request_ids_are_prefixed_and_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }
}
