use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, Method};
use serde::Serialize;
use tracing::{info, warn};

use crate::browser;
use crate::config::{GatewayConfig, ProxyEndpoint};
use crate::tasks::PeriodicTask;

/// Consecutive probe failures before a proxy is taken out of rotation.
pub const PROBE_FAILURE_THRESHOLD: u32 = 3;
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DIRECT_PATH: &str = "direct";
pub const FALLBACK_PATH: &str = "direct(fallback)";

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers,
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers,
            body: Some(body.into()),
        }
    }
}

/// A response plus the label of the network path that produced it.
#[derive(Debug)]
pub struct Dispatched {
    pub response: reqwest::Response,
    pub path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("upstream request via {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl DispatchError {
    pub fn path(&self) -> &str {
        match self {
            DispatchError::Transport { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone)]
struct PathHealth {
    healthy: bool,
    failures: u32,
    last_checked: Option<Instant>,
    last_used: Option<Instant>,
}

impl Default for PathHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            failures: 0,
            last_checked: None,
            last_used: None,
        }
    }
}

struct ProxyPath {
    label: String,
    client: Client,
}

/// Serializable view of one egress proxy, credentials redacted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PathStatus {
    pub path: String,
    pub healthy: bool,
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_secs_ago: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_secs_ago: Option<u64>,
}

/// Outbound path pool: round-robin over healthy proxies with failover to a
/// direct connection. The set of paths is fixed at construction.
pub struct EgressPool {
    direct: Client,
    proxies: Vec<ProxyPath>,
    health: RwLock<Vec<PathHealth>>,
    cursor: AtomicUsize,
    retry_count: u32,
    probe_url: String,
}

impl EgressPool {
    pub fn new(cfg: &GatewayConfig) -> Result<Self> {
        let direct = client_builder(cfg)
            .no_proxy()
            .build()
            .context("build direct http client")?;

        let mut proxies = Vec::with_capacity(cfg.proxies.len());
        for endpoint in &cfg.proxies {
            let client = proxy_client(cfg, endpoint)
                .with_context(|| format!("build client for proxy {}", endpoint.display_url()))?;
            proxies.push(ProxyPath {
                label: endpoint.display_url(),
                client,
            });
        }
        if !proxies.is_empty() {
            info!("egress pool initialized with {} proxies", proxies.len());
        }

        let health = RwLock::new(vec![PathHealth::default(); proxies.len()]);
        Ok(Self {
            direct,
            proxies,
            health,
            cursor: AtomicUsize::new(0),
            retry_count: cfg.proxy_retry_count.max(1),
            probe_url: cfg.proxy_probe_url.clone(),
        })
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    /// Next proxy index in round-robin order, skipping unhealthy ones.
    /// When every proxy is unhealthy the first one is still returned.
    pub fn select(&self) -> Option<usize> {
        let n = self.proxies.len();
        if n == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let mut health = self.health.write().unwrap_or_else(|e| e.into_inner());
        for i in 0..n {
            let idx = start.wrapping_add(i) % n;
            if health[idx].healthy {
                health[idx].last_used = Some(Instant::now());
                return Some(idx);
            }
        }
        // 兜底：全部不健康时仍然返回第一个
        health[0].last_used = Some(Instant::now());
        Some(0)
    }

    pub fn record_failure(&self, index: usize, threshold: u32) {
        let mut health = self.health.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = health.get_mut(index) else {
            return;
        };
        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= threshold && entry.healthy {
            entry.healthy = false;
            warn!(
                "egress proxy {} marked unhealthy after {} failures",
                self.proxies[index].label, entry.failures
            );
        }
    }

    pub fn record_success(&self, index: usize) {
        let mut health = self.health.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = health.get_mut(index) else {
            return;
        };
        if !entry.healthy {
            info!("egress proxy {} is healthy again", self.proxies[index].label);
        }
        entry.healthy = true;
        entry.failures = 0;
    }

    fn record_probe(&self, index: usize, ok: bool) {
        if ok {
            self.record_success(index);
        } else {
            self.record_failure(index, PROBE_FAILURE_THRESHOLD);
        }
        let mut health = self.health.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = health.get_mut(index) {
            entry.last_checked = Some(Instant::now());
        }
    }

    /// Sends the request through the pool. Transport errors move on to the
    /// next proxy; any HTTP status, including 5xx, is returned as-is.
    pub async fn dispatch(&self, req: OutboundRequest) -> Result<Dispatched, DispatchError> {
        if self.proxies.is_empty() {
            return send(&self.direct, &req)
                .await
                .map(|response| Dispatched {
                    response,
                    path: DIRECT_PATH.to_string(),
                })
                .map_err(|source| DispatchError::Transport {
                    path: DIRECT_PATH.to_string(),
                    source,
                });
        }

        for attempt in 1..=self.retry_count {
            let Some(idx) = self.select() else {
                break;
            };
            let path = &self.proxies[idx];
            match send(&path.client, &req).await {
                Ok(response) => {
                    self.record_success(idx);
                    return Ok(Dispatched {
                        response,
                        path: path.label.clone(),
                    });
                }
                Err(err) => {
                    self.record_failure(idx, self.retry_count);
                    warn!(
                        "egress via {} failed (attempt {}/{}): {}",
                        path.label, attempt, self.retry_count, err
                    );
                }
            }
        }

        warn!("all egress proxies failed, falling back to direct");
        send(&self.direct, &req)
            .await
            .map(|response| Dispatched {
                response,
                path: FALLBACK_PATH.to_string(),
            })
            .map_err(|source| DispatchError::Transport {
                path: FALLBACK_PATH.to_string(),
                source,
            })
    }

    /// One concurrent HEAD sweep through every proxy.
    pub async fn probe_all(&self) -> Vec<PathStatus> {
        let probes = self.proxies.iter().enumerate().map(|(idx, path)| async move {
            let ua = browser::random_user_agent(&mut rand::thread_rng());
            let mut req = path.client.head(&self.probe_url).timeout(PROBE_TIMEOUT);
            if let Ok(v) = HeaderValue::from_str(&ua) {
                req = req.header(USER_AGENT, v);
            }
            let ok = match req.send().await {
                Ok(_) => true,
                Err(err) => {
                    warn!("egress probe via {} failed: {}", path.label, err);
                    false
                }
            };
            self.record_probe(idx, ok);
        });
        futures_util::future::join_all(probes).await;
        self.snapshot()
    }

    /// Starts the periodic probe sweep; `None` when there is nothing to probe.
    pub fn spawn_health_checks(self: &Arc<Self>, period: Duration) -> Option<PeriodicTask> {
        if self.proxies.is_empty() {
            return None;
        }
        let pool = Arc::clone(self);
        Some(PeriodicTask::spawn("egress-health", period, move || {
            let pool = Arc::clone(&pool);
            async move {
                pool.probe_all().await;
            }
        }))
    }

    pub fn snapshot(&self) -> Vec<PathStatus> {
        let health = self.health.read().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        self.proxies
            .iter()
            .zip(health.iter())
            .map(|(path, h)| PathStatus {
                path: path.label.clone(),
                healthy: h.healthy,
                failures: h.failures,
                last_checked_secs_ago: h.last_checked.map(|t| now.duration_since(t).as_secs()),
                last_used_secs_ago: h.last_used.map(|t| now.duration_since(t).as_secs()),
            })
            .collect()
    }
}

fn client_builder(cfg: &GatewayConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(cfg.request_timeout)
        .connect_timeout(cfg.connect_timeout)
        .pool_idle_timeout(cfg.idle_conn_timeout)
        .pool_max_idle_per_host(cfg.max_conns_per_host.min(cfg.max_idle_conns))
        .tcp_keepalive(Duration::from_secs(30))
}

fn proxy_client(cfg: &GatewayConfig, endpoint: &ProxyEndpoint) -> Result<Client> {
    let mut proxy = reqwest::Proxy::all(&endpoint.url)?;
    if let (Some(user), Some(pass)) = (endpoint.username.as_deref(), endpoint.password.as_deref()) {
        proxy = proxy.basic_auth(user, pass);
    }
    Ok(client_builder(cfg).proxy(proxy).build()?)
}

async fn send(client: &Client, req: &OutboundRequest) -> Result<reqwest::Response, reqwest::Error> {
    let mut builder = client
        .request(req.method.clone(), &req.url)
        .headers(req.headers.clone());
    if let Some(body) = &req.body {
        builder = builder.body(body.clone());
    }
    builder.send().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{gateway_config, spawn_axum_server};
    use axum::http::StatusCode;
    use axum::routing::{get, post};

    fn pool_with_proxies(urls: &str) -> EgressPool {
        let cfg = gateway_config(&[("PROXY_ENABLED", "true"), ("PROXY_URLS", urls)]);
        EgressPool::new(&cfg).expect("pool")
    }

    #[test]
    fn round_robin_visits_every_healthy_path() {
        let pool = pool_with_proxies("http://10.0.0.1:1,http://10.0.0.2:1,http://10.0.0.3:1");
        let mut seen = [false; 3];
        for _ in 0..4 {
            let idx = pool.select().expect("index");
            seen[idx] = true;
        }
        assert_eq!(seen, [true, true, true]);
    }

    #[test]
    fn probe_failures_take_a_path_out_until_it_recovers() {
        let pool = pool_with_proxies("http://10.0.0.1:1,http://10.0.0.2:1");
        for _ in 0..PROBE_FAILURE_THRESHOLD {
            pool.record_probe(0, false);
        }
        for _ in 0..6 {
            assert_eq!(pool.select(), Some(1));
        }
        let snap = pool.snapshot();
        assert!(!snap[0].healthy);
        assert_eq!(snap[0].failures, PROBE_FAILURE_THRESHOLD);
        assert!(snap[0].last_checked_secs_ago.is_some());

        pool.record_probe(0, true);
        let picked: Vec<usize> = (0..4).filter_map(|_| pool.select()).collect();
        assert!(picked.contains(&0));
        assert_eq!(pool.snapshot()[0].failures, 0);
    }

    #[test]
    fn all_unhealthy_still_yields_the_first_path() {
        let pool = pool_with_proxies("http://10.0.0.1:1,http://10.0.0.2:1");
        for idx in 0..2 {
            for _ in 0..PROBE_FAILURE_THRESHOLD {
                pool.record_probe(idx, false);
            }
        }
        assert_eq!(pool.select(), Some(0));
        assert_eq!(pool.select(), Some(0));
    }

    #[test]
    fn snapshot_redacts_proxy_credentials() {
        let pool = pool_with_proxies("http://user:pw@10.0.0.1:3128");
        assert_eq!(pool.snapshot()[0].path, "http://10.0.0.1:3128");
    }

    #[tokio::test]
    async fn dead_proxies_fall_back_to_direct() {
        let app = axum::Router::new().route("/ping", get(|| async { "pong" }));
        let (addr, handle) = spawn_axum_server(app);

        let pool = pool_with_proxies("http://127.0.0.1:1");
        let out = pool
            .dispatch(OutboundRequest::get(
                format!("http://{addr}/ping"),
                HeaderMap::new(),
            ))
            .await
            .expect("fallback dispatch");
        assert_eq!(out.path, FALLBACK_PATH);
        assert_eq!(out.response.text().await.expect("body"), "pong");

        let snap = pool.snapshot();
        assert!(!snap[0].healthy);
        assert_eq!(snap[0].failures, 3);
        handle.abort();
    }

    #[tokio::test]
    async fn transport_failure_moves_on_to_the_next_proxy() {
        // axum answers absolute-form requests, so the server doubles as a proxy
        let app = axum::Router::new().route("/ping", get(|| async { "pong" }));
        let (addr, handle) = spawn_axum_server(app);

        let pool = pool_with_proxies(&format!("http://127.0.0.1:1,http://{addr}"));
        let out = pool
            .dispatch(OutboundRequest::get(
                format!("http://{addr}/ping"),
                HeaderMap::new(),
            ))
            .await
            .expect("dispatch via second proxy");
        assert_eq!(out.path, format!("http://{addr}"));
        assert_eq!(out.response.text().await.expect("body"), "pong");

        let snap = pool.snapshot();
        assert_eq!(snap[0].failures, 1);
        assert!(snap[0].healthy);
        assert_eq!(snap[1].failures, 0);
        handle.abort();
    }

    #[tokio::test]
    async fn successful_dispatch_resets_failures() {
        let app = axum::Router::new().route("/ping", get(|| async { "pong" }));
        let (addr, handle) = spawn_axum_server(app);

        let pool = pool_with_proxies(&format!("http://{addr}"));
        pool.record_failure(0, PROBE_FAILURE_THRESHOLD);
        pool.record_failure(0, PROBE_FAILURE_THRESHOLD);
        assert_eq!(pool.snapshot()[0].failures, 2);

        let out = pool
            .dispatch(OutboundRequest::get(
                format!("http://{addr}/ping"),
                HeaderMap::new(),
            ))
            .await
            .expect("dispatch");
        assert_eq!(out.path, format!("http://{addr}"));
        let snap = pool.snapshot();
        assert_eq!(snap[0].failures, 0);
        assert!(snap[0].healthy);
        handle.abort();
    }

    #[tokio::test]
    async fn http_errors_are_returned_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let app = axum::Router::new().route(
            "/fail",
            post(move || {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
                }
            }),
        );
        let (addr, handle) = spawn_axum_server(app);

        let pool = EgressPool::new(&gateway_config(&[])).expect("pool");
        let out = pool
            .dispatch(OutboundRequest::post_json(
                format!("http://{addr}/fail"),
                HeaderMap::new(),
                "{}",
            ))
            .await
            .expect("dispatch");
        assert_eq!(out.path, DIRECT_PATH);
        assert_eq!(out.response.status().as_u16(), 500);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn transport_errors_on_direct_name_the_path() {
        let pool = EgressPool::new(&gateway_config(&[])).expect("pool");
        let err = pool
            .dispatch(OutboundRequest::get("http://127.0.0.1:1/x", HeaderMap::new()))
            .await
            .expect_err("refused");
        assert_eq!(err.path(), DIRECT_PATH);
    }
}
