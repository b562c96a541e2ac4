use std::collections::HashMap;

use crate::config::GatewayConfig;

pub fn spawn_axum_server(app: axum::Router) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    listener.set_nonblocking(true).expect("nonblocking");
    let listener = tokio::net::TcpListener::from_std(listener).expect("to tokio listener");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, handle)
}

/// A config with test-friendly timeouts and no egress proxies unless given.
pub fn gateway_config(pairs: &[(&str, &str)]) -> GatewayConfig {
    let mut map: HashMap<String, String> = HashMap::from([
        ("PROXY_ENABLED".to_string(), "false".to_string()),
        ("REQUEST_TIMEOUT".to_string(), "10s".to_string()),
        ("CONNECT_TIMEOUT".to_string(), "2s".to_string()),
        ("READ_TIMEOUT".to_string(), "5s".to_string()),
        ("WRITE_TIMEOUT".to_string(), "10s".to_string()),
        ("MODELS_FILE".to_string(), "/nonexistent/models.json".to_string()),
        ("UPSTREAM_API_KEY".to_string(), "test-upstream-key".to_string()),
    ]);
    for (k, v) in pairs {
        map.insert(k.to_string(), v.to_string());
    }
    GatewayConfig::from_lookup(|k| map.get(k).cloned()).expect("test config")
}
