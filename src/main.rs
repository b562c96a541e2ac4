mod browser;
mod catalog;
mod config;
mod credential;
mod egress;
mod error;
mod logging;
mod model_routing;
mod openai;
mod proxy;
mod session;
mod tasks;
#[cfg(test)]
mod testutil;
mod transcode;
mod translate;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;

use crate::catalog::ModelCatalog;
use crate::catalog::registry::parse_models;
use crate::config::GatewayConfig;
use crate::credential::Credential;
use crate::egress::EgressPool;
use crate::proxy::GatewayService;

#[derive(Parser, Debug)]
#[command(name = "dialect-gateway")]
#[command(about = "OpenAI-compatible gateway in front of a two-dialect chat upstream", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP gateway (default)
    Serve {
        /// Listen port; overrides PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Probe every configured egress proxy once and print its health
    Probe,
    /// Print the models file as the gateway would route it
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => run_server(port).await,
        Command::Probe => run_probe().await,
        Command::Models => print_models().await,
    }
}

async fn run_server(port_override: Option<u16>) -> Result<()> {
    let mut cfg = GatewayConfig::from_env().context("load configuration")?;
    if let Some(port) = port_override {
        cfg.port = port;
    }
    let cfg = Arc::new(cfg);

    let credential = Arc::new(Credential::new(cfg.upstream_api_key.clone()));
    tracing::info!(
        "upstream credential {} ({})",
        credential.fingerprint(),
        if credential.is_override() { "override" } else { "embedded" }
    );

    let egress = Arc::new(EgressPool::new(&cfg).context("build egress pool")?);
    tracing::info!(
        "egress: {} proxies (enabled={})",
        egress.proxy_count(),
        cfg.proxy_enabled
    );

    let catalog = Arc::new(ModelCatalog::new(
        &cfg,
        egress.clone(),
        credential.clone(),
        catalog::REFRESH_INTERVAL,
    ));
    catalog.load_initial().await;

    let mut tasks = catalog.start();
    tasks.extend(egress.spawn_health_checks(cfg.proxy_health_check));

    let svc = Arc::new(GatewayService::new(cfg.clone(), egress, catalog, credential));
    let app = proxy::router(svc);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!("dialect-gateway listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tasks::stop_all(tasks).await;
    tracing::info!("dialect-gateway stopped");
    Ok(())
}

async fn run_probe() -> Result<()> {
    let cfg = GatewayConfig::from_env().context("load configuration")?;
    let egress = EgressPool::new(&cfg).context("build egress pool")?;

    println!("{}", "dialect-gateway egress probe".bold());
    println!("{}", "============================".bold());
    if egress.proxy_count() == 0 {
        println!(
            "{} no egress proxies configured (PROXY_ENABLED={}); all traffic goes direct",
            "[WARN]".yellow(),
            cfg.proxy_enabled
        );
        return Ok(());
    }

    println!("probe url: {}", cfg.proxy_probe_url);
    let statuses = egress.probe_all().await;
    let healthy = statuses.iter().filter(|s| s.healthy).count();
    for status in &statuses {
        if status.healthy {
            println!("{}   {}", "[OK]".green(), status.path);
        } else {
            println!(
                "{} {} (failures={})",
                "[FAIL]".red(),
                status.path,
                status.failures
            );
        }
    }
    println!("{}/{} proxies healthy", healthy, statuses.len());
    Ok(())
}

async fn print_models() -> Result<()> {
    let cfg = GatewayConfig::from_env().context("load configuration")?;
    let raw = tokio::fs::read_to_string(&cfg.models_file)
        .await
        .with_context(|| format!("read {}", cfg.models_file.display()))?;
    let entries = parse_models(&raw)?;

    println!(
        "{} ({} models)",
        cfg.models_file.display().to_string().bold(),
        entries.len()
    );
    for entry in &entries {
        let category = entry.category.map(|c| c.as_str()).unwrap_or("-");
        let route = match (entry.category, entry.persona_id) {
            (Some(c), Some(id)) if c.is_session() => format!("session persona={id}"),
            (Some(c), None) if c.is_session() => "session (persona from cache)".yellow().to_string(),
            _ => format!(
                "direct provider={}",
                entry.api_provider.as_deref().unwrap_or("-")
            ),
        };
        println!("  {:<3} {:<40} {:<16} {}", category, entry.id, entry.owned_by, route);
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            tracing::warn!("failed to install signal handlers; falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    // 收到退出信号后停止接收新连接，已有流继续到结束
    tracing::info!("shutdown signal received, draining connections");
}
