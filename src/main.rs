//! Sold-listings collector, binary entrypoint.
//! Loads config, starts the assignment poller and serves health/status/metrics.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sold_listings_collector::config::load_config_default;
use sold_listings_collector::metrics::Metrics;
use sold_listings_collector::scheduler::{spawn_assignment_poller, PollerCfg};
use sold_listings_collector::{build_agent, router};

const DEFAULT_FILTER: &str = "collect=info,fetch=info,epoch=info,publish=info,assign=info,warn";

/// Compact logs by default; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_config_default()?;
    tracing::info!(
        rate_calls = cfg.rate_limit.calls,
        rate_window_secs = cfg.rate_limit.window_secs,
        upstream = ?cfg.upstream.kind,
        assignment = ?cfg.assignment.kind,
        publish = ?cfg.publish.kind,
        "config loaded"
    );

    let metrics = Metrics::init(cfg.rate_limit.calls, cfg.rate_limit.window_secs)?;
    let agent = build_agent(&cfg)?;

    let _poller = spawn_assignment_poller(
        PollerCfg {
            interval_secs: cfg.assignment.poll_interval_secs,
        },
        agent.assignments.clone(),
        agent.runner.clone(),
    );

    let app = router(agent.state.clone()).merge(metrics.router());
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind))?;
    tracing::info!(bind = %cfg.server.bind, "status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("status server")?;
    Ok(())
}
