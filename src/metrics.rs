use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and publish the configured fetch budget
    /// as a static gauge (0 = unlimited). Fails if a recorder is already installed.
    pub fn init(rate_limit_calls: u32, window_secs: u64) -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        describe_gauge!(
            "collect_rate_limit_calls",
            "Upstream calls allowed per rate-limit window."
        );
        describe_gauge!("collect_rate_limit_window_secs", "Rate-limit window length.");
        gauge!("collect_rate_limit_calls").set(rate_limit_calls as f64);
        gauge!("collect_rate_limit_window_secs").set(window_secs as f64);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
