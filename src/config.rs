// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collect::fetcher::RetryPolicy;
use crate::collect::CollectorCfg;
use crate::upstream::RedfinCfg;

pub const ENV_CONFIG_PATH: &str = "COLLECTOR_CONFIG_PATH";
const DEFAULT_TOML: &str = "config/collector.toml";
const DEFAULT_JSON: &str = "config/collector.json";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub rate_limit: RateLimitSection,
    pub fetch: FetchSection,
    pub collect: CollectSection,
    pub upstream: UpstreamSection,
    pub assignment: AssignmentSection,
    pub publish: PublishSection,
    pub server: ServerSection,
}

/// `calls = 0` disables limiting.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSection {
    pub calls: u32,
    pub window_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            calls: 20,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchSection {
    /// Extra attempts after the first.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub timeout_secs: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectSection {
    pub overfetch_factor: f64,
    pub max_pages_per_unit: u32,
    pub unit_concurrency: usize,
    pub stop_on_duplicate_page: bool,
}

impl Default for CollectSection {
    fn default() -> Self {
        let d = CollectorCfg::default();
        Self {
            overfetch_factor: d.overfetch_factor,
            max_pages_per_unit: d.max_pages_per_unit,
            unit_concurrency: d.unit_concurrency,
            stop_on_duplicate_page: d.stop_on_duplicate_page,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Redfin,
    Fixture,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamSection {
    pub kind: UpstreamKind,
    pub base_url: String,
    pub page_size: u32,
    pub sold_within_days: u32,
    pub fixture_path: Option<PathBuf>,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        let d = RedfinCfg::default();
        Self {
            kind: UpstreamKind::Redfin,
            base_url: d.base_url,
            page_size: d.page_size,
            sold_within_days: d.sold_within_days,
            fixture_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentKind {
    Http,
    File,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssignmentSection {
    pub kind: AssignmentKind,
    pub url: Option<String>,
    pub path: Option<PathBuf>,
    pub token: Option<String>,
    pub poll_interval_secs: u64,
}

impl Default for AssignmentSection {
    fn default() -> Self {
        Self {
            kind: AssignmentKind::File,
            url: None,
            path: Some(PathBuf::from("config/assignment.json")),
            token: None,
            poll_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PublishKind {
    Http,
    Directory,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishSection {
    pub kind: PublishKind,
    pub endpoint: Option<String>,
    pub prefix: String,
    pub token: Option<String>,
    pub dir: PathBuf,
    /// Total upload attempts, the first included.
    pub max_attempts: u8,
    pub timeout_secs: u64,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            kind: PublishKind::Directory,
            endpoint: None,
            prefix: "epochs".to_string(),
            token: None,
            dir: PathBuf::from("out"),
            max_attempts: 3,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9100".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn collector_cfg(&self) -> CollectorCfg {
        CollectorCfg {
            overfetch_factor: self.collect.overfetch_factor,
            max_pages_per_unit: self.collect.max_pages_per_unit,
            unit_concurrency: self.collect.unit_concurrency,
            stop_on_duplicate_page: self.collect.stop_on_duplicate_page,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.fetch.max_retries,
            backoff_base: Duration::from_millis(self.fetch.backoff_base_ms),
        }
    }

    pub fn redfin_cfg(&self) -> RedfinCfg {
        RedfinCfg {
            base_url: self.upstream.base_url.clone(),
            page_size: self.upstream.page_size,
            sold_within_days: self.upstream.sold_within_days,
            timeout: Duration::from_secs(self.fetch.timeout_secs),
        }
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    /// Clamp values that would stall or mis-size a run.
    pub fn sanitize(mut self) -> Self {
        if !self.collect.overfetch_factor.is_finite() || self.collect.overfetch_factor < 1.0 {
            self.collect.overfetch_factor = 1.0;
        }
        self.collect.unit_concurrency = self.collect.unit_concurrency.max(1);
        self.collect.max_pages_per_unit = self.collect.max_pages_per_unit.max(1);
        self.upstream.page_size = self.upstream.page_size.max(1);
        self.assignment.poll_interval_secs = self.assignment.poll_interval_secs.max(1);
        self.publish.max_attempts = self.publish.max_attempts.max(1);
        self.publish.timeout_secs = self.publish.timeout_secs.max(1);
        self
    }

    /// `COLLECTOR_*` env vars win over file values.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_nonempty("COLLECTOR_RATE_LIMIT_PER_MINUTE") {
            self.rate_limit.calls = v
                .parse()
                .with_context(|| format!("COLLECTOR_RATE_LIMIT_PER_MINUTE={v:?}"))?;
            self.rate_limit.window_secs = 60;
        }
        if let Some(v) = env_nonempty("COLLECTOR_UPSTREAM_URL") {
            self.upstream.base_url = v;
        }
        if let Some(v) = env_nonempty("COLLECTOR_PUBLISH_ENDPOINT") {
            self.publish.kind = PublishKind::Http;
            self.publish.endpoint = Some(v);
        }
        if let Some(v) = env_nonempty("COLLECTOR_PUBLISH_TOKEN") {
            self.publish.token = Some(v);
        }
        if let Some(v) = env_nonempty("COLLECTOR_ASSIGNMENT_URL") {
            self.assignment.kind = AssignmentKind::Http;
            self.assignment.url = Some(v);
        }
        if let Some(v) = env_nonempty("COLLECTOR_BIND") {
            self.server.bind = v;
        }
        Ok(self)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<AgentConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading collector config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing collector config {}", path.display()))
}

/// Load config using env var + fallbacks:
/// 1) $COLLECTOR_CONFIG_PATH
/// 2) config/collector.toml
/// 3) config/collector.json
/// 4) built-in defaults
///
/// Env overrides and sanitizing are applied on top.
pub fn load_config_default() -> Result<AgentConfig> {
    let base = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        load_config_from(&pb)?
    } else if Path::new(DEFAULT_TOML).exists() {
        load_config_from(Path::new(DEFAULT_TOML))?
    } else if Path::new(DEFAULT_JSON).exists() {
        load_config_from(Path::new(DEFAULT_JSON))?
    } else {
        AgentConfig::default()
    };
    Ok(base.apply_env_overrides()?.sanitize())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<AgentConfig> {
    match hint_ext {
        "toml" => return Ok(toml::from_str(s)?),
        "json" => return Ok(serde_json::from_str(s)?),
        _ => {}
    }
    if let Ok(v) = serde_json::from_str(s) {
        return Ok(v);
    }
    toml::from_str(s).map_err(|e| anyhow!("unsupported config format: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    const OVERRIDE_KEYS: [&str; 6] = [
        "COLLECTOR_RATE_LIMIT_PER_MINUTE",
        "COLLECTOR_UPSTREAM_URL",
        "COLLECTOR_PUBLISH_ENDPOINT",
        "COLLECTOR_PUBLISH_TOKEN",
        "COLLECTOR_ASSIGNMENT_URL",
        "COLLECTOR_BIND",
    ];

    fn clear_env() {
        env::remove_var(ENV_CONFIG_PATH);
        for k in OVERRIDE_KEYS {
            env::remove_var(k);
        }
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = parse_config(
            r#"
            [rate_limit]
            calls = 5

            [collect]
            overfetch_factor = 2.0
            "#,
            "toml",
        )
        .unwrap();
        assert_eq!(cfg.rate_limit.calls, 5);
        assert_eq!(cfg.rate_limit.window_secs, 60);
        assert_eq!(cfg.collect.overfetch_factor, 2.0);
        assert_eq!(cfg.collect.max_pages_per_unit, 20);
        assert_eq!(cfg.upstream.kind, UpstreamKind::Redfin);
    }

    #[test]
    fn publish_section_reads_attempts_and_timeout() {
        let cfg = parse_config(
            r#"
            [publish]
            kind = "http"
            endpoint = "https://store.example/bucket"
            max_attempts = 5
            timeout_secs = 12
            "#,
            "toml",
        )
        .unwrap();
        assert_eq!(cfg.publish.kind, PublishKind::Http);
        assert_eq!(cfg.publish.max_attempts, 5);
        assert_eq!(cfg.publish.timeout_secs, 12);
        assert_eq!(cfg.publish.prefix, "epochs");
        assert_eq!(AgentConfig::default().publish.timeout_secs, 30);
    }

    #[test]
    fn json_without_hint_is_detected() {
        let cfg = parse_config(r#"{"upstream":{"kind":"fixture","fixture_path":"p.json"}}"#, "")
            .unwrap();
        assert_eq!(cfg.upstream.kind, UpstreamKind::Fixture);
        assert_eq!(cfg.upstream.fixture_path, Some(PathBuf::from("p.json")));
    }

    #[test]
    fn sanitize_clamps_degenerate_values() {
        let mut cfg = AgentConfig::default();
        cfg.collect.overfetch_factor = 0.2;
        cfg.collect.unit_concurrency = 0;
        cfg.collect.max_pages_per_unit = 0;
        cfg.publish.max_attempts = 0;
        let cfg = cfg.sanitize();
        assert_eq!(cfg.publish.max_attempts, 1);
        assert_eq!(cfg.collect.overfetch_factor, 1.0);
        assert_eq!(cfg.collect.unit_concurrency, 1);
        assert_eq!(cfg.collect.max_pages_per_unit, 1);
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        clear_env();

        // No files: built-in defaults.
        let cfg = load_config_default().unwrap();
        assert_eq!(cfg, AgentConfig::default());

        // config/collector.json is picked up.
        fs::create_dir_all("config").unwrap();
        fs::write("config/collector.json", r#"{"rate_limit":{"calls":7}}"#).unwrap();
        assert_eq!(load_config_default().unwrap().rate_limit.calls, 7);

        // Explicit path wins.
        let p = tmp.path().join("other.toml");
        fs::write(&p, "[rate_limit]\ncalls = 11\n").unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        assert_eq!(load_config_default().unwrap().rate_limit.calls, 11);

        // And env overrides win over the file.
        env::set_var("COLLECTOR_RATE_LIMIT_PER_MINUTE", "3");
        env::set_var("COLLECTOR_PUBLISH_ENDPOINT", "https://store.example");
        let cfg = load_config_default().unwrap();
        assert_eq!(cfg.rate_limit.calls, 3);
        assert_eq!(cfg.publish.kind, PublishKind::Http);

        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(load_config_default().is_err());

        clear_env();
        env::set_current_dir(&old).unwrap();
    }
}
