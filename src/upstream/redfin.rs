// src/upstream/redfin.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;

use crate::collect::error::SourceError;
use crate::collect::rate_limit::RateLimiter;
use crate::collect::types::{Page, PageSource, RawRecord};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// JSON bodies from the GIS endpoint carry this anti-hijacking prefix.
const JSON_GUARD: &str = "{}&&";

#[derive(Debug, Clone)]
pub struct RedfinCfg {
    pub base_url: String,
    pub page_size: u32,
    pub sold_within_days: u32,
    pub timeout: Duration,
}

impl Default for RedfinCfg {
    fn default() -> Self {
        Self {
            base_url: "https://www.redfin.com".to_string(),
            page_size: 350,
            sold_within_days: 1095,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Sold listings from the listing site's GIS search endpoint.
pub struct RedfinGisSource {
    http: reqwest::Client,
    cfg: RedfinCfg,
    /// Region lookups are upstream calls too, so they share the fetch budget.
    limiter: Arc<RateLimiter>,
    regions: Mutex<HashMap<String, String>>,
}

impl RedfinGisSource {
    pub fn new(cfg: RedfinCfg, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(cfg.timeout)
            .build()?;
        Ok(Self {
            http,
            cfg,
            limiter,
            regions: Mutex::new(HashMap::new()),
        })
    }

    async fn region_id(&self, code: &str) -> Result<String, SourceError> {
        if let Some(hit) = self.cached_region(code) {
            return Ok(hit);
        }

        self.limiter.acquire().await;
        let url = format!("{}/zipcode/{}", self.cfg.base_url.trim_end_matches('/'), code);
        let resp = self
            .http
            .get(&url)
            .header("Accept", "text/html")
            .send()
            .await?;
        check_status(resp.status())?;
        let html = resp.text().await?;

        let id = extract_region_id(&html).ok_or_else(|| SourceError::UnknownCode(code.to_string()))?;
        tracing::debug!(target: "fetch", code, region_id = %id, "resolved region");
        if let Ok(mut g) = self.regions.lock() {
            g.insert(code.to_string(), id.clone());
        }
        Ok(id)
    }

    fn cached_region(&self, code: &str) -> Option<String> {
        self.regions.lock().ok()?.get(code).cloned()
    }
}

#[async_trait]
impl PageSource for RedfinGisSource {
    async fn fetch_page(&self, code: &str, page_token: Option<&str>) -> Result<Page, SourceError> {
        let page_number = match page_token {
            None => 1,
            Some(t) => t
                .parse::<u32>()
                .map_err(|_| SourceError::Malformed(format!("bad page token {t:?}")))?,
        };
        let region_id = self.region_id(code).await?;
        let start = page_number.saturating_sub(1).saturating_mul(self.cfg.page_size);

        let url = format!("{}/stingray/api/gis", self.cfg.base_url.trim_end_matches('/'));
        let referer = format!(
            "{}/zipcode/{}/filter/include=sold-3yr/page-{}",
            self.cfg.base_url.trim_end_matches('/'),
            code,
            page_number
        );
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("al", "1".to_string()),
                ("include_nearby_homes", "true".to_string()),
                ("market", "national".to_string()),
                ("num_homes", self.cfg.page_size.to_string()),
                ("ord", "redfin-recommended-asc".to_string()),
                ("page_number", page_number.to_string()),
                ("region_id", region_id),
                ("region_type", "2".to_string()),
                ("sold_within_days", self.cfg.sold_within_days.to_string()),
                ("start", start.to_string()),
                ("status", "9".to_string()),
                ("uipt", "1,2,3,4,5,6,7,8".to_string()),
                ("v", "8".to_string()),
            ])
            .header("Accept", "application/json")
            .header("Referer", referer)
            .send()
            .await?;
        check_status(resp.status())?;
        let body = resp.text().await?;

        let (records, returned) = parse_gis_body(&body)?;
        let next_page_token =
            (returned >= self.cfg.page_size as usize).then(|| (page_number + 1).to_string());

        tracing::debug!(
            target: "fetch",
            code,
            page = page_number,
            returned,
            sold = records.len(),
            "gis page"
        );
        Ok(Page {
            records,
            next_page_token,
        })
    }

    fn name(&self) -> &'static str {
        "redfin"
    }
}

fn check_status(status: reqwest::StatusCode) -> Result<(), SourceError> {
    if status.as_u16() == 429 {
        return Err(SourceError::RateLimited);
    }
    if !status.is_success() {
        return Err(SourceError::Status(status.as_u16()));
    }
    Ok(())
}

/// Region id embedded in a postal-code landing page.
pub fn extract_region_id(html: &str) -> Option<String> {
    static RES: OnceCell<Vec<Regex>> = OnceCell::new();
    let res = RES.get_or_init(|| {
        [
            r#""region_id["']?\s*[:=]\s*(\d+)"#,
            r#"region_id["']?\s*[:=]\s*(\d+)"#,
            r#"/region/(\d+)/"#,
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });
    res.iter()
        .find_map(|re| re.captures(html))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse a GIS response into sold homes. Also returns how many homes the page
/// held before filtering, which drives pagination.
pub fn parse_gis_body(body: &str) -> Result<(Vec<RawRecord>, usize), SourceError> {
    let text = body.trim_start();
    let text = text.strip_prefix(JSON_GUARD).unwrap_or(text);
    let v: Value = serde_json::from_str(text).map_err(|e| SourceError::Malformed(e.to_string()))?;

    let Some(homes) = v
        .get("payload")
        .and_then(|p| p.get("homes"))
        .and_then(Value::as_array)
    else {
        return Ok((Vec::new(), 0));
    };

    let records = homes
        .iter()
        .filter_map(Value::as_object)
        .filter(|h| is_sold(h))
        .cloned()
        .collect();
    Ok((records, homes.len()))
}

fn is_sold(home: &RawRecord) -> bool {
    let has_date = home.get("soldDate").is_some_and(|v| !v.is_null());
    let status_sold = home
        .get("mlsStatus")
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("sold"));
    has_date || status_sold
}
