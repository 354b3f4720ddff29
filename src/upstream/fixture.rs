// src/upstream/fixture.rs
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::collect::error::SourceError;
use crate::collect::types::{Page, PageSource, RawRecord};

/// Serves pre-recorded pages. The page token is the page index; continuation
/// tokens are derived from position, so recorded tokens are ignored.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    pages: HashMap<String, Vec<Vec<RawRecord>>>,
}

impl FixtureSource {
    pub fn from_pages(pages: HashMap<String, Vec<Vec<RawRecord>>>) -> Self {
        Self { pages }
    }

    /// `{ "<code>": [ { "records": [...] }, ... ] }`
    pub fn from_json_str(s: &str) -> Result<Self> {
        let raw: HashMap<String, Vec<Page>> =
            serde_json::from_str(s).context("parsing fixture pages")?;
        let pages = raw
            .into_iter()
            .map(|(code, pages)| (code, pages.into_iter().map(|p| p.records).collect()))
            .collect();
        Ok(Self { pages })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture pages from {}", path.display()))?;
        Self::from_json_str(&content)
    }
}

#[async_trait]
impl PageSource for FixtureSource {
    async fn fetch_page(&self, code: &str, page_token: Option<&str>) -> Result<Page, SourceError> {
        let idx = match page_token {
            None => 0,
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| SourceError::Malformed(format!("bad page token {t:?}")))?,
        };
        let Some(pages) = self.pages.get(code) else {
            return Ok(Page::default());
        };
        let records = pages.get(idx).cloned().unwrap_or_default();
        let next_page_token = (idx + 1 < pages.len()).then(|| (idx + 1).to_string());
        Ok(Page {
            records,
            next_page_token,
        })
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}
