// src/assignment.rs
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

use crate::collect::types::Epoch;

/// Where epochs come from. `Ok(None)` means nothing is assigned right now.
#[async_trait]
pub trait AssignmentSource: Send + Sync {
    async fn active_assignment(&self) -> Result<Option<Epoch>>;
    fn name(&self) -> &'static str;
}

/// Polls a coordinator endpoint returning the current epoch as JSON.
/// 204 and 404 mean "no assignment".
pub struct HttpAssignmentSource {
    url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpAssignmentSource {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            url: url.into(),
            token: token.filter(|t| !t.trim().is_empty()),
            http,
        })
    }
}

#[async_trait]
impl AssignmentSource for HttpAssignmentSource {
    async fn active_assignment(&self) -> Result<Option<Epoch>> {
        let mut req = self.http.get(&self.url).header("Accept", "application/json");
        if let Some(t) = &self.token {
            req = req.bearer_auth(t);
        }
        let resp = req.send().await.context("assignment request")?;
        let status = resp.status();
        if status == reqwest::StatusCode::NO_CONTENT || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("assignment endpoint HTTP {}", status));
        }
        let epoch: Epoch = resp.json().await.context("decoding assignment")?;
        Ok(Some(epoch))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Reads the epoch from a JSON file. A missing or blank file means no assignment.
pub struct FileAssignmentSource {
    path: PathBuf,
}

impl FileAssignmentSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AssignmentSource for FileAssignmentSource {
    async fn active_assignment(&self) -> Result<Option<Epoch>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        let epoch = serde_json::from_str(&content)
            .with_context(|| format!("parsing assignment {}", self.path.display()))?;
        Ok(Some(epoch))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_source_missing_blank_and_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignment.json");
        let src = FileAssignmentSource::new(&path);
        assert!(src.active_assignment().await.unwrap().is_none());

        std::fs::write(&path, "  \n").unwrap();
        assert!(src.active_assignment().await.unwrap().is_none());

        std::fs::write(
            &path,
            r#"{"id":"E1","workUnits":[{"code":"90210","expectedCount":200}],"deadline":"2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let epoch = src.active_assignment().await.unwrap().unwrap();
        assert_eq!(epoch.id, "E1");
        assert_eq!(epoch.work_units[0].expected_count, 200);

        std::fs::write(&path, "{not json").unwrap();
        assert!(src.active_assignment().await.is_err());
    }
}
