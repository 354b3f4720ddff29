// src/publish.rs
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use sha2::{Digest, Sha256};

use crate::collect::types::EpochResult;

/// Hands a finished epoch to storage. Called once per epoch with an owned copy.
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, result: EpochResult) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Serialized batch plus its hex SHA-256, as uploaded.
pub fn encode_result(result: &EpochResult) -> Result<(Vec<u8>, String)> {
    let body = serde_json::to_vec(result).context("serializing epoch result")?;
    let digest = Sha256::digest(&body);
    let mut hex = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut hex, "{:02x}", b);
    }
    Ok((body, hex))
}

/// Object key for an epoch: `<prefix>/<epoch_id>.json`.
pub fn object_key(prefix: &str, epoch_id: &str) -> String {
    let safe: String = epoch_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{safe}.json")
    } else {
        format!("{prefix}/{safe}.json")
    }
}

/* ----------------------------
HTTP object store (PUT)
---------------------------- */

#[derive(Clone)]
pub struct HttpObjectSink {
    endpoint: String,
    prefix: String,
    token: Option<String>,
    client: Client,
    timeout: Duration,
    /// Total upload attempts, the first included.
    max_attempts: u8,
}

impl HttpObjectSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            prefix: String::new(),
            token: None,
            client: Client::new(),
            timeout: Duration::from_secs(30),
            max_attempts: 3,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_attempts(mut self, attempts: u8) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn url_for(&self, epoch_id: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            object_key(&self.prefix, epoch_id)
        )
    }
}

#[async_trait::async_trait]
impl ResultSink for HttpObjectSink {
    async fn publish(&self, result: EpochResult) -> Result<()> {
        let (body, digest) = encode_result(&result)?;
        let url = self.url_for(&result.epoch_id);

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let mut req = self
                .client
                .put(&url)
                .timeout(self.timeout)
                .header("content-type", "application/json")
                .header("x-content-sha256", &digest)
                .body(body.clone());
            if let Some(t) = &self.token {
                req = req.bearer_auth(t);
            }

            let err = match req.send().await {
                Ok(rsp) if rsp.status().is_success() => {
                    tracing::info!(
                        target: "publish",
                        epoch_id = %result.epoch_id,
                        %url,
                        bytes = body.len(),
                        sha256 = %digest,
                        "epoch result uploaded"
                    );
                    return Ok(());
                }
                // Client errors will not improve on retry.
                Ok(rsp) if rsp.status().is_client_error() => {
                    return Err(anyhow!("object store rejected upload: HTTP {}", rsp.status()));
                }
                Ok(rsp) => anyhow!("object store HTTP error: {}", rsp.status()),
                Err(e) => anyhow!("object store request failed: {e}"),
            };

            if attempt < self.max_attempts {
                tracing::warn!(target: "publish", attempt, error = %err, "upload failed, retrying");
                tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                continue;
            }
            return Err(err);
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/* ----------------------------
Local directory
---------------------------- */

/// Writes `<dir>/<epoch_id>.json` via a temp file + rename.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, epoch_id: &str) -> PathBuf {
        self.dir.join(object_key("", epoch_id))
    }
}

#[async_trait::async_trait]
impl ResultSink for DirectorySink {
    async fn publish(&self, result: EpochResult) -> Result<()> {
        let (body, digest) = encode_result(&result)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let path = self.path_for(&result.epoch_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;

        tracing::info!(
            target: "publish",
            epoch_id = %result.epoch_id,
            path = %path.display(),
            sha256 = %digest,
            "epoch result written"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "directory"
    }
}

// --- Test helper ---
pub struct MemorySink {
    pub published: std::sync::Mutex<Vec<EpochResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            published: std::sync::Mutex::new(vec![]),
        }
    }

    pub fn snapshot(&self) -> Vec<EpochResult> {
        self.published
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ResultSink for MemorySink {
    async fn publish(&self, result: EpochResult) -> Result<()> {
        self.published
            .lock()
            .map_err(|_| anyhow!("memory sink poisoned"))?
            .push(result);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_path_safe() {
        assert_eq!(object_key("", "E1"), "E1.json");
        assert_eq!(object_key("/miner/epochs/", "E1"), "miner/epochs/E1.json");
        assert_eq!(object_key("p", "a/../b c"), "p/a_.._b_c.json");
    }

    #[test]
    fn url_joins_endpoint_and_key() {
        let s = HttpObjectSink::new("https://store.example/bucket/".into()).with_prefix("sold");
        assert_eq!(s.url_for("E7"), "https://store.example/bucket/sold/E7.json");
    }
}
