// src/collect/types.rs
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collect::error::SourceError;

/// One postal-code collection target inside an epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkUnit {
    pub code: String,
    pub expected_count: u32,
}

impl WorkUnit {
    pub fn new(code: impl Into<String>, expected_count: u32) -> Self {
        Self {
            code: code.into(),
            expected_count,
        }
    }
}

/// A time-boxed batch of work units. Never mutated after issue; a newer epoch
/// supersedes it instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Epoch {
    pub id: String,
    pub work_units: Vec<WorkUnit>,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub nonce: String,
}

impl Epoch {
    /// Drop repeated codes, keeping the first occurrence. Returns the removed codes.
    pub fn dedup_units(&mut self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut dropped = Vec::new();
        self.work_units.retain(|u| {
            if seen.insert(u.code.clone()) {
                true
            } else {
                dropped.push(u.code.clone());
                false
            }
        });
        dropped
    }
}

/// Upstream record in its native, variable shape. Only the normalizer looks inside.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// One page returned by the upstream API.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(default)]
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Page {
    /// Zero records and no continuation: the unit is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.records.is_empty() && self.next_page_token.is_none()
    }
}

#[async_trait::async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch one page for `code`. `None` token means the first page.
    async fn fetch_page(&self, code: &str, page_token: Option<&str>) -> Result<Page, SourceError>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaleRecord {
    pub date: String, // YYYY-MM-DD
    pub price: f64,
}

/// Output record in the fixed reporting schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEntity {
    pub property_id: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub sales_history: Vec<SaleRecord>,
    pub sale_date: String,
    pub final_sale_price: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bathrooms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_bathrooms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_bathrooms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stories: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqft: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lot_size_sqft: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_built: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_on_market: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mls_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    DeadlineMissed,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitStatus::Completed | UnitStatus::Failed | UnitStatus::DeadlineMissed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
            UnitStatus::DeadlineMissed => "deadline_missed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitResult {
    pub code: String,
    pub status: UnitStatus,
    pub entities: Vec<NormalizedEntity>,
    pub pages_fetched: u32,
    pub duplicates_skipped: u32,
    pub records_skipped: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnitResult {
    pub fn pending(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            status: UnitStatus::Pending,
            entities: Vec::new(),
            pages_fetched: 0,
            duplicates_skipped: 0,
            records_skipped: 0,
            error: None,
        }
    }
}

/// Everything one epoch produced, handed to the result sink once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpochResult {
    pub epoch_id: String,
    pub nonce: String,
    /// Set when a newer epoch arrived mid-run; unfinished units are left out.
    pub superseded: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub per_unit: BTreeMap<String, UnitResult>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EpochSummary {
    pub completed: usize,
    pub failed: usize,
    pub deadline_missed: usize,
    pub total_entities: usize,
}

impl EpochResult {
    pub fn summary(&self) -> EpochSummary {
        let mut s = EpochSummary::default();
        for unit in self.per_unit.values() {
            match unit.status {
                UnitStatus::Completed => s.completed += 1,
                UnitStatus::Failed => s.failed += 1,
                UnitStatus::DeadlineMissed => s.deadline_missed += 1,
                UnitStatus::Pending | UnitStatus::InProgress => {}
            }
            s.total_entities += unit.entities.len();
        }
        s
    }

    pub fn total_entities(&self) -> usize {
        self.per_unit.values().map(|u| u.entities.len()).sum()
    }
}
