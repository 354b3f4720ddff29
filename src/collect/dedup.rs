// src/collect/dedup.rs
use std::collections::HashSet;

use serde_json::Value;

use crate::collect::types::RawRecord;

/// Identity keys seen during one work unit's pass. Create a fresh one per unit.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn mark_seen(&mut self, key: impl Into<String>) {
        self.seen.insert(key.into());
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Source-native property id, as a string. `None` when the record carries none.
pub fn identity_key(raw: &RawRecord) -> Option<String> {
    let v = raw.get("propertyId")?;
    let v = match v {
        Value::Object(o) => o.get("value")?,
        other => other,
    };
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
