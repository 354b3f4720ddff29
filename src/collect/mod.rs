// src/collect/mod.rs
pub mod dedup;
pub mod epoch;
pub mod error;
pub mod fetcher;
pub mod normalize;
pub mod rate_limit;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;

use crate::collect::dedup::{identity_key, Deduplicator};
use crate::collect::epoch::{Clock, EpochTracker};
use crate::collect::fetcher::{Fetched, Halt, PageFetcher};
use crate::collect::normalize::normalize;
use crate::collect::types::{Epoch, EpochResult, Page, UnitResult, UnitStatus, WorkUnit};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("collect_pages_total", "Upstream pages fetched.");
        describe_counter!("collect_records_total", "Raw records received from upstream.");
        describe_counter!(
            "collect_duplicates_total",
            "Records dropped as repeats within a work unit."
        );
        describe_counter!(
            "collect_skipped_total",
            "Records dropped for missing required fields."
        );
        describe_counter!(
            "collect_fetch_retries_total",
            "Page fetch attempts retried after a transient failure."
        );
        describe_counter!(
            "collect_fetch_errors_total",
            "Page fetches that failed permanently."
        );
        describe_counter!("collect_units_total", "Work units finished, by status.");
        describe_histogram!("collect_fetch_ms", "Upstream page fetch time in milliseconds.");
        describe_gauge!("collect_epoch_entities", "Entities collected in the last epoch.");
        describe_gauge!(
            "collect_epoch_last_run_ts",
            "Unix ts when the last epoch finished."
        );
    });
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollectorCfg {
    /// Stop paginating once `expected_count * overfetch_factor` entities are held.
    pub overfetch_factor: f64,
    pub max_pages_per_unit: u32,
    pub unit_concurrency: usize,
    /// End a unit when a whole page turned out to be repeats.
    pub stop_on_duplicate_page: bool,
}

impl Default for CollectorCfg {
    fn default() -> Self {
        Self {
            overfetch_factor: 1.5,
            max_pages_per_unit: 20,
            unit_concurrency: 2,
            stop_on_duplicate_page: true,
        }
    }
}

impl CollectorCfg {
    pub fn entity_bound(&self, expected_count: u32) -> usize {
        (expected_count as f64 * self.overfetch_factor.max(1.0)).ceil() as usize
    }
}

/// Drives work units of an epoch through fetch, dedup and normalization.
pub struct Collector {
    fetcher: PageFetcher,
    tracker: Arc<EpochTracker>,
    clock: Arc<dyn Clock>,
    cfg: CollectorCfg,
}

enum UnitEnd {
    Done(UnitResult),
    /// Epoch was superseded; results are discarded.
    Abandoned,
}

impl Collector {
    pub fn new(
        fetcher: PageFetcher,
        tracker: Arc<EpochTracker>,
        clock: Arc<dyn Clock>,
        cfg: CollectorCfg,
    ) -> Self {
        ensure_metrics_described();
        Self {
            fetcher,
            tracker,
            clock,
            cfg,
        }
    }

    pub fn tracker(&self) -> &Arc<EpochTracker> {
        &self.tracker
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run every unit of `epoch` to a terminal state, or until a newer epoch
    /// takes over. Always returns a result; units abandoned by supersession are
    /// left out of it.
    pub async fn run_epoch(&self, epoch: Arc<Epoch>) -> EpochResult {
        let started_at = self.clock.now();
        tracing::info!(
            target: "collect",
            epoch_id = %epoch.id,
            units = epoch.work_units.len(),
            deadline = %epoch.deadline,
            source = self.fetcher.source_name(),
            "epoch collection started"
        );

        let width = self.cfg.unit_concurrency.max(1);
        let units: Vec<_> = epoch
            .work_units
            .iter()
            .map(|unit| self.run_unit(&epoch, unit))
            .collect();
        let ends: Vec<UnitEnd> = stream::iter(units).buffered(width).collect().await;

        let mut per_unit = BTreeMap::new();
        let mut superseded = false;
        for end in ends {
            match end {
                UnitEnd::Done(r) => {
                    per_unit.insert(r.code.clone(), r);
                }
                UnitEnd::Abandoned => superseded = true,
            }
        }

        let result = EpochResult {
            epoch_id: epoch.id.clone(),
            nonce: epoch.nonce.clone(),
            superseded,
            started_at,
            finished_at: self.clock.now(),
            per_unit,
        };

        let s = result.summary();
        gauge!("collect_epoch_entities").set(s.total_entities as f64);
        gauge!("collect_epoch_last_run_ts").set(result.finished_at.timestamp().max(0) as f64);
        tracing::info!(
            target: "collect",
            epoch_id = %result.epoch_id,
            completed = s.completed,
            failed = s.failed,
            deadline_missed = s.deadline_missed,
            total_entities = s.total_entities,
            superseded = result.superseded,
            "epoch collection finished"
        );
        result
    }

    async fn run_unit(&self, epoch: &Epoch, unit: &WorkUnit) -> UnitEnd {
        let code = unit.code.as_str();
        if !self.tracker.mark(&epoch.id, code, UnitStatus::InProgress) {
            return UnitEnd::Abandoned;
        }

        let bound = self.cfg.entity_bound(unit.expected_count);
        let mut result = UnitResult::pending(code);
        result.status = UnitStatus::InProgress;
        let mut dedup = Deduplicator::new();
        let mut token: Option<String> = None;

        // No upstream call for this unit starts at or after the deadline, or
        // once a newer epoch is active.
        let stop = || {
            if !self.tracker.is_current(&epoch.id) {
                Some(Halt::Superseded)
            } else if self.clock.now() >= epoch.deadline {
                Some(Halt::DeadlineReached)
            } else {
                None
            }
        };

        let status = loop {
            if result.pages_fetched >= self.cfg.max_pages_per_unit {
                tracing::warn!(target: "collect", code, pages = result.pages_fetched, "page safety limit reached");
                break UnitStatus::Completed;
            }

            let page = match self.fetcher.fetch_page(code, token.as_deref(), &stop).await {
                Ok(Fetched::Page(p)) => p,
                Ok(Fetched::Halted(Halt::DeadlineReached)) => break UnitStatus::DeadlineMissed,
                Ok(Fetched::Halted(Halt::Superseded)) => {
                    tracing::info!(target: "collect", epoch_id = %epoch.id, code, "epoch superseded, abandoning unit");
                    return UnitEnd::Abandoned;
                }
                Err(e) => {
                    result.error = Some(e.to_string());
                    break UnitStatus::Failed;
                }
            };
            // Fetches already in flight may finish, but their output is dropped.
            if !self.tracker.is_current(&epoch.id) {
                return UnitEnd::Abandoned;
            }

            result.pages_fetched += 1;
            counter!("collect_pages_total").increment(1);
            let exhausted = page.is_exhausted();
            let next = page.next_page_token.clone();
            let (added, repeats) = absorb_page(page, &mut dedup, &mut result);

            tracing::debug!(
                target: "collect",
                code,
                page = result.pages_fetched,
                added,
                repeats,
                held = result.entities.len(),
                "page processed"
            );

            if exhausted || next.is_none() {
                break UnitStatus::Completed;
            }
            if result.entities.len() >= bound {
                break UnitStatus::Completed;
            }
            if self.cfg.stop_on_duplicate_page && added == 0 && repeats > 0 {
                tracing::info!(target: "collect", code, page = result.pages_fetched, "page held only repeats, stopping");
                break UnitStatus::Completed;
            }
            token = next;
        };

        result.status = status;
        if !self.tracker.mark(&epoch.id, code, status) {
            return UnitEnd::Abandoned;
        }
        counter!("collect_units_total", "status" => status.as_str()).increment(1);
        tracing::info!(
            target: "collect",
            epoch_id = %epoch.id,
            code,
            status = status.as_str(),
            entities = result.entities.len(),
            expected = unit.expected_count,
            pages = result.pages_fetched,
            duplicates = result.duplicates_skipped,
            skipped = result.records_skipped,
            "unit finished"
        );
        UnitEnd::Done(result)
    }
}

/// Dedup + normalize one page into `result`. Returns (entities added, repeats seen).
fn absorb_page(page: Page, dedup: &mut Deduplicator, result: &mut UnitResult) -> (usize, usize) {
    let mut added = 0usize;
    let mut repeats = 0usize;
    let mut skipped = 0usize;
    counter!("collect_records_total").increment(page.records.len() as u64);

    for raw in page.records {
        let key = identity_key(&raw);
        if let Some(k) = key.as_deref() {
            if dedup.seen(k) {
                repeats += 1;
                continue;
            }
        }
        match normalize(&raw) {
            Ok(entity) => {
                dedup.mark_seen(entity.property_id.clone());
                result.entities.push(entity);
                added += 1;
            }
            Err(reason) => {
                tracing::trace!(target: "collect", code = %result.code, %reason, "record skipped");
                skipped += 1;
            }
        }
    }

    result.duplicates_skipped += repeats as u32;
    result.records_skipped += skipped as u32;
    counter!("collect_duplicates_total").increment(repeats as u64);
    counter!("collect_skipped_total").increment(skipped as u64);
    (added, repeats)
}
