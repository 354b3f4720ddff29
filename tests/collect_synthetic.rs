// tests/collect_synthetic.rs
//
// Seeded synthetic pages: random required-field omission, random repeats,
// and the shared rate budget under a paused clock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use sold_listings_collector::collect::epoch::{EpochTracker, SystemClock};
use sold_listings_collector::collect::error::SourceError;
use sold_listings_collector::collect::fetcher::{PageFetcher, RetryPolicy};
use sold_listings_collector::collect::rate_limit::RateLimiter;
use sold_listings_collector::collect::types::{Epoch, Page, PageSource, RawRecord, UnitStatus, WorkUnit};
use sold_listings_collector::collect::{Collector, CollectorCfg};
use sold_listings_collector::upstream::FixtureSource;

const REQUIRED: [&str; 7] = ["propertyId", "streetLine", "city", "state", "zip", "soldDate", "price"];

fn home(id: u64) -> RawRecord {
    json!({
        "propertyId": id,
        "streetLine": format!("{id} Synthetic Rd"),
        "city": "Austin",
        "state": "TX",
        "zip": "78701",
        "soldDate": 1_700_000_000_000i64 + id as i64 * 3_600_000,
        "price": 300_000 + id * 10,
        "beds": 3
    })
    .as_object()
    .cloned()
    .unwrap()
}

fn collector_for(source: Arc<dyn PageSource>, limiter: Arc<RateLimiter>) -> (Collector, Arc<EpochTracker>) {
    let tracker = Arc::new(EpochTracker::new());
    let fetcher = PageFetcher::new(source, limiter, RetryPolicy::default());
    let cfg = CollectorCfg {
        stop_on_duplicate_page: false,
        ..CollectorCfg::default()
    };
    (
        Collector::new(fetcher, tracker.clone(), Arc::new(SystemClock), cfg),
        tracker,
    )
}

fn far_epoch(code: &str, expected: u32) -> Epoch {
    Epoch {
        id: "S1".into(),
        work_units: vec![WorkUnit::new(code, expected)],
        deadline: Utc::now() + chrono::Duration::hours(1),
        nonce: String::new(),
    }
}

#[tokio::test]
async fn random_omissions_and_repeats_are_accounted_for() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut intact: HashSet<String> = HashSet::new();
    let mut broken = 0u32;
    let mut repeats = 0u32;
    let mut pages: Vec<Vec<RawRecord>> = Vec::new();
    let mut emitted: Vec<RawRecord> = Vec::new();

    for p in 0..6u64 {
        let mut page = Vec::new();
        for i in 0..40u64 {
            // Every fifth slot replays an intact record seen earlier.
            if i % 5 == 4 && !emitted.is_empty() {
                let pick = emitted[rng.random_range(0..emitted.len())].clone();
                page.push(pick);
                repeats += 1;
                continue;
            }
            let id = 1 + p * 1000 + i;
            let mut rec = home(id);
            if rng.random_bool(0.25) {
                let field = REQUIRED[rng.random_range(1..REQUIRED.len())];
                rec.remove(field);
                broken += 1;
            } else {
                intact.insert(id.to_string());
                emitted.push(rec.clone());
            }
            page.push(rec);
        }
        pages.push(page);
    }

    let mut map = HashMap::new();
    map.insert("78701".to_string(), pages);
    let source = Arc::new(FixtureSource::from_pages(map));
    let (c, tracker) = collector_for(source, Arc::new(RateLimiter::unlimited()));

    tracker.observe(far_epoch("78701", 10_000), Utc::now());
    let result = c.run_epoch(tracker.active_epoch().unwrap()).await;
    let unit = &result.per_unit["78701"];

    assert_eq!(unit.status, UnitStatus::Completed);
    assert_eq!(unit.pages_fetched, 6);
    assert_eq!(unit.records_skipped, broken);
    assert_eq!(unit.duplicates_skipped, repeats);

    let ids: HashSet<String> = unit.entities.iter().map(|e| e.property_id.clone()).collect();
    assert_eq!(ids.len(), unit.entities.len(), "an entity was emitted twice");
    assert_eq!(ids, intact);
    for e in &unit.entities {
        assert!(!e.address.is_empty());
        assert!(!e.city.is_empty());
        assert!(!e.state.is_empty());
        assert_eq!(e.zip_code, "78701");
        assert!(e.final_sale_price > 0.0);
        assert!(!e.sales_history.is_empty());
    }
}

/// Records the (paused) tokio time of every call.
struct Stamped {
    pages: u64,
    calls: Mutex<Vec<tokio::time::Instant>>,
}

#[async_trait::async_trait]
impl PageSource for Stamped {
    async fn fetch_page(&self, _code: &str, token: Option<&str>) -> Result<Page, SourceError> {
        self.calls.lock().unwrap().push(tokio::time::Instant::now());
        let idx: u64 = token.map(|t| t.parse().unwrap()).unwrap_or(0);
        Ok(Page {
            records: vec![home(idx + 1)],
            next_page_token: (idx + 1 < self.pages).then(|| (idx + 1).to_string()),
        })
    }
    fn name(&self) -> &'static str {
        "stamped"
    }
}

#[tokio::test(start_paused = true)]
async fn rate_budget_holds_over_any_window() {
    let source = Arc::new(Stamped {
        pages: 7,
        calls: Mutex::new(Vec::new()),
    });
    let window = Duration::from_secs(60);
    let limiter = Arc::new(RateLimiter::new(3, window));
    let (c, tracker) = collector_for(source.clone(), limiter);

    tracker.observe(far_epoch("78701", 10_000), Utc::now());
    let result = c.run_epoch(tracker.active_epoch().unwrap()).await;
    assert_eq!(result.per_unit["78701"].pages_fetched, 7);

    let calls = source.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 7);
    for (i, start) in calls.iter().enumerate() {
        let in_window = calls[i..].iter().filter(|t| t.duration_since(*start) < window).count();
        assert!(in_window <= 3, "{in_window} calls within one window starting at call {i}");
    }
    assert!(calls[6].duration_since(calls[0]) >= Duration::from_secs(120));
}
