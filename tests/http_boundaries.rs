// tests/http_boundaries.rs
//
// HTTP object-store sink and HTTP assignment source against a local axum server.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Router,
};
use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};

use sold_listings_collector::assignment::{AssignmentSource, HttpAssignmentSource};
use sold_listings_collector::collect::types::{EpochResult, UnitResult, UnitStatus};
use sold_listings_collector::publish::{HttpObjectSink, ResultSink};

#[derive(Clone, Default)]
struct Store {
    puts: Arc<Mutex<Vec<(String, HeaderMap, Bytes)>>>,
    failures_left: Arc<Mutex<u32>>,
    assignment: Arc<Mutex<Option<String>>>,
}

async fn put_object(
    State(store): State<Store>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    {
        let mut left = store.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }
    store.puts.lock().unwrap().push((key, headers, body));
    StatusCode::OK
}

async fn current(State(store): State<Store>) -> impl IntoResponse {
    match store.assignment.lock().unwrap().clone() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn serve(store: Store) -> String {
    let app = Router::new()
        .route("/bucket/{*key}", put(put_object))
        .route("/epoch/current", get(current))
        .with_state(store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn result(id: &str) -> EpochResult {
    let mut per_unit = BTreeMap::new();
    let mut unit = UnitResult::pending("90210");
    unit.status = UnitStatus::Completed;
    per_unit.insert("90210".to_string(), unit);
    EpochResult {
        epoch_id: id.into(),
        nonce: "n".into(),
        superseded: false,
        started_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        finished_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap(),
        per_unit,
    }
}

#[tokio::test]
async fn object_sink_puts_digest_and_token_after_retry() {
    let store = Store::default();
    *store.failures_left.lock().unwrap() = 1;
    let base = serve(store.clone()).await;

    let sink = HttpObjectSink::new(format!("{base}/bucket"))
        .with_prefix("sold")
        .with_token(Some("secret".into()))
        .with_attempts(3);
    sink.publish(result("E1")).await.unwrap();

    let puts = store.puts.lock().unwrap();
    assert_eq!(puts.len(), 1);
    let (key, headers, body) = &puts[0];
    assert_eq!(key, "sold/E1.json");
    assert_eq!(headers["authorization"], "Bearer secret");

    let expected: String = Sha256::digest(body).iter().map(|b| format!("{b:02x}")).collect();
    assert_eq!(headers["x-content-sha256"].to_str().unwrap(), expected);

    let stored: EpochResult = serde_json::from_slice(body).unwrap();
    assert_eq!(stored, result("E1"));
}

#[tokio::test]
async fn object_sink_gives_up_after_max_attempts() {
    let store = Store::default();
    *store.failures_left.lock().unwrap() = 10;
    let base = serve(store.clone()).await;

    let sink = HttpObjectSink::new(format!("{base}/bucket")).with_attempts(2);
    assert!(sink.publish(result("E2")).await.is_err());
    assert!(store.puts.lock().unwrap().is_empty());
    assert_eq!(*store.failures_left.lock().unwrap(), 8);
}

#[tokio::test]
async fn http_assignment_source_handles_empty_and_present() {
    let store = Store::default();
    let base = serve(store.clone()).await;
    let src = HttpAssignmentSource::new(format!("{base}/epoch/current"), None).unwrap();

    assert!(src.active_assignment().await.unwrap().is_none());

    *store.assignment.lock().unwrap() = Some(
        r#"{"id":"E5","nonce":"x","deadline":"2030-01-01T00:00:00Z","workUnits":[{"code":"10001","expectedCount":150}]}"#
            .to_string(),
    );
    let epoch = src.active_assignment().await.unwrap().unwrap();
    assert_eq!(epoch.id, "E5");
    assert_eq!(epoch.work_units.len(), 1);
    assert_eq!(epoch.work_units[0].code, "10001");
}
