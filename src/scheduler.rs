// src/scheduler.rs
use std::sync::{Arc, RwLock};

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::assignment::AssignmentSource;
use crate::collect::epoch::Observation;
use crate::collect::types::{Epoch, EpochResult};
use crate::collect::Collector;
use crate::publish::ResultSink;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("publish_errors_total", "Epoch results the sink failed to store.");
        describe_counter!("assign_poll_errors_total", "Assignment polls that errored.");
        describe_counter!("assign_epochs_total", "Epochs accepted from the assignment source.");
    });
}

#[derive(Clone, Copy, Debug)]
pub struct PollerCfg {
    pub interval_secs: u64,
}

/// Outcome of the most recent finished epoch, as shown on /status.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastResult {
    pub epoch_id: String,
    pub superseded: bool,
    pub completed: usize,
    pub failed: usize,
    pub deadline_missed: usize,
    pub total_entities: usize,
    pub published: bool,
}

#[derive(Clone, Default)]
pub struct LastResultStore {
    inner: Arc<RwLock<Option<LastResult>>>,
}

impl LastResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<LastResult> {
        self.inner.read().ok().and_then(|g| g.clone())
    }

    fn set(&self, v: LastResult) {
        if let Ok(mut g) = self.inner.write() {
            *g = Some(v);
        }
    }
}

/// Collector + sink pair that turns an accepted epoch into exactly one publish.
#[derive(Clone)]
pub struct EpochRunner {
    collector: Arc<Collector>,
    sink: Arc<dyn ResultSink>,
    last: LastResultStore,
}

impl EpochRunner {
    pub fn new(collector: Arc<Collector>, sink: Arc<dyn ResultSink>, last: LastResultStore) -> Self {
        ensure_metrics_described();
        Self {
            collector,
            sink,
            last,
        }
    }

    pub fn last(&self) -> &LastResultStore {
        &self.last
    }

    /// Collect `epoch` and hand the result to the sink once. Publish errors are
    /// logged and counted; the result is returned either way.
    pub async fn run_and_publish(&self, epoch: Arc<Epoch>) -> EpochResult {
        let result = self.collector.run_epoch(epoch).await;
        let s = result.summary();

        let published = match self.sink.publish(result.clone()).await {
            Ok(()) => true,
            Err(e) => {
                counter!("publish_errors_total").increment(1);
                tracing::error!(
                    target: "publish",
                    epoch_id = %result.epoch_id,
                    sink = self.sink.name(),
                    error = ?e,
                    "publishing epoch result failed"
                );
                false
            }
        };

        self.last.set(LastResult {
            epoch_id: result.epoch_id.clone(),
            superseded: result.superseded,
            completed: s.completed,
            failed: s.failed,
            deadline_missed: s.deadline_missed,
            total_entities: s.total_entities,
            published,
        });
        result
    }

    /// Observe `epoch`; when it becomes active, start collecting it in the
    /// background. Re-deliveries and expired epochs spawn nothing.
    pub fn submit(&self, epoch: Epoch) -> (Observation, Option<JoinHandle<EpochResult>>) {
        let tracker = self.collector.tracker();
        let (obs, accepted) = tracker.admit(epoch, self.collector.clock().now());
        if let Observation::Superseded { previous, abandoned } = &obs {
            tracing::info!(target: "epoch", %previous, ?abandoned, "previous epoch superseded");
        }
        let Some(active) = accepted else {
            return (obs, None);
        };
        counter!("assign_epochs_total").increment(1);
        let runner = self.clone();
        let handle = tokio::spawn(async move { runner.run_and_publish(active).await });
        (obs, Some(handle))
    }
}

/// One poll of the assignment source.
pub async fn poll_once(
    source: &dyn AssignmentSource,
    runner: &EpochRunner,
) -> anyhow::Result<Option<JoinHandle<EpochResult>>> {
    let Some(epoch) = source.active_assignment().await? else {
        tracing::debug!(target: "assign", source = source.name(), "no assignment");
        return Ok(None);
    };
    let (_, handle) = runner.submit(epoch);
    Ok(handle)
}

/// Spawn the background loop polling `source` every `cfg.interval_secs`.
pub fn spawn_assignment_poller(
    cfg: PollerCfg,
    source: Arc<dyn AssignmentSource>,
    runner: EpochRunner,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(cfg.interval_secs.max(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = poll_once(source.as_ref(), &runner).await {
                counter!("assign_poll_errors_total").increment(1);
                tracing::warn!(target: "assign", source = source.name(), error = ?e, "assignment poll failed");
            }
        }
    })
}
