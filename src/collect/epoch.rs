//! # Epoch Tracker
//! Holds the single active assignment and per-unit progress for it.
//!
//! All state sits behind one `RwLock`; `observe` swaps the active epoch in a
//! single write section, readers get an `Arc<Epoch>` snapshot. Nothing here
//! awaits, so the lock is never held across a suspension point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collect::types::{Epoch, UnitStatus};

/// Source of "now" for deadline checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut g = self.now.lock().expect("manual clock mutex poisoned");
        *g += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("manual clock mutex poisoned")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Same id as the active epoch (re-delivery).
    Duplicate,
    /// Deadline is not in the future.
    Expired,
    NoWorkUnits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Became active; nothing was active before.
    Accepted,
    /// Became active and replaced `previous`; `abandoned` lists its unfinished codes.
    Superseded {
        previous: String,
        abandoned: Vec<String>,
    },
    Ignored(IgnoreReason),
}

impl Observation {
    pub fn is_new_epoch(&self) -> bool {
        matches!(self, Observation::Accepted | Observation::Superseded { .. })
    }
}

#[derive(Debug)]
struct Active {
    epoch: Arc<Epoch>,
    units: HashMap<String, UnitStatus>,
}

#[derive(Debug, Default)]
pub struct EpochTracker {
    inner: RwLock<Option<Active>>,
}

/// Read-only view used by the status endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveEpochView {
    pub id: String,
    pub deadline: DateTime<Utc>,
    pub units: HashMap<String, UnitStatus>,
}

impl EpochTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, candidate: Epoch, now: DateTime<Utc>) -> Observation {
        self.admit(candidate, now).0
    }

    /// Like `observe`, but also hands back the epoch that became active, taken
    /// inside the same write section so a concurrent observe cannot swap it.
    pub fn admit(&self, mut candidate: Epoch, now: DateTime<Utc>) -> (Observation, Option<Arc<Epoch>>) {
        let dropped = candidate.dedup_units();
        if !dropped.is_empty() {
            tracing::warn!(target: "epoch", epoch_id = %candidate.id, ?dropped, "repeated work-unit codes dropped");
        }

        let mut guard = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(active) = guard.as_ref() {
            if active.epoch.id == candidate.id {
                return (Observation::Ignored(IgnoreReason::Duplicate), None);
            }
        }
        if candidate.deadline <= now {
            tracing::warn!(target: "epoch", epoch_id = %candidate.id, deadline = %candidate.deadline, "assignment already expired");
            return (Observation::Ignored(IgnoreReason::Expired), None);
        }
        if candidate.work_units.is_empty() {
            return (Observation::Ignored(IgnoreReason::NoWorkUnits), None);
        }

        let units = candidate
            .work_units
            .iter()
            .map(|u| (u.code.clone(), UnitStatus::Pending))
            .collect();
        let accepted = Arc::new(candidate);
        let next = Active {
            epoch: accepted.clone(),
            units,
        };

        let obs = match guard.replace(next) {
            None => Observation::Accepted,
            Some(prev) => {
                let mut abandoned: Vec<String> = prev
                    .units
                    .iter()
                    .filter(|(_, s)| !s.is_terminal())
                    .map(|(c, _)| c.clone())
                    .collect();
                abandoned.sort();
                Observation::Superseded {
                    previous: prev.epoch.id.clone(),
                    abandoned,
                }
            }
        };

        tracing::info!(
            target: "epoch",
            epoch_id = %accepted.id,
            units = accepted.work_units.len(),
            deadline = %accepted.deadline,
            outcome = ?obs,
            "new epoch active"
        );
        (obs, Some(accepted))
    }

    pub fn active_epoch(&self) -> Option<Arc<Epoch>> {
        self.read(|a| a.map(|a| a.epoch.clone()))
    }

    /// True when there is no active epoch or its deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.read(|a| a.is_none_or(|a| a.epoch.deadline <= now))
    }

    pub fn is_current(&self, epoch_id: &str) -> bool {
        self.read(|a| a.is_some_and(|a| a.epoch.id == epoch_id))
    }

    /// Record a unit transition. Returns false when `epoch_id` is no longer active,
    /// which tells the caller to abandon the unit. Terminal states are final.
    pub fn mark(&self, epoch_id: &str, code: &str, status: UnitStatus) -> bool {
        let mut guard = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(active) = guard.as_mut().filter(|a| a.epoch.id == epoch_id) else {
            return false;
        };
        if let Some(current) = active.units.get_mut(code) {
            if !current.is_terminal() {
                *current = status;
            }
        }
        true
    }

    pub fn unit_status(&self, code: &str) -> Option<UnitStatus> {
        self.read(|a| a.and_then(|a| a.units.get(code).copied()))
    }

    pub fn view(&self) -> Option<ActiveEpochView> {
        self.read(|a| {
            a.map(|a| ActiveEpochView {
                id: a.epoch.id.clone(),
                deadline: a.epoch.deadline,
                units: a.units.clone(),
            })
        })
    }

    fn read<T>(&self, f: impl FnOnce(Option<&Active>) -> T) -> T {
        match self.inner.read() {
            Ok(g) => f(g.as_ref()),
            Err(poisoned) => f(poisoned.into_inner().as_ref()),
        }
    }
}
