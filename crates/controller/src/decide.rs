//! Per-item delivery decision.
//!
//! Rules run in a fixed order and the first one that applies wins:
//! disabled change type, cache miss (an error, so the item is retried),
//! replay of objects older than the scope start, stale `MODIFIED`
//! resyncs, then the extra filter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kew_core::{Action, ChangeType, QueueItem, WatchConfig};
use kew_filter::{ExtraFilter, Verdict};
use kew_kubehub::ObjectCache;

use crate::ProcessError;

pub const DEFAULT_STALENESS: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionPolicy {
    /// `MODIFIED` items whose last change is older than this are dropped.
    pub staleness: Duration,
}

impl Default for DecisionPolicy {
    fn default() -> Self { Self { staleness: DEFAULT_STALENESS } }
}

impl DecisionPolicy {
    pub fn for_scope(cfg: &WatchConfig) -> Self {
        Self { staleness: cfg.staleness_secs.map(Duration::from_secs).unwrap_or(DEFAULT_STALENESS) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppressed {
    Ineligible,
    Replay,
    Stale,
    Filtered,
}

impl Suppressed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Suppressed::Ineligible => "ineligible",
            Suppressed::Replay => "replay",
            Suppressed::Stale => "stale",
            Suppressed::Filtered => "filtered",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Decision {
    /// `event` is `None` for deletions.
    Deliver { action: Action, event: Option<Arc<Event>> },
    Suppress(Suppressed),
}

/// Most recent change time recorded on an event.
pub fn last_change_time(ev: &Event) -> Option<DateTime<Utc>> {
    ev.last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| ev.series.as_ref().and_then(|s| s.last_observed_time.as_ref()).map(|t| t.0))
        .or_else(|| ev.event_time.as_ref().map(|t| t.0))
}

pub struct DecisionEngine {
    policy: DecisionPolicy,
    filter: Option<ExtraFilter>,
    start_time: DateTime<Utc>,
}

impl DecisionEngine {
    pub fn new(policy: DecisionPolicy, filter: Option<ExtraFilter>, start_time: DateTime<Utc>) -> Self { Self { policy, filter, start_time } }

    pub fn start_time(&self) -> DateTime<Utc> { self.start_time }

    pub fn decide(&self, item: &QueueItem, cache: &dyn ObjectCache, now: DateTime<Utc>) -> Result<Decision, ProcessError> {
        if !item.eligible {
            return Ok(Decision::Suppress(Suppressed::Ineligible));
        }
        // Deleted objects are gone from the cache; only the key is left to report.
        if item.change == ChangeType::Deleted {
            return Ok(Decision::Deliver { action: Action::Deleted, event: None });
        }
        let ev = cache.get_by_key(&item.key).ok_or_else(|| ProcessError::NotFound(item.key.clone()))?;

        match ev.metadata.creation_timestamp.as_ref() {
            Some(Time(created)) if *created >= self.start_time => {}
            _ => return Ok(Decision::Suppress(Suppressed::Replay)),
        }
        if item.change == ChangeType::Modified && self.is_stale(&ev, now) {
            return Ok(Decision::Suppress(Suppressed::Stale));
        }
        if let Some(f) = &self.filter {
            if f.evaluate(&ev) == Verdict::Suppress {
                return Ok(Decision::Suppress(Suppressed::Filtered));
            }
        }
        Ok(Decision::Deliver { action: item.change.action(), event: Some(ev) })
    }

    /// Whole-second comparison: exactly the window is still fresh.
    fn is_stale(&self, ev: &Event, now: DateTime<Utc>) -> bool {
        match last_change_time(ev) {
            Some(last) => now.timestamp() - last.timestamp() > self.policy.staleness.as_secs() as i64,
            None => true,
        }
    }
}
