#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kew_controller::{Decision, DecisionEngine, DecisionPolicy, ProcessError, Suppressed};
use kew_core::{Action, ChangeType, Conjunction, ExtraFilterConfig, FilterMode, FilterRule, QueueItem};
use kew_filter::ExtraFilter;
use kew_kubehub::ObjectCache;

#[derive(Default)]
struct MapCache {
    objects: HashMap<String, Arc<Event>>,
    lookups: AtomicUsize,
}

impl ObjectCache for MapCache {
    fn get_by_key(&self, key: &str) -> Option<Arc<Event>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.objects.get(key).cloned()
    }
}

fn at(secs: i64) -> DateTime<Utc> { Utc.timestamp_opt(secs, 0).unwrap() }

const START: i64 = 1_700_000_000;

fn event(ns: &str, reason: &str, type_: &str, created: i64, last: i64) -> Event {
    Event {
        metadata: ObjectMeta { namespace: Some(ns.into()), name: Some("ev".into()), creation_timestamp: Some(Time(at(created))), ..Default::default() },
        involved_object: ObjectReference { kind: Some("Pod".into()), name: Some("web-0".into()), ..Default::default() },
        reason: Some(reason.into()),
        type_: Some(type_.into()),
        last_timestamp: Some(Time(at(last))),
        ..Default::default()
    }
}

fn cache_with(ev: Event) -> MapCache {
    let mut c = MapCache::default();
    c.objects.insert("default/ev".into(), Arc::new(ev));
    c
}

fn engine(filter: Option<ExtraFilter>) -> DecisionEngine { DecisionEngine::new(DecisionPolicy::default(), filter, at(START)) }

fn item(change: ChangeType) -> QueueItem { QueueItem::new("default/ev", change, true) }

fn suppressed(d: Decision) -> Option<Suppressed> {
    match d {
        Decision::Suppress(s) => Some(s),
        Decision::Deliver { .. } => None,
    }
}

#[test]
fn ineligible_items_skip_the_cache() {
    let cache = cache_with(event("default", "Started", "Normal", START + 1, START + 1));
    let d = engine(None).decide(&QueueItem::new("default/ev", ChangeType::Added, false), &cache, at(START + 2)).unwrap();
    assert_eq!(suppressed(d), Some(Suppressed::Ineligible));
    assert_eq!(cache.lookups.load(Ordering::SeqCst), 0);
}

#[test]
fn cache_miss_is_a_retryable_error() {
    let cache = MapCache::default();
    let err = engine(None).decide(&item(ChangeType::Added), &cache, at(START)).unwrap_err();
    assert!(matches!(err, ProcessError::NotFound(ref k) if k == "default/ev"));
}

#[test]
fn replay_before_start_is_suppressed() {
    let old = cache_with(event("default", "Started", "Normal", START - 5, START + 1));
    assert_eq!(suppressed(engine(None).decide(&item(ChangeType::Added), &old, at(START + 2)).unwrap()), Some(Suppressed::Replay));

    let fresh = cache_with(event("default", "Started", "Normal", START + 5, START + 5));
    match engine(None).decide(&item(ChangeType::Added), &fresh, at(START + 6)).unwrap() {
        Decision::Deliver { action, event } => {
            assert_eq!(action, Action::Created);
            assert!(event.is_some());
        }
        other => panic!("expected delivery, got {other:?}"),
    }
}

#[test]
fn missing_creation_time_counts_as_replay() {
    let mut ev = event("default", "Started", "Normal", START + 1, START + 1);
    ev.metadata.creation_timestamp = None;
    let d = engine(None).decide(&item(ChangeType::Added), &cache_with(ev), at(START + 2)).unwrap();
    assert_eq!(suppressed(d), Some(Suppressed::Replay));
}

#[test]
fn modified_staleness_boundary() {
    let cache = cache_with(event("default", "BackOff", "Warning", START + 1, START + 100));
    let e = engine(None);
    for (age, stale) in [(59, false), (60, false), (61, true)] {
        let d = e.decide(&item(ChangeType::Modified), &cache, at(START + 100 + age)).unwrap();
        assert_eq!(suppressed(d) == Some(Suppressed::Stale), stale, "age {age}");
    }
}

#[test]
fn staleness_only_applies_to_modified() {
    let cache = cache_with(event("default", "BackOff", "Warning", START + 1, START + 1));
    let d = engine(None).decide(&item(ChangeType::Added), &cache, at(START + 3600)).unwrap();
    assert_eq!(suppressed(d), None);
}

#[test]
fn scope_staleness_override() {
    let cache = cache_with(event("default", "BackOff", "Warning", START + 1, START + 100));
    let e = DecisionEngine::new(DecisionPolicy { staleness: std::time::Duration::from_secs(300) }, None, at(START));
    assert_eq!(suppressed(e.decide(&item(ChangeType::Modified), &cache, at(START + 400)).unwrap()), None);
    assert_eq!(suppressed(e.decide(&item(ChangeType::Modified), &cache, at(START + 401)).unwrap()), Some(Suppressed::Stale));
}

#[test]
fn deleted_bypasses_cache_and_filters() {
    let cache = MapCache::default();
    let keep_nothing = ExtraFilter::compile(&ExtraFilterConfig {
        mode: FilterMode::Keep,
        filters: [FilterRule { key: "reason".into(), value: "never".into(), condition: Conjunction::Or }].into_iter().collect(),
    })
    .unwrap();
    match engine(Some(keep_nothing)).decide(&item(ChangeType::Deleted), &cache, at(START)).unwrap() {
        Decision::Deliver { action, event } => {
            assert_eq!(action, Action::Deleted);
            assert!(event.is_none());
        }
        other => panic!("expected delivery, got {other:?}"),
    }
    assert_eq!(cache.lookups.load(Ordering::SeqCst), 0);
}

#[test]
fn keep_filter_on_reason() {
    let f = ExtraFilter::compile(&ExtraFilterConfig {
        mode: FilterMode::Keep,
        filters: [FilterRule { key: "reason".into(), value: "OOM".into(), condition: Conjunction::Or }].into_iter().collect(),
    })
    .unwrap();
    let e = engine(Some(f));
    let oom = cache_with(event("default", "OOMKilled", "Warning", START + 1, START + 1));
    let sched = cache_with(event("default", "Scheduled", "Normal", START + 1, START + 1));
    assert_eq!(suppressed(e.decide(&item(ChangeType::Added), &oom, at(START + 2)).unwrap()), None);
    assert_eq!(suppressed(e.decide(&item(ChangeType::Added), &sched, at(START + 2)).unwrap()), Some(Suppressed::Filtered));
}

#[test]
fn drop_filter_needs_whole_and_group() {
    let f = ExtraFilter::compile(&ExtraFilterConfig {
        mode: FilterMode::Drop,
        filters: [
            FilterRule { key: "objectMeta.namespace".into(), value: "kube-system".into(), condition: Conjunction::And },
            FilterRule { key: "type".into(), value: "Normal".into(), condition: Conjunction::And },
        ]
        .into_iter()
        .collect(),
    })
    .unwrap();
    let e = engine(Some(f));
    let both = event("kube-system", "Pulled", "Normal", START + 1, START + 1);
    let one = event("default", "Pulled", "Normal", START + 1, START + 1);
    let mut both_cache = MapCache::default();
    both_cache.objects.insert("default/ev".into(), Arc::new(both));
    assert_eq!(suppressed(e.decide(&item(ChangeType::Added), &both_cache, at(START + 2)).unwrap()), Some(Suppressed::Filtered));
    assert_eq!(suppressed(e.decide(&item(ChangeType::Added), &cache_with(one), at(START + 2)).unwrap()), None);
}
