//! Per-event gauge exported through the process metrics recorder.

use k8s_openapi::api::core::v1::Event;
use metrics::gauge;

pub const EVENT_GAUGE: &str = "ew_event_count";

/// Event count, falling back to the series count, else zero.
pub fn event_count(ev: &Event) -> f64 {
    ev.count.or_else(|| ev.series.as_ref().and_then(|s| s.count)).unwrap_or(0) as f64
}

/// Set `ew_event_count` for the event's label set.
pub fn record_event(ev: &Event) {
    let io = &ev.involved_object;
    let labels = [
        ("ref_namespace", ev.metadata.namespace.clone().unwrap_or_default()),
        ("ref_kind", io.kind.clone().unwrap_or_default()),
        ("ref_fieldpath", io.field_path.clone().unwrap_or_default()),
        ("ref_name", io.name.clone().unwrap_or_default()),
        ("reason", ev.reason.clone().unwrap_or_default()),
        ("message", ev.message.clone().unwrap_or_default()),
        ("type", ev.type_.clone().unwrap_or_default()),
    ];
    gauge!(EVENT_GAUGE, event_count(ev), &labels);
}
