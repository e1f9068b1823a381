//! Field accessor table for Kubernetes events.
//!
//! Filter rules and template placeholders name event fields with dotted paths.
//! Each accepted spelling maps to one [`Field`], and each `Field` knows how to
//! pull its value out of an [`Event`]. Lookup is case-insensitive so both
//! `involvedObject.kind` and `InvolvedObject.Kind` resolve.

use chrono::SecondsFormat;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Namespace,
    Name,
    Uid,
    Reason,
    Message,
    Type,
    Count,
    InvolvedKind,
    InvolvedName,
    InvolvedNamespace,
    InvolvedFieldPath,
    InvolvedApiVersion,
    InvolvedUid,
    SourceComponent,
    SourceHost,
    ReportingComponent,
    ReportingInstance,
    FirstTimestamp,
    LastTimestamp,
    CreationTimestamp,
}

/// Accepted spellings, lowercased.
const TABLE: &[(&str, Field)] = &[
    ("namespace", Field::Namespace),
    ("metadata.namespace", Field::Namespace),
    ("objectmeta.namespace", Field::Namespace),
    ("name", Field::Name),
    ("metadata.name", Field::Name),
    ("objectmeta.name", Field::Name),
    ("uid", Field::Uid),
    ("metadata.uid", Field::Uid),
    ("reason", Field::Reason),
    ("message", Field::Message),
    ("type", Field::Type),
    ("count", Field::Count),
    ("involvedobject.kind", Field::InvolvedKind),
    ("involvedobject.name", Field::InvolvedName),
    ("involvedobject.namespace", Field::InvolvedNamespace),
    ("involvedobject.fieldpath", Field::InvolvedFieldPath),
    ("involvedobject.apiversion", Field::InvolvedApiVersion),
    ("involvedobject.uid", Field::InvolvedUid),
    ("source.component", Field::SourceComponent),
    ("source.host", Field::SourceHost),
    ("reportingcomponent", Field::ReportingComponent),
    ("reportingcontroller", Field::ReportingComponent),
    ("reportinginstance", Field::ReportingInstance),
    ("firsttimestamp", Field::FirstTimestamp),
    ("lasttimestamp", Field::LastTimestamp),
    ("creationtimestamp", Field::CreationTimestamp),
    ("metadata.creationtimestamp", Field::CreationTimestamp),
];

impl Field {
    /// Resolve a dotted path; `None` when the path names no known field.
    pub fn lookup(path: &str) -> Option<Field> {
        let p = path.trim().trim_start_matches('.').to_ascii_lowercase();
        TABLE.iter().find(|(k, _)| *k == p).map(|(_, f)| *f)
    }

    /// Extract the field as text. Unset fields yield `None`.
    pub fn extract(&self, ev: &Event) -> Option<String> {
        let io = &ev.involved_object;
        match self {
            Field::Namespace => ev.metadata.namespace.clone(),
            Field::Name => ev.metadata.name.clone(),
            Field::Uid => ev.metadata.uid.clone(),
            Field::Reason => ev.reason.clone(),
            Field::Message => ev.message.clone(),
            Field::Type => ev.type_.clone(),
            Field::Count => ev.count.map(|c| c.to_string()),
            Field::InvolvedKind => io.kind.clone(),
            Field::InvolvedName => io.name.clone(),
            Field::InvolvedNamespace => io.namespace.clone(),
            Field::InvolvedFieldPath => io.field_path.clone(),
            Field::InvolvedApiVersion => io.api_version.clone(),
            Field::InvolvedUid => io.uid.clone(),
            Field::SourceComponent => ev.source.as_ref().and_then(|s| s.component.clone()),
            Field::SourceHost => ev.source.as_ref().and_then(|s| s.host.clone()),
            Field::ReportingComponent => ev.reporting_component.clone(),
            Field::ReportingInstance => ev.reporting_instance.clone(),
            Field::FirstTimestamp => ev.first_timestamp.as_ref().map(rfc3339),
            Field::LastTimestamp => ev.last_timestamp.as_ref().map(rfc3339),
            Field::CreationTimestamp => ev.metadata.creation_timestamp.as_ref().map(rfc3339),
        }
    }

    /// String-typed fields, as opposed to counters and timestamps.
    pub fn is_text(&self) -> bool {
        !matches!(self, Field::Count | Field::FirstTimestamp | Field::LastTimestamp | Field::CreationTimestamp)
    }

    /// Value seen by filter rules: an unset text field reads as `""`.
    pub fn filter_value(&self, ev: &Event) -> Option<String> {
        self.extract(ev).or_else(|| self.is_text().then(String::new))
    }
}

fn rfc3339(t: &Time) -> String { t.0.to_rfc3339_opts(SecondsFormat::Secs, true) }

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(Field::lookup("reason"), Some(Field::Reason));
        assert_eq!(Field::lookup("InvolvedObject.Kind"), Some(Field::InvolvedKind));
        assert_eq!(Field::lookup("ObjectMeta.Namespace"), Some(Field::Namespace));
        assert_eq!(Field::lookup(".metadata.name"), Some(Field::Name));
        assert_eq!(Field::lookup("spec.replicas"), None);
    }

    #[test]
    fn extracts_nested_and_optional() {
        let ev = Event {
            involved_object: ObjectReference { kind: Some("Pod".into()), field_path: None, ..Default::default() },
            count: Some(3),
            ..Default::default()
        };
        assert_eq!(Field::InvolvedKind.extract(&ev).as_deref(), Some("Pod"));
        assert_eq!(Field::InvolvedFieldPath.extract(&ev), None);
        assert_eq!(Field::Count.extract(&ev).as_deref(), Some("3"));
        assert_eq!(Field::SourceHost.extract(&ev), None);
    }

    #[test]
    fn filter_value_reads_unset_text_as_empty() {
        let ev = Event { count: None, ..Default::default() };
        assert_eq!(Field::InvolvedFieldPath.filter_value(&ev).as_deref(), Some(""));
        assert_eq!(Field::SourceHost.filter_value(&ev).as_deref(), Some(""));
        assert_eq!(Field::Count.filter_value(&ev), None);
        assert_eq!(Field::LastTimestamp.filter_value(&ev), None);
    }
}
