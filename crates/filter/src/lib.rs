//! kew filter engine: compiled keep/drop rules over event fields, plus the
//! message templates that share the same field accessors.

#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::Event;
use kew_core::{Conjunction, ExtraFilterConfig, FilterMode};
use regex::Regex;
use tracing::trace;

pub mod fields;
pub mod template;

pub use fields::Field;
pub use template::{load_template, Template, TemplateError, DEFAULT_CHAT_TEMPLATE, DEFAULT_RECORD_TEMPLATE};

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unknown field path {0:?}")]
    UnknownField(String),
    #[error("invalid regex {pattern:?}: {source}")]
    Regex { pattern: String, source: regex::Error },
}

/// Outcome of evaluating a filter against one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Suppress,
}

#[derive(Debug, Clone)]
enum Pattern {
    Contains(String),
    Regex(Regex),
}

impl Pattern {
    /// `/.../` selects a regex; anything else is a substring match.
    fn parse(raw: &str) -> Result<Self, FilterError> {
        if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
            let inner = &raw[1..raw.len() - 1];
            let re = Regex::new(inner).map_err(|source| FilterError::Regex { pattern: raw.to_string(), source })?;
            Ok(Pattern::Regex(re))
        } else {
            Ok(Pattern::Contains(raw.to_string()))
        }
    }

    fn matches(&self, target: &str) -> bool {
        match self {
            Pattern::Contains(s) => target.contains(s.as_str()),
            Pattern::Regex(re) => re.is_match(target),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    field: Field,
    pattern: Pattern,
    conjunction: Conjunction,
}

/// A validated extra filter, ready to evaluate.
#[derive(Debug, Clone)]
pub struct ExtraFilter {
    mode: FilterMode,
    rules: Vec<Rule>,
    and_total: usize,
}

impl ExtraFilter {
    pub fn compile(cfg: &ExtraFilterConfig) -> Result<Self, FilterError> {
        let mut rules = Vec::with_capacity(cfg.filters.len());
        for r in cfg.filters.iter() {
            let field = Field::lookup(&r.key).ok_or_else(|| FilterError::UnknownField(r.key.clone()))?;
            rules.push(Rule { field, pattern: Pattern::parse(&r.value)?, conjunction: r.condition });
        }
        let and_total = rules.iter().filter(|r| r.conjunction == Conjunction::And).count();
        Ok(Self { mode: cfg.mode, rules, and_total })
    }

    pub fn is_empty(&self) -> bool { self.rules.is_empty() }

    /// Evaluate the rules in order.
    ///
    /// An `or` match is decisive on its own; `and` matches only count once all
    /// `and` rules have matched. A decisive match delivers under `keep` and
    /// suppresses under `drop`; with no decisive match the opposite holds.
    pub fn evaluate(&self, ev: &Event) -> Verdict {
        if self.rules.is_empty() {
            return Verdict::Deliver;
        }
        let (on_match, on_miss) = match self.mode {
            FilterMode::Keep => (Verdict::Deliver, Verdict::Suppress),
            FilterMode::Drop => (Verdict::Suppress, Verdict::Deliver),
        };
        let mut and_matched = 0usize;
        for rule in &self.rules {
            let Some(value) = rule.field.filter_value(ev) else { continue };
            if !rule.pattern.matches(&value) {
                continue;
            }
            trace!(field = ?rule.field, value = %value, "filter rule matched");
            match rule.conjunction {
                Conjunction::Or => return on_match,
                Conjunction::And => {
                    and_matched += 1;
                    if and_matched == self.and_total {
                        return on_match;
                    }
                }
            }
        }
        on_miss
    }
}

/// Compile an optional filter config; `None` means no filtering.
pub fn compile_optional(cfg: Option<&ExtraFilterConfig>) -> Result<Option<ExtraFilter>, FilterError> {
    cfg.map(ExtraFilter::compile).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kew_core::FilterRule;
    use smallvec::smallvec;

    fn ev(ns: &str, reason: &str, ty: &str) -> Event {
        Event {
            metadata: ObjectMeta { namespace: Some(ns.into()), name: Some("e1".into()), ..Default::default() },
            involved_object: ObjectReference { kind: Some("Pod".into()), ..Default::default() },
            reason: Some(reason.into()),
            type_: Some(ty.into()),
            ..Default::default()
        }
    }

    fn rule(key: &str, value: &str, condition: Conjunction) -> FilterRule {
        FilterRule { key: key.into(), value: value.into(), condition }
    }

    fn filter(mode: FilterMode, filters: Vec<FilterRule>) -> ExtraFilter {
        ExtraFilter::compile(&ExtraFilterConfig { mode, filters: filters.into_iter().collect() }).unwrap()
    }

    #[test]
    fn keep_single_or_rule() {
        let f = filter(FilterMode::Keep, vec![rule("reason", "OOM", Conjunction::Or)]);
        assert_eq!(f.evaluate(&ev("default", "OOMKilled", "Warning")), Verdict::Deliver);
        assert_eq!(f.evaluate(&ev("default", "Scheduled", "Normal")), Verdict::Suppress);
    }

    #[test]
    fn drop_requires_every_and_rule() {
        let f = filter(
            FilterMode::Drop,
            vec![rule("namespace", "kube-system", Conjunction::And), rule("type", "Normal", Conjunction::And)],
        );
        assert_eq!(f.evaluate(&ev("kube-system", "Pulled", "Normal")), Verdict::Suppress);
        assert_eq!(f.evaluate(&ev("kube-system", "BackOff", "Warning")), Verdict::Deliver);
        assert_eq!(f.evaluate(&ev("default", "Pulled", "Normal")), Verdict::Deliver);
    }

    #[test]
    fn or_rule_short_circuits_pending_and_group() {
        let f = filter(
            FilterMode::Drop,
            vec![
                rule("namespace", "kube-system", Conjunction::And),
                rule("type", "Normal", Conjunction::And),
                rule("reason", "Pulled", Conjunction::Or),
            ],
        );
        assert_eq!(f.evaluate(&ev("default", "Pulled", "Warning")), Verdict::Suppress);
        assert_eq!(f.evaluate(&ev("default", "Killing", "Warning")), Verdict::Deliver);
    }

    #[test]
    fn regex_patterns_and_nested_paths() {
        let f = filter(FilterMode::Keep, vec![rule("InvolvedObject.Kind", "/^(Pod|Node)$/", Conjunction::Or)]);
        assert_eq!(f.evaluate(&ev("default", "x", "Normal")), Verdict::Deliver);
        let f = filter(FilterMode::Keep, vec![rule("involvedObject.kind", "/^Node$/", Conjunction::Or)]);
        assert_eq!(f.evaluate(&ev("default", "x", "Normal")), Verdict::Suppress);
    }

    #[test]
    fn empty_rules_never_filter() {
        let keep = filter(FilterMode::Keep, vec![]);
        let drop = filter(FilterMode::Drop, vec![]);
        let e = ev("default", "Scheduled", "Normal");
        assert_eq!(keep.evaluate(&e), Verdict::Deliver);
        assert_eq!(drop.evaluate(&e), Verdict::Deliver);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let f = filter(FilterMode::Keep, vec![rule("reason", "/Back.ff/", Conjunction::Or)]);
        let e = ev("default", "BackOff", "Warning");
        let first = f.evaluate(&e);
        assert_eq!(first, f.evaluate(&e));
        assert_eq!(first, Verdict::Deliver);
    }

    #[test]
    fn unset_string_fields_read_as_empty() {
        let e = ev("default", "x", "Normal");
        let keep = filter(FilterMode::Keep, vec![rule("involvedObject.fieldPath", "/^$/", Conjunction::Or)]);
        assert_eq!(keep.evaluate(&e), Verdict::Deliver);
        let drop = filter(FilterMode::Drop, vec![rule("involvedObject.fieldPath", "", Conjunction::Or)]);
        assert_eq!(drop.evaluate(&e), Verdict::Suppress);
        let count = filter(FilterMode::Keep, vec![rule("count", "", Conjunction::Or)]);
        assert_eq!(count.evaluate(&e), Verdict::Suppress);
    }

    #[test]
    fn compile_rejects_bad_config() {
        let bad_field = ExtraFilterConfig { mode: FilterMode::Keep, filters: smallvec![rule("spec.foo", "x", Conjunction::Or)] };
        assert!(matches!(ExtraFilter::compile(&bad_field), Err(FilterError::UnknownField(_))));
        let bad_re = ExtraFilterConfig { mode: FilterMode::Keep, filters: smallvec![rule("reason", "/(/", Conjunction::Or)] };
        assert!(matches!(ExtraFilter::compile(&bad_re), Err(FilterError::Regex { .. })));
        assert!(compile_optional(None).unwrap().is_none());
    }
}
