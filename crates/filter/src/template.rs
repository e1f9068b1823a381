//! Minimal message templates.
//!
//! Text is copied verbatim except for `{{ expr }}` placeholders, where `expr`
//! is a field path (see [`crate::fields`]) or `action`, optionally followed by
//! filters: `| default "-"` substitutes for unset or empty values and `| json`
//! escapes the value for embedding inside a JSON string.
//!
//! `{{ if path }}..{{ else }}..{{ end }}` renders one branch depending on
//! whether the field is set and non-empty; the `else` branch is optional and
//! blocks nest.

use std::path::Path;

use k8s_openapi::api::core::v1::Event;
use kew_core::Action;
use tracing::{error, info};

use crate::fields::Field;

pub const DEFAULT_CHAT_TEMPLATE: &str = r#"namespace: {{ namespace }}
objectKind: {{ involvedObject.kind }} ({{ if involvedObject.fieldPath }}{{ involvedObject.fieldPath }}{{ else }}-{{ end }})
objectName: {{ involvedObject.name }}
reason: {{ reason }}
message: {{ message }}
count: {{ count }}"#;

pub const DEFAULT_RECORD_TEMPLATE: &str = r#"{
    "status":"{{ type | json }}",
    "action":"{{ action }}",
    "namespace":"{{ namespace | json }}",
    "objectKind":"{{ involvedObject.kind | json }}({{ involvedObject.fieldPath | default "-" | json }})",
    "objectName":"{{ involvedObject.name | json }}",
    "reason":"{{ reason | json }}",
    "message":"{{ message | json }}",
    "count":{{ count | default "0" }}
}"#;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed placeholder at byte {0}")]
    Unclosed(usize),
    #[error("unknown field {0:?}")]
    UnknownField(String),
    #[error("unknown filter {0:?}")]
    UnknownFilter(String),
    #[error("unexpected {{{{ {0} }}}} at byte {1}")]
    Unexpected(&'static str, usize),
    #[error("{{{{ if }}}} at byte {0} has no matching {{{{ end }}}}")]
    UnclosedIf(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Action,
    Field(Field),
}

impl Source {
    fn value(&self, ev: &Event, action: Action) -> String {
        match self {
            Source::Action => action.as_str().to_string(),
            Source::Field(f) => f.extract(ev).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    Default(String),
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder { source: Source, filters: Vec<Filter> },
    Cond { test: Source, then: Vec<Segment>, otherwise: Vec<Segment> },
}

/// One parsed `{{ .. }}` tag.
enum Tag<'a> {
    If(&'a str),
    Else,
    End,
    Expr(&'a str),
}

fn classify(expr: &str) -> Tag<'_> {
    let e = expr.trim();
    match e {
        "else" => Tag::Else,
        "end" => Tag::End,
        _ => match e.strip_prefix("if ") {
            Some(path) => Tag::If(path.trim()),
            None => Tag::Expr(e),
        },
    }
}

/// Open `if` block while parsing.
struct Frame {
    at: usize,
    test: Source,
    /// Segments preceding the block.
    outer: Vec<Segment>,
    /// Set once `else` is seen.
    then: Option<Vec<Segment>>,
}

impl Frame {
    fn close(self, last: Vec<Segment>) -> Vec<Segment> {
        let (then, otherwise) = match self.then {
            Some(then) => (then, last),
            None => (last, Vec::new()),
        };
        let mut outer = self.outer;
        outer.push(Segment::Cond { test: self.test, then, otherwise });
        outer
    }
}

#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(src: &str) -> Result<Self, TemplateError> {
        let mut stack: Vec<Frame> = Vec::new();
        let mut current: Vec<Segment> = Vec::new();
        let mut rest = src;
        let mut offset = 0usize;
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                current.push(Segment::Text(rest[..start].to_string()));
            }
            let at = offset + start;
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or(TemplateError::Unclosed(at))?;
            match classify(&after[..end]) {
                Tag::If(path) => {
                    stack.push(Frame { at, test: parse_source(path)?, outer: std::mem::take(&mut current), then: None });
                }
                Tag::Else => {
                    let frame = stack.last_mut().filter(|f| f.then.is_none()).ok_or(TemplateError::Unexpected("else", at))?;
                    frame.then = Some(std::mem::take(&mut current));
                }
                Tag::End => {
                    let frame = stack.pop().ok_or(TemplateError::Unexpected("end", at))?;
                    current = frame.close(std::mem::take(&mut current));
                }
                Tag::Expr(expr) => current.push(parse_placeholder(expr)?),
            }
            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if let Some(open) = stack.last() {
            return Err(TemplateError::UnclosedIf(open.at));
        }
        if !rest.is_empty() {
            current.push(Segment::Text(rest.to_string()));
        }
        Ok(Self { segments: current })
    }

    pub fn render(&self, ev: &Event, action: Action) -> String {
        let mut out = String::new();
        render_into(&mut out, &self.segments, ev, action);
        out
    }
}

fn render_into(out: &mut String, segments: &[Segment], ev: &Event, action: Action) {
    for seg in segments {
        match seg {
            Segment::Text(t) => out.push_str(t),
            Segment::Placeholder { source, filters } => {
                let mut value = source.value(ev, action);
                for f in filters {
                    value = match f {
                        Filter::Default(d) if value.is_empty() => d.clone(),
                        Filter::Default(_) => value,
                        Filter::Json => json_escape(&value),
                    };
                }
                out.push_str(&value);
            }
            Segment::Cond { test, then, otherwise } => {
                let branch = if test.value(ev, action).is_empty() { otherwise } else { then };
                render_into(out, branch, ev, action);
            }
        }
    }
}

fn parse_source(head: &str) -> Result<Source, TemplateError> {
    if head.eq_ignore_ascii_case("action") {
        return Ok(Source::Action);
    }
    Field::lookup(head).map(Source::Field).ok_or_else(|| TemplateError::UnknownField(head.to_string()))
}

fn parse_placeholder(expr: &str) -> Result<Segment, TemplateError> {
    let mut parts = expr.split('|').map(str::trim);
    let source = parse_source(parts.next().unwrap_or_default())?;
    let mut filters = Vec::new();
    for p in parts {
        if p == "json" {
            filters.push(Filter::Json);
        } else if let Some(arg) = p.strip_prefix("default") {
            let arg = arg.trim();
            let unquoted = arg
                .strip_prefix('"')
                .and_then(|a| a.strip_suffix('"'))
                .ok_or_else(|| TemplateError::UnknownFilter(p.to_string()))?;
            filters.push(Filter::Default(unquoted.to_string()));
        } else {
            return Err(TemplateError::UnknownFilter(p.to_string()));
        }
    }
    Ok(Segment::Placeholder { source, filters })
}

fn json_escape(s: &str) -> String {
    let quoted = serde_json::Value::String(s.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Load a template from `file`, falling back to `default_src` when the file is
/// absent or does not parse.
pub fn load_template(file: Option<&Path>, default_src: &str) -> Result<Template, TemplateError> {
    if let Some(path) = file {
        info!(path = %path.display(), "loading template file");
        match std::fs::read_to_string(path) {
            Ok(text) => match Template::parse(&text) {
                Ok(t) => return Ok(t),
                Err(e) => error!(path = %path.display(), error = %e, "template invalid; using default"),
            },
            Err(e) => error!(path = %path.display(), error = %e, "template unreadable; using default"),
        }
    }
    Template::parse(default_src)
}
