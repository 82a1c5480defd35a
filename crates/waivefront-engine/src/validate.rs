//! Config validation (friendly errors)
//!
//! Purpose:
//! - Catch common misconfigurations early
//! - Explain *what* is wrong, *where* it lives, and *what to do*
//! - Keep the engine running where possible (lenient mode skips bad entries)

use std::collections::{BTreeMap, BTreeSet};

use crate::registry::{QualifiedTag, Value, ValueKind};
use crate::shader::UniformBindings;
use crate::{loge, logw};

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub level: IssueLevel,
    pub path: String,
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueLevel {
    Warn,
    Error,
}

impl ValidationIssue {
    pub fn warn(path: impl Into<String>, message: impl Into<String>, hint: Option<String>) -> Self {
        Self { level: IssueLevel::Warn, path: path.into(), message: message.into(), hint }
    }
    pub fn error(path: impl Into<String>, message: impl Into<String>, hint: Option<String>) -> Self {
        Self { level: IssueLevel::Error, path: path.into(), message: message.into(), hint }
    }
}

pub fn emit_issues(tag: &str, issues: &[ValidationIssue]) {
    for it in issues {
        let hint = it.hint.as_deref().map(|h| format!(" (hint: {h})")).unwrap_or_default();
        match it.level {
            IssueLevel::Warn => logw!(tag, "{}: {}{}", it.path, it.message, hint),
            IssueLevel::Error => loge!(tag, "{}: {}{}", it.path, it.message, hint),
        }
    }
}

/// One summary line even when there are zero issues, so logs show that validation ran.
pub fn emit_summary(tag: &str, label: &str, issues: &[ValidationIssue]) {
    let warns = issues.iter().filter(|i| i.level == IssueLevel::Warn).count();
    let errs = issues.iter().filter(|i| i.level == IssueLevel::Error).count();
    if errs == 0 && warns == 0 {
        crate::logi!(tag, "validation: {label} OK (0 issues)");
    } else {
        crate::logw!(tag, "validation: {label} issues found (errors={errs} warnings={warns})");
    }
}

const TYPE_HINT: &str = "supported types: float, int, string, bool";

/// Validate params.json declarations:
/// - categories have names and are not declared twice
/// - tags have a category, a name and a known type
/// - no tag is declared twice
/// - defaults match the declared type
/// - tags live in declared categories (otherwise the category is created implicitly)
pub fn validate_params_json(params: &serde_json::Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let mut categories = BTreeSet::new();
    match params.get("categories") {
        None => {}
        Some(serde_json::Value::Array(arr)) => {
            for (i, c) in arr.iter().enumerate() {
                let base = format!("params.json:/categories/{i}");
                match c.get("name").and_then(|v| v.as_str()) {
                    Some(n) if !n.is_empty() && !n.contains('/') => {
                        if !categories.insert(n.to_string()) {
                            issues.push(ValidationIssue::warn(
                                base,
                                format!("category '{n}' declared twice"),
                                Some("the first declaration wins".into()),
                            ));
                        }
                    }
                    _ => issues.push(ValidationIssue::error(
                        format!("{base}/name"),
                        "missing or invalid category name",
                        Some("a non-empty string without '/'".into()),
                    )),
                }
            }
        }
        Some(_) => issues.push(ValidationIssue::error(
            "params.json:/categories",
            "'categories' must be an array",
            Some("expected: [ { \"name\": \"synth\", \"order\": 0 }, ... ]".into()),
        )),
    }

    let tags = match params.get("tags") {
        None => {
            issues.push(ValidationIssue::warn(
                "params.json:/tags",
                "no tags declared",
                Some("OSC can still declare tags on first use when osc.auto_declare is true".into()),
            ));
            return issues;
        }
        Some(serde_json::Value::Array(arr)) => arr,
        Some(_) => {
            issues.push(ValidationIssue::error(
                "params.json:/tags",
                "'tags' must be an array",
                Some("expected: [ { \"category\": \"synth\", \"name\": \"level\", \"type\": \"float\" }, ... ]".into()),
            ));
            return issues;
        }
    };

    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for (i, t) in tags.iter().enumerate() {
        let base = format!("params.json:/tags/{i}");
        let cat = t.get("category").and_then(|v| v.as_str()).unwrap_or("");
        let name = t.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let qualified = match QualifiedTag::new(cat, name) {
            Ok(q) => q,
            Err(e) => {
                issues.push(ValidationIssue::error(
                    base,
                    format!("invalid tag identity: {e}"),
                    Some("each tag needs a string 'category' and 'name'".into()),
                ));
                continue;
            }
        };

        if let Some(first) = seen.insert(qualified.to_string(), i) {
            issues.push(ValidationIssue::error(
                base.clone(),
                format!("tag '{qualified}' already declared at /tags/{first}"),
                Some("tag names must be unique within a category".into()),
            ));
        }

        if !categories.is_empty() && !categories.contains(qualified.category()) {
            issues.push(ValidationIssue::warn(
                format!("{base}/category"),
                format!("category '{}' is not declared under /categories", qualified.category()),
                Some("it will be created with default ordering".into()),
            ));
        }

        let kind = match t.get("type").and_then(|v| v.as_str()) {
            Some(s) => match ValueKind::parse(s) {
                Some(k) => Some(k),
                None => {
                    issues.push(ValidationIssue::error(
                        format!("{base}/type"),
                        format!("unknown type '{s}'"),
                        Some(TYPE_HINT.into()),
                    ));
                    None
                }
            },
            None => {
                issues.push(ValidationIssue::error(
                    format!("{base}/type"),
                    "missing or non-string 'type'",
                    Some(TYPE_HINT.into()),
                ));
                None
            }
        };

        if let (Some(kind), Some(default)) = (kind, t.get("default")) {
            if Value::from_json(kind, default).is_none() {
                issues.push(ValidationIssue::error(
                    format!("{base}/default"),
                    format!("default {default} is not a {kind}"),
                    None,
                ));
            }
        }

        if let Some(s) = t.get("smoothing").and_then(|v| v.as_f64()) {
            if !(0.0..=1.0).contains(&s) {
                issues.push(ValidationIssue::warn(
                    format!("{base}/smoothing"),
                    format!("smoothing {s} outside 0..1"),
                    Some("it will be clamped".into()),
                ));
            }
        }
    }

    if let Some(bind) = params.pointer("/osc/bind").and_then(|v| v.as_str()) {
        if bind.parse::<std::net::SocketAddr>().is_err() && !bind.contains(':') {
            issues.push(ValidationIssue::warn(
                "params.json:/osc/bind",
                format!("'{bind}' does not look like host:port"),
                Some("e.g. \"0.0.0.0:9000\"".into()),
            ));
        }
    }

    issues
}

/// Explicit render.json bindings should point at tags params.json declares.
pub fn validate_bindings(
    bindings: &UniformBindings,
    params: &serde_json::Value,
    auto_declare: bool,
) -> Vec<ValidationIssue> {
    let declared: BTreeSet<String> = params
        .get("tags")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|t| {
            let cat = t.get("category")?.as_str()?;
            let name = t.get("name")?.as_str()?;
            QualifiedTag::new(cat, name).ok().map(|q| q.to_string())
        })
        .collect();

    let mut issues = Vec::new();
    for (uniform, tag) in &bindings.explicit {
        let path = format!("render.json:/bindings/{}", escape_ptr(uniform));
        match QualifiedTag::parse(tag) {
            Err(e) => issues.push(ValidationIssue::error(path, format!("invalid tag '{tag}': {e}"), None)),
            Ok(q) if !declared.contains(q.as_str()) => {
                let hint = if auto_declare {
                    "it stays unbound until a source declares it (e.g. the first OSC message)"
                } else {
                    "declare it under params.json:/tags"
                };
                issues.push(ValidationIssue::warn(
                    path,
                    format!("uniform '{uniform}' is bound to undeclared tag '{q}'"),
                    Some(hint.into()),
                ));
            }
            Ok(_) => {}
        }
    }
    issues
}

// JSON Pointer escaping for friendly paths
fn escape_ptr(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn errors(issues: &[ValidationIssue]) -> Vec<&str> {
        issues
            .iter()
            .filter(|i| i.level == IssueLevel::Error)
            .map(|i| i.path.as_str())
            .collect()
    }

    #[test]
    fn clean_params_have_no_issues() {
        let p = json!({
            "categories": [ { "name": "synth" } ],
            "tags": [ { "category": "synth", "name": "level", "type": "float", "default": 0.5 } ],
            "osc": { "bind": "0.0.0.0:9000" }
        });
        assert!(validate_params_json(&p).is_empty());
    }

    #[test]
    fn reports_duplicates_types_and_defaults() {
        let p = json!({
            "categories": [ { "name": "synth" } ],
            "tags": [
                { "category": "synth", "name": "level", "type": "float" },
                { "category": "synth", "name": "level", "type": "float" },
                { "category": "synth", "name": "shape", "type": "vec9" },
                { "category": "synth", "name": "on", "type": "bool", "default": "yes" },
                { "category": "fx", "name": "mix", "type": "float" }
            ]
        });
        let issues = validate_params_json(&p);
        assert_eq!(
            errors(&issues),
            vec!["params.json:/tags/1", "params.json:/tags/2/type", "params.json:/tags/3/default"]
        );
        assert!(issues
            .iter()
            .any(|i| i.level == IssueLevel::Warn && i.path == "params.json:/tags/4/category"));
    }

    #[test]
    fn bindings_to_undeclared_tags_warn() {
        let mut b = UniformBindings::default();
        b.explicit.insert("glow".into(), "fx/glow".into());
        b.explicit.insert("level".into(), "synth/level".into());
        let p = json!({ "tags": [ { "category": "synth", "name": "level", "type": "float" } ] });
        let issues = validate_bindings(&b, &p, true);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "render.json:/bindings/glow");
        assert_eq!(issues[0].level, IssueLevel::Warn);
    }
}
