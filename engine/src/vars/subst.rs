//! `$name` / `${name}` reference scanning and substitution.
//!
//! A string that is exactly one reference is replaced structurally (the bound
//! value keeps its JSON type); a reference embedded in longer text is
//! interpolated, rendering non-string values as JSON.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static VAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("reference pattern compiles")
});

/// Result of one substitution pass.
#[derive(Debug, Default, PartialEq)]
pub struct Substitution {
    /// References that had no bound value; their tokens were left in place.
    pub unresolved: Vec<String>,
}

fn capture_name<'t>(caps: &regex::Captures<'t>) -> &'t str {
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("")
}

/// All reference names in `text`, in first-appearance order, deduplicated.
pub fn scan_refs(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for caps in VAR_RE.captures_iter(text) {
        let name = capture_name(&caps);
        if seen.insert(name.to_string()) {
            out.push(name.to_string());
        }
    }
    out
}

/// Renders a bound value for textual interpolation: strings verbatim,
/// everything else as JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Returns `Some(name)` when the whole string is exactly one reference.
fn whole_ref(text: &str) -> Option<String> {
    let caps = VAR_RE.captures(text)?;
    let m = caps.get(0)?;
    (m.start() == 0 && m.end() == text.len()).then(|| capture_name(&caps).to_string())
}

/// Interpolates references inside `text` via `lookup`. Unresolved tokens are
/// kept verbatim and reported.
pub fn substitute_text(
    text: &str,
    lookup: &dyn Fn(&str) -> Option<Value>,
    sub: &mut Substitution,
) -> String {
    VAR_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = capture_name(caps);
            match lookup(name) {
                Some(v) => render_value(&v),
                None => {
                    if !sub.unresolved.iter().any(|u| u == name) {
                        sub.unresolved.push(name.to_string());
                    }
                    caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default()
                }
            }
        })
        .into_owned()
}

/// Substitutes references across a parameter tree. Whole-token strings keep
/// the bound value's type; embedded references interpolate textually.
pub fn substitute_params(
    params: &Value,
    lookup: &dyn Fn(&str) -> Option<Value>,
) -> (Value, Substitution) {
    let mut sub = Substitution::default();
    let out = walk(params, lookup, &mut sub);
    (out, sub)
}

fn walk(v: &Value, lookup: &dyn Fn(&str) -> Option<Value>, sub: &mut Substitution) -> Value {
    match v {
        Value::String(s) => {
            if let Some(name) = whole_ref(s) {
                let name = name.as_str();
                match lookup(name) {
                    Some(bound) => bound,
                    None => {
                        if !sub.unresolved.iter().any(|u| u == name) {
                            sub.unresolved.push(name.to_string());
                        }
                        v.clone()
                    }
                }
            } else if VAR_RE.is_match(s) {
                Value::String(substitute_text(s, lookup, sub))
            } else {
                v.clone()
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|i| walk(i, lookup, sub)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, val)| (k.clone(), walk(val, lookup, sub)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// All reference names appearing anywhere in a parameter tree.
pub fn param_refs(params: &Value) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    collect_refs(params, &mut seen, &mut out);
    out
}

fn collect_refs(v: &Value, seen: &mut BTreeSet<String>, out: &mut Vec<String>) {
    match v {
        Value::String(s) => {
            for name in scan_refs(s) {
                if seen.insert(name.clone()) {
                    out.push(name);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|i| collect_refs(i, seen, out)),
        Value::Object(map) => map.values().for_each(|i| collect_refs(i, seen, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup_of(map: serde_json::Map<String, Value>) -> impl Fn(&str) -> Option<Value> {
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn scan_finds_both_forms_once() {
        let refs = scan_refs("use $x and ${y} then $x again");
        assert_eq!(refs, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn whole_token_string_keeps_value_type() {
        let map = json!({"x": {"n": 3}}).as_object().cloned().unwrap_or_default();
        let (out, sub) = substitute_params(&json!({"a": "$x"}), &lookup_of(map));
        assert_eq!(out, json!({"a": {"n": 3}}));
        assert!(sub.unresolved.is_empty());
    }

    #[test]
    fn embedded_reference_interpolates_as_json() {
        let map = json!({"x": {"n": 3}, "s": "str"})
            .as_object()
            .cloned()
            .unwrap_or_default();
        let (out, _) = substitute_params(&json!({"a": "v=$x w=$s"}), &lookup_of(map));
        assert_eq!(out, json!({"a": "v={\"n\":3} w=str"}));
    }

    #[test]
    fn unresolved_reference_is_kept_and_reported() {
        let map = serde_json::Map::new();
        let (out, sub) = substitute_params(&json!({"a": "$missing", "b": "x${gone}y"}), &lookup_of(map));
        assert_eq!(out, json!({"a": "$missing", "b": "x${gone}y"}));
        assert_eq!(sub.unresolved, vec!["missing".to_string(), "gone".to_string()]);
    }

    #[test]
    fn nested_arrays_and_objects_are_traversed() {
        let map = json!({"x": 1}).as_object().cloned().unwrap_or_default();
        let (out, _) = substitute_params(&json!({"list": ["$x", {"deep": "$x"}]}), &lookup_of(map));
        assert_eq!(out, json!({"list": [1, {"deep": 1}]}));
    }

    #[test]
    fn param_refs_collects_across_tree() {
        let refs = param_refs(&json!({"a": "$x", "b": ["${y}"], "c": {"d": "no refs"}}));
        assert_eq!(refs, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn substitute_text_renders_non_strings_as_json() {
        let mut sub = Substitution::default();
        let out = substitute_text(
            "n=$n done",
            &|name| (name == "n").then(|| json!([1, 2])),
            &mut sub,
        );
        assert_eq!(out, "n=[1,2] done");
    }

    #[test]
    fn dollar_without_name_is_untouched() {
        let refs = scan_refs("cost $5 and $ alone");
        assert!(refs.is_empty());
    }
}
