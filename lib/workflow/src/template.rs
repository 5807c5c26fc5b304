//! `{{path}}` placeholder rendering for notification payloads and rule
//! actions.

use crate::condition::resolve_path;
use serde_json::Value as JsonValue;

/// Renders a template against a scope.
///
/// Strings that consist of a single placeholder are replaced by the resolved
/// value itself; placeholders embedded in longer strings are replaced by
/// the value's text. Unresolved paths render as `null` or an empty string.
#[must_use]
pub fn render(template: &JsonValue, scope: &JsonValue) -> JsonValue {
    match template {
        JsonValue::String(text) => render_string(text, scope),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|item| render(item, scope)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), render(value, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Renders placeholders inside a plain string.
#[must_use]
pub fn render_text(text: &str, scope: &JsonValue) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..open]);
        let path = rest[open + 2..open + 2 + close].trim();
        match resolve_path(scope, path) {
            Some(JsonValue::String(s)) => out.push_str(s),
            Some(JsonValue::Null) | None => {}
            Some(value) => out.push_str(&value.to_string()),
        }
        rest = &rest[open + 2 + close + 2..];
    }
    out.push_str(rest);
    out
}

fn render_string(text: &str, scope: &JsonValue) -> JsonValue {
    let trimmed = text.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|t| t.strip_suffix("}}"))
        .filter(|inner| !inner.contains("{{") && !inner.contains("}}"))
    {
        return resolve_path(scope, inner.trim())
            .cloned()
            .unwrap_or(JsonValue::Null);
    }
    JsonValue::String(render_text(text, scope))
}
