//! Dotted-path lookup and `{{path}}` templates over JSON values

use serde_json::{Map, Value};

/// Split `a.b[0].c` into `["a", "b", "0", "c"]`
pub fn segments(path: &str) -> Vec<String> {
    path.replace('[', ".")
        .replace(']', "")
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolve a dotted path, returning `None` when any segment is missing
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments(path) {
        current = match current {
            Value::Object(map) => map.get(&segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve a dotted path, treating a missing value as `null`
pub fn lookup_or_null(root: &Value, path: &str) -> Value {
    lookup(root, path).cloned().unwrap_or(Value::Null)
}

/// Write `value` at a dotted path, creating intermediate objects
pub fn assign(root: &mut Value, path: &str, value: Value) {
    let parts = segments(path);
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else { return };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}

/// Render `{{path}}` placeholders against `scope`.
///
/// A template that is exactly one placeholder keeps the referenced value's
/// JSON type; otherwise placeholders are stringified and spliced in.
pub fn render(template: &str, scope: &Value) -> Value {
    let trimmed = template.trim();
    if trimmed.starts_with("{{")
        && trimmed.ends_with("}}")
        && trimmed.matches("{{").count() == 1
    {
        let path = trimmed[2..trimmed.len() - 2].trim();
        return lookup_or_null(scope, path);
    }
    Value::String(render_string(template, scope))
}

/// Render `{{path}}` placeholders to a string; missing values become empty
pub fn render_string(template: &str, scope: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                out.push_str(&display(&lookup_or_null(scope, path)));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render every string inside a JSON value
pub fn render_value(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) if s.contains("{{") => render(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Plain-text rendering used when splicing values into strings
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Top-level fields whose values differ between `record` and `previous`
pub fn changed_fields(record: &Value, previous: Option<&Value>) -> Vec<String> {
    let empty = Map::new();
    let current = record.as_object().unwrap_or(&empty);
    let before = previous.and_then(Value::as_object).unwrap_or(&empty);
    let mut fields: Vec<String> = current
        .iter()
        .filter(|(k, v)| before.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    for key in before.keys() {
        if !current.contains_key(key) {
            fields.push(key.clone());
        }
    }
    fields.sort();
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested_and_indexed() {
        let v = json!({"input": {"items": [{"sku": "a"}, {"sku": "b"}]}});
        assert_eq!(lookup(&v, "input.items[1].sku"), Some(&json!("b")));
        assert_eq!(lookup(&v, "input.items.0.sku"), Some(&json!("a")));
        assert_eq!(lookup(&v, "input.missing"), None);
        assert_eq!(lookup_or_null(&v, "input.items[9]"), Value::Null);
    }

    #[test]
    fn test_assign_creates_parents() {
        let mut v = json!({});
        assign(&mut v, "a.b.c", json!(1));
        assert_eq!(v, json!({"a": {"b": {"c": 1}}}));
        assign(&mut v, "a.b", json!("x"));
        assert_eq!(v, json!({"a": {"b": "x"}}));
    }

    #[test]
    fn test_render_single_placeholder_keeps_type() {
        let scope = json!({"input": {"amount": 42}});
        assert_eq!(render("{{ input.amount }}", &scope), json!(42));
        assert_eq!(render("total: {{input.amount}}", &scope), json!("total: 42"));
    }

    #[test]
    fn test_render_missing_and_unterminated() {
        let scope = json!({});
        assert_eq!(render_string("a{{x}}b", &scope), "ab");
        assert_eq!(render_string("a{{x", &scope), "a{{x");
    }

    #[test]
    fn test_render_value_recurses() {
        let scope = json!({"record": {"id": 7}});
        let rendered = render_value(&json!({"ids": ["{{record.id}}"], "n": 1}), &scope);
        assert_eq!(rendered, json!({"ids": [7], "n": 1}));
    }

    #[test]
    fn test_changed_fields() {
        let before = json!({"status": "open", "owner": "a", "gone": 1});
        let after = json!({"status": "closed", "owner": "a", "new": true});
        assert_eq!(
            changed_fields(&after, Some(&before)),
            vec!["gone".to_string(), "new".to_string(), "status".to_string()]
        );
        assert_eq!(changed_fields(&json!({"a": 1}), None), vec!["a".to_string()]);
    }

    proptest! {
        #[test]
        fn prop_assigned_value_is_found(keys in prop::collection::vec("[a-z]{1,6}", 1..5), n in any::<i64>()) {
            let path = keys.join(".");
            let mut root = json!({"other": true});
            assign(&mut root, &path, json!(n));
            prop_assert_eq!(lookup(&root, &path), Some(&json!(n)));
        }

        #[test]
        fn prop_render_without_placeholders_is_identity(text in "[a-zA-Z0-9 .,]{0,40}") {
            prop_assert_eq!(render_string(&text, &json!({})), text);
        }
    }
}
