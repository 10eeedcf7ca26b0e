use serde_json::{Map, Value};

/// Deep-merge `overlay` onto `base`, returning a new tree.
///
/// Objects present on both sides are merged key by key; any other value in
/// `overlay` (arrays and scalars included) replaces the base value outright.
/// Neither input is modified.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let next = match base_map.get(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Look up a dot-separated path (`tlsConfig.port`) in a JSON tree.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Return a copy of `value` with `path` set to `new_value`, creating
/// intermediate objects as needed.
pub fn set_path(value: &Value, path: &str, new_value: Value) -> Result<Value, String> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err("config key must not be empty".to_string());
    }
    if !value.is_object() {
        return Err("config root must be a JSON object".to_string());
    }
    let mut current = value;
    for segment in &segments[..segments.len() - 1] {
        match current.get(*segment) {
            Some(next @ Value::Object(_)) => current = next,
            Some(Value::Null) | None => break,
            Some(_) => return Err(format!("cannot set '{path}': '{segment}' is not an object")),
        }
    }
    Ok(replace_leaf(value, &segments, new_value))
}

// Unlike deep_merge, an object written at the leaf replaces the existing
// value instead of merging into it.
fn replace_leaf(value: &Value, segments: &[&str], leaf: Value) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return leaf;
    };
    let mut map = match value {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let child = map.get(*head).cloned().unwrap_or(Value::Null);
    map.insert((*head).to_string(), replace_leaf(&child, rest, leaf));
    Value::Object(map)
}
