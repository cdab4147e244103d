//! Dotted-path access into JSON values (`"settings.draft_options.replay"`).
//!
//! Objects are traversed by key. Arrays can be read by numeric index but
//! `set_path` only ever creates objects.

use serde_json::{Map, Value};

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Look up the value at `path`. An empty path returns `root`.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for key in segments(path) {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Whether a value (including `null`) exists at `path`.
pub fn has_path(root: &Value, path: &str) -> bool {
    get_path(root, path).is_some()
}

/// Set `value` at `path`, creating intermediate objects as needed.
///
/// Intermediates that exist but are not objects are replaced by objects.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let keys: Vec<&str> = segments(path).collect();
    let Some((last, parents)) = keys.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for key in parents {
        let map = ensure_object(current);
        current = map
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert((*last).to_string(), value);
}

/// Remove the value at `path`, returning it if it existed.
pub fn delete_path(root: &mut Value, path: &str) -> Option<Value> {
    let keys: Vec<&str> = segments(path).collect();
    let (last, parents) = keys.split_last()?;

    let mut current = root;
    for key in parents {
        current = current.as_object_mut()?.get_mut(*key)?;
    }
    current.as_object_mut()?.remove(*last)
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}
