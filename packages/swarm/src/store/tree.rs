//! Local mirror of a store subtree, updated by `put`/`patch` events.
//!
//! Nulls and empty objects are never kept: deleting the last child of an
//! object deletes the object, matching how the store reports absence.

use serde_json::{Map, Value};

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Value at `path`, if present.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path)
        .into_iter()
        .try_fold(root, |node, segment| node.get(segment))
}

/// Replace the value at `path` with `data`.
pub fn put(root: &mut Value, path: &str, data: Value) {
    let segments = segments(path);
    let Some((last, parents)) = segments.split_last() else {
        *root = normalize(data);
        return;
    };

    let mut node = &mut *root;
    for segment in parents {
        node = child_object(node).entry(segment.to_string()).or_insert(Value::Null);
    }
    let data = normalize(data);
    let object = child_object(node);
    if data.is_null() {
        object.remove(*last);
    } else {
        object.insert(last.to_string(), data);
    }
    prune(root);
}

/// Merge the children of `data` (an object) into the value at `path`.
pub fn patch(root: &mut Value, path: &str, data: Value) {
    match data {
        Value::Object(children) => {
            let base = path.trim_end_matches('/');
            for (key, child) in children {
                put(root, &format!("{base}/{key}"), child);
            }
        }
        other => put(root, path, other),
    }
}

fn child_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn normalize(mut value: Value) -> Value {
    prune(&mut value);
    value
}

fn prune(value: &mut Value) {
    if let Value::Object(map) = value {
        for child in map.values_mut() {
            prune(child);
        }
        map.retain(|_, child| !child.is_null());
        if map.is_empty() {
            *value = Value::Null;
        }
    }
}
