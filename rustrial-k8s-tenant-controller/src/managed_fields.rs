//! Projection of a live object onto the fields owned by one field manager.
//!
//! Server-side apply records, per manager, the set of owned fields as a
//! `FieldsV1` trie. Projecting the live object through that trie yields the
//! document the manager last applied (as far as the server kept it), which is
//! compared with the freshly computed desired document to skip no-op writes.

use kube::api::{ApiResource, DynamicObject};
use serde_json::{Map, Value};

use crate::{
    errors::ControllerError,
    store::{document_name, ObjectStore},
    MANAGER,
};

const APPLY: &'static str = "Apply";

/// Server-side apply `desired` unless the fields we own already match it.
///
/// Returns whether a write was issued.
pub(crate) async fn apply_if_changed<S: ObjectStore + ?Sized>(
    store: &S,
    ar: &ApiResource,
    mut desired: Value,
) -> Result<bool, ControllerError> {
    normalize(&mut desired);
    let (namespace, name) = document_name(&desired)?;
    let live = store.get(ar, namespace.as_deref(), name.as_str()).await?;
    if let Some(live) = &live {
        if extract(live, ar, MANAGER)? == desired {
            debug!(
                "{} {}/{} is up to date",
                ar.kind,
                namespace.as_deref().unwrap_or(""),
                name
            );
            return Ok(false);
        }
    }
    store.apply(ar, &desired).await?;
    info!(
        "applied {} {}/{}",
        ar.kind,
        namespace.as_deref().unwrap_or(""),
        name
    );
    Ok(true)
}

/// Extract the part of `obj` owned by `manager` through server-side apply.
///
/// The result always carries `apiVersion`, `kind`, `metadata.name` and, for
/// namespaced objects, `metadata.namespace`.
pub(crate) fn extract(
    obj: &DynamicObject,
    ar: &ApiResource,
    manager: &str,
) -> Result<Value, serde_json::Error> {
    let mut owned = Value::Object(Map::new());
    for entry in obj.metadata.managed_fields.iter().flatten() {
        let is_ours = entry.manager.as_deref() == Some(manager)
            && entry.operation.as_deref() == Some(APPLY)
            && entry.subresource.as_deref().map_or(true, |s| s.is_empty());
        if is_ours {
            if let Some(fields) = &entry.fields_v1 {
                union(&mut owned, &fields.0);
            }
        }
    }
    let live = serde_json::to_value(obj)?;
    let mut extracted = match project(&live, &owned) {
        Value::Object(map) if !is_leaf(&owned) => map,
        _ => Map::new(),
    };
    extracted.insert(
        "apiVersion".to_string(),
        Value::String(ar.api_version.clone()),
    );
    extracted.insert("kind".to_string(), Value::String(ar.kind.clone()));
    let metadata = extracted
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(metadata) = metadata {
        if let Some(name) = &obj.metadata.name {
            metadata.insert("name".to_string(), Value::String(name.clone()));
        }
        if let Some(namespace) = &obj.metadata.namespace {
            metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
        }
    }
    Ok(Value::Object(extracted))
}

/// Remove `null` values and empty objects, the API server never keeps either.
pub(crate) fn normalize(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                normalize(v);
            }
            map.retain(|_, v| match v {
                Value::Null => false,
                Value::Object(m) => !m.is_empty(),
                _ => true,
            });
        }
        Value::Array(items) => items.iter_mut().for_each(normalize),
        _ => (),
    }
}

fn union(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(t), Value::Object(s)) => {
            for (k, v) in s {
                match t.get_mut(k) {
                    Some(existing) => union(existing, v),
                    None => {
                        t.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        _ => (),
    }
}

/// An empty set (or anything but a set) owns the whole value.
fn is_leaf(fields: &Value) -> bool {
    fields.as_object().map_or(true, |m| m.keys().all(|k| k == "."))
}

fn project(value: &Value, fields: &Value) -> Value {
    if is_leaf(fields) {
        return value.clone();
    }
    let fields = match fields.as_object() {
        Some(fields) => fields,
        None => return value.clone(),
    };
    match value {
        Value::Object(map) => {
            let mut result = Map::new();
            for (k, sub) in fields {
                if let Some(name) = k.strip_prefix("f:") {
                    if let Some(v) = map.get(name) {
                        result.insert(name.to_string(), project(v, sub));
                    }
                }
            }
            Value::Object(result)
        }
        Value::Array(items) => {
            let mut result = Vec::new();
            for (idx, item) in items.iter().enumerate() {
                for (k, sub) in fields {
                    if selects(k, idx, item) {
                        result.push(project_item(k, item, sub));
                        break;
                    }
                }
            }
            Value::Array(result)
        }
        _ => value.clone(),
    }
}

/// Whether the list element selector `key` matches `item` at position `idx`.
fn selects(key: &str, idx: usize, item: &Value) -> bool {
    if let Some(k) = key.strip_prefix("k:") {
        match (serde_json::from_str::<Map<String, Value>>(k), item) {
            (Ok(k), Value::Object(item)) => k.iter().all(|(f, v)| item.get(f) == Some(v)),
            _ => false,
        }
    } else if let Some(v) = key.strip_prefix("v:") {
        serde_json::from_str::<Value>(v).map_or(false, |v| &v == item)
    } else if let Some(i) = key.strip_prefix("i:") {
        i.parse::<usize>().map_or(false, |i| i == idx)
    } else {
        false
    }
}

fn project_item(key: &str, item: &Value, fields: &Value) -> Value {
    let mut projected = project(item, fields);
    // Key fields identify the element and are always part of it.
    if let (Some(k), Value::Object(target)) = (key.strip_prefix("k:"), &mut projected) {
        if let Ok(k) = serde_json::from_str::<Map<String, Value>>(k) {
            for (f, v) in k {
                target.entry(f).or_insert(v);
            }
        }
    }
    projected
}
