//! In-memory [`ObjectStore`] used by the reconciliation tests.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{FieldsV1, ManagedFieldsEntry, Time};
use kube::{
    api::{ApiResource, DynamicObject, Preconditions, TypeMeta},
    core::ErrorResponse,
};
use serde_json::{Map, Value};

use crate::{store::ObjectStore, MANAGER};

/// (namespace, name)
type Key = (String, String);

#[derive(Default)]
pub(crate) struct FakeStore {
    objects: Mutex<BTreeMap<(String, Key), DynamicObject>>,
    failures: Mutex<HashSet<(&'static str, String)>>,
    versions: AtomicU64,
    writes: AtomicU64,
}

fn error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

fn resource_key(ar: &ApiResource) -> String {
    format!("{}/{}", ar.api_version, ar.kind)
}

fn object_key(namespace: Option<&str>, name: &str) -> Key {
    (namespace.unwrap_or("").to_string(), name.to_string())
}

/// Match `k=v`, `k!=v` and `k` terms of a label selector.
fn matches(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k).map(|l| l.as_str()) != Some(v)
            } else if let Some((k, v)) = term.split_once('=') {
                labels.get(k).map(|l| l.as_str()) == Some(v)
            } else {
                labels.contains_key(term)
            }
        })
}

/// The `FieldsV1` set owning every leaf of `document`.
fn fields_of(document: &Value) -> Value {
    match document {
        Value::Object(map) => {
            let mut fields = Map::new();
            for (k, v) in map {
                let sub = match v {
                    Value::Object(m) if !m.is_empty() => fields_of(v),
                    _ => Value::Object(Map::new()),
                };
                fields.insert(format!("f:{}", k), sub);
            }
            Value::Object(fields)
        }
        _ => Value::Object(Map::new()),
    }
}

/// Remove from `live` the fields owned by `old` but no longer by `new`.
fn remove_released(live: &mut Value, old: &Value, new: &Value) {
    if let (Value::Object(live), Some(old)) = (live, old.as_object()) {
        for (k, old_sub) in old {
            let name = match k.strip_prefix("f:") {
                Some(name) => name,
                None => continue,
            };
            let is_leaf = old_sub.as_object().map_or(true, |m| m.is_empty());
            match new.get(k) {
                None if is_leaf => {
                    live.remove(name);
                }
                None => {
                    let empty = Value::Object(Map::new());
                    if let Some(child) = live.get_mut(name) {
                        remove_released(child, old_sub, &empty);
                        if child.as_object().map_or(false, |m| m.is_empty()) {
                            live.remove(name);
                        }
                    }
                }
                Some(new_sub) => {
                    if let Some(child) = live.get_mut(name) {
                        remove_released(child, old_sub, new_sub);
                    }
                }
            }
        }
    }
}

fn merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(t), Value::Object(s)) => {
            for (k, v) in s {
                if v.is_null() {
                    t.remove(k);
                } else if let Some(existing) = t.get_mut(k) {
                    merge(existing, v);
                } else {
                    t.insert(k.clone(), v.clone());
                }
            }
        }
        (t, s) => *t = s.clone(),
    }
}

impl FakeStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of write calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `verb` call ("apply", "delete", ...) on `kind` fail.
    pub fn fail_next(&self, verb: &'static str, kind: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert((verb, kind.to_string()));
        }
    }

    /// Store `obj` as is, without counting a write.
    pub fn insert(&self, ar: &ApiResource, obj: DynamicObject) -> DynamicObject {
        let stored = self.prepare(ar, obj, true);
        let key = (
            resource_key(ar),
            object_key(
                stored.metadata.namespace.as_deref(),
                stored.metadata.name.as_deref().unwrap_or(""),
            ),
        );
        self.objects.lock().unwrap().insert(key, stored.clone());
        stored
    }

    /// Look up an object without any side-effects.
    pub fn peek(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let key = (resource_key(ar), object_key(namespace, name));
        self.objects.lock().unwrap().get(&key).cloned()
    }

    fn next_version(&self) -> String {
        (self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn prepare(&self, ar: &ApiResource, mut obj: DynamicObject, create: bool) -> DynamicObject {
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        if create {
            let version = self.next_version();
            obj.metadata.uid = Some(format!("uid-{}", version));
            obj.metadata.resource_version = Some(version);
        }
        obj
    }

    fn check_failure(&self, verb: &'static str, ar: &ApiResource) -> kube::Result<()> {
        let mut failures = self.failures.lock().unwrap();
        if failures.remove(&(verb, ar.kind.clone())) {
            Err(error(
                500,
                "InternalError",
                format!("injected {} failure for {}", verb, ar.kind),
            ))
        } else {
            Ok(())
        }
    }

    fn write(
        &self,
        verb: &'static str,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        f: impl FnOnce(Option<&DynamicObject>) -> kube::Result<Option<DynamicObject>>,
    ) -> kube::Result<Option<DynamicObject>> {
        self.check_failure(verb, ar)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = (resource_key(ar), object_key(namespace, name));
        let mut objects = self.objects.lock().unwrap();
        match f(objects.get(&key))? {
            Some(mut obj) => {
                obj.metadata.resource_version = Some(self.next_version());
                let finalized = obj.metadata.deletion_timestamp.is_some()
                    && obj.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty());
                if finalized {
                    objects.remove(&key);
                } else {
                    objects.insert(key, obj.clone());
                }
                Ok(Some(obj))
            }
            None => {
                objects.remove(&key);
                Ok(None)
            }
        }
    }

    fn check_version(live: &DynamicObject, obj: &DynamicObject) -> kube::Result<()> {
        match &obj.metadata.resource_version {
            Some(v) if Some(v) != live.metadata.resource_version.as_ref() => Err(error(
                409,
                "Conflict",
                format!(
                    "the object {} has been modified; please apply your changes to the latest version and try again",
                    live.metadata.name.as_deref().unwrap_or("")
                ),
            )),
            _ => Ok(()),
        }
    }

    fn not_found(ar: &ApiResource, name: &str) -> kube::Error {
        error(404, "NotFound", format!("{} \"{}\" not found", ar.plural, name))
    }
}

fn to_object(value: Value) -> kube::Result<DynamicObject> {
    serde_json::from_value(value).map_err(kube::Error::SerdeError)
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> kube::Result<Option<DynamicObject>> {
        self.check_failure("get", ar)?;
        Ok(self.peek(ar, namespace, name))
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> kube::Result<Vec<DynamicObject>> {
        self.check_failure("list", ar)?;
        let rk = resource_key(ar);
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((r, (ns, _)), _)| {
                r == &rk && namespace.map_or(true, |namespace| namespace == ns)
            })
            .map(|(_, o)| o)
            .filter(|o| label_selector.map_or(true, |s| matches(o, s)))
            .cloned()
            .collect())
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let created = self.prepare(ar, obj.clone(), true);
        let result = self.write("create", ar, obj.metadata.namespace.as_deref(), &name, |live| {
            match live {
                Some(_) => Err(error(
                    409,
                    "AlreadyExists",
                    format!("{} \"{}\" already exists", ar.plural, name),
                )),
                None => Ok(Some(created)),
            }
        })?;
        result.ok_or_else(|| Self::not_found(ar, &name))
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> kube::Result<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let mut replacement = self.prepare(ar, obj.clone(), false);
        let result = self.write("replace", ar, obj.metadata.namespace.as_deref(), &name, |live| {
            let live = live.ok_or_else(|| Self::not_found(ar, &name))?;
            Self::check_version(live, obj)?;
            replacement.metadata.uid = live.metadata.uid.clone();
            replacement.metadata.deletion_timestamp = live.metadata.deletion_timestamp.clone();
            replacement.metadata.managed_fields = live.metadata.managed_fields.clone();
            match live.data.get("status") {
                Some(status) => replacement.data["status"] = status.clone(),
                None => {
                    if let Value::Object(data) = &mut replacement.data {
                        data.remove("status");
                    }
                }
            }
            Ok(Some(replacement))
        })?;
        result.ok_or_else(|| Self::not_found(ar, &name))
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> kube::Result<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let result = self.write(
            "replace_status",
            ar,
            obj.metadata.namespace.as_deref(),
            &name,
            |live| {
                let live = live.ok_or_else(|| Self::not_found(ar, &name))?;
                Self::check_version(live, obj)?;
                let mut updated = live.clone();
                if let Value::Object(data) = &mut updated.data {
                    match obj.data.get("status") {
                        Some(status) => {
                            data.insert("status".to_string(), status.clone());
                        }
                        None => {
                            data.remove("status");
                        }
                    }
                }
                Ok(Some(updated))
            },
        )?;
        result.ok_or_else(|| Self::not_found(ar, &name))
    }

    async fn apply(&self, ar: &ApiResource, document: &Value) -> kube::Result<DynamicObject> {
        let metadata = &document["metadata"];
        let name = metadata["name"].as_str().unwrap_or("").to_string();
        let namespace = metadata["namespace"].as_str().map(|v| v.to_string());
        let mut owned = document.clone();
        if let Value::Object(map) = &mut owned {
            map.remove("apiVersion");
            map.remove("kind");
            if let Some(Value::Object(m)) = map.get_mut("metadata") {
                m.remove("name");
                m.remove("namespace");
                if m.is_empty() {
                    map.remove("metadata");
                }
            }
        }
        let fields = fields_of(&owned);
        let entry = ManagedFieldsEntry {
            api_version: Some(ar.api_version.clone()),
            fields_type: Some("FieldsV1".to_string()),
            fields_v1: Some(FieldsV1(fields.clone())),
            manager: Some(MANAGER.to_string()),
            operation: Some("Apply".to_string()),
            ..Default::default()
        };
        let fresh = self.prepare(ar, to_object(document.clone())?, true);
        let result = self.write("apply", ar, namespace.as_deref(), &name, |live| {
            let mut obj = match live {
                None => fresh,
                Some(live) => {
                    let mut entries = live.metadata.managed_fields.clone().unwrap_or_default();
                    let previous = entries
                        .iter()
                        .find(|e| {
                            e.manager.as_deref() == Some(MANAGER)
                                && e.operation.as_deref() == Some("Apply")
                        })
                        .and_then(|e| e.fields_v1.as_ref().map(|f| f.0.clone()))
                        .unwrap_or(Value::Object(Map::new()));
                    let mut value = serde_json::to_value(live).map_err(kube::Error::SerdeError)?;
                    remove_released(&mut value, &previous, &fields);
                    merge(&mut value, &owned);
                    let mut obj = to_object(value)?;
                    entries.retain(|e| {
                        !(e.manager.as_deref() == Some(MANAGER)
                            && e.operation.as_deref() == Some("Apply"))
                    });
                    obj.metadata.managed_fields = Some(entries);
                    obj
                }
            };
            obj.metadata
                .managed_fields
                .get_or_insert_with(Vec::new)
                .push(entry);
            Ok(Some(obj))
        })?;
        result.ok_or_else(|| Self::not_found(ar, &name))
    }

    async fn patch_json(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> kube::Result<DynamicObject> {
        let result = self.write("patch", ar, namespace, name, |live| {
            let live = live.ok_or_else(|| Self::not_found(ar, name))?;
            let mut value = serde_json::to_value(live).map_err(kube::Error::SerdeError)?;
            json_patch::patch(&mut value, &patch.0)
                .map_err(|e| error(409, "Conflict", e.to_string()))?;
            Ok(Some(to_object(value)?))
        })?;
        result.ok_or_else(|| Self::not_found(ar, name))
    }

    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        preconditions: Option<Preconditions>,
    ) -> kube::Result<()> {
        if self.peek(ar, namespace, name).is_none() {
            return self.check_failure("delete", ar);
        }
        self.write("delete", ar, namespace, name, |live| {
            let live = match live {
                Some(live) => live,
                None => return Ok(None),
            };
            if let Some(p) = &preconditions {
                let uid_ok = p.uid.is_none() || p.uid == live.metadata.uid;
                let version_ok = p.resource_version.is_none()
                    || p.resource_version == live.metadata.resource_version;
                if !uid_ok || !version_ok {
                    return Err(error(
                        409,
                        "Conflict",
                        format!("precondition failed for {} \"{}\"", ar.plural, name),
                    ));
                }
            }
            if live.metadata.finalizers.as_ref().map_or(false, |f| !f.is_empty()) {
                let mut obj = live.clone();
                if obj.metadata.deletion_timestamp.is_none() {
                    let now: Time = serde_json::from_value(Value::String(
                        "2021-01-01T00:00:00Z".to_string(),
                    ))
                    .map_err(kube::Error::SerdeError)?;
                    obj.metadata.deletion_timestamp = Some(now);
                }
                Ok(Some(obj))
            } else {
                Ok(None)
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{managed_fields::extract, store::namespace_resource};
    use serde_json::json;

    fn namespace(name: &str, labels: Value) -> DynamicObject {
        to_object(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name, "labels": labels}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn apply_records_and_releases_fields() {
        let store = FakeStore::new();
        let ar = namespace_resource();
        store.insert(&ar, namespace("n", json!({"foreign": "x"})));
        store
            .apply(
                &ar,
                &json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "n", "labels": {"a": "1", "b": "2"}}}),
            )
            .await
            .unwrap();
        let desired = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "n", "labels": {"a": "1"}}});
        store.apply(&ar, &desired).await.unwrap();
        let live = store.peek(&ar, None, "n").unwrap();
        assert_eq!(
            json!({"a": "1", "foreign": "x"}),
            serde_json::to_value(&live.metadata.labels).unwrap()
        );
        assert_eq!(desired, extract(&live, &ar, MANAGER).unwrap());
        assert_eq!(2, store.writes());
    }

    #[tokio::test]
    async fn selectors_and_preconditions() {
        let store = FakeStore::new();
        let ar = namespace_resource();
        store.insert(&ar, namespace("a", json!({"t": "x", "r": "root"})));
        let b = store.insert(&ar, namespace("b", json!({"t": "x"})));
        store.insert(&ar, namespace("c", json!({})));
        assert_eq!(2, store.list(&ar, None, Some("t=x")).await.unwrap().len());
        assert_eq!(1, store.list(&ar, None, Some("t=x,r=root")).await.unwrap().len());
        assert_eq!(1, store.list(&ar, None, Some("r")).await.unwrap().len());
        let wrong = Preconditions {
            uid: Some("other".to_string()),
            resource_version: None,
        };
        assert!(store.delete(&ar, None, "b", Some(wrong)).await.is_err());
        let right = Preconditions {
            uid: b.metadata.uid.clone(),
            resource_version: b.metadata.resource_version.clone(),
        };
        store.delete(&ar, None, "b", Some(right)).await.unwrap();
        assert!(store.peek(&ar, None, "b").is_none());
        store.delete(&ar, None, "b", None).await.unwrap();
    }
}
