use std::collections::BTreeMap;

use kube::{api::DynamicObject, ResourceExt};
use rustrial_k8s_tenant_controller_apis::{
    RootNamespaceSpec, NAMESPACE_TYPE_LABEL, NAMESPACE_TYPE_ROOT, OWNER_TENANT_LABEL,
};
use serde_json::{json, Value};

use crate::{
    config::Config,
    errors::ControllerError,
    managed_fields::{apply_if_changed, extract},
    store::{namespace_resource, ObjectStore},
    MANAGER,
};

/// The fields of a root namespace owned by `tenant`.
pub(crate) fn desired_namespace(config: &Config, tenant: &str, spec: &RootNamespaceSpec) -> Value {
    let mut labels: BTreeMap<String, String> = config.namespace.common_labels.clone();
    labels.extend(spec.labels.clone().unwrap_or_default());
    labels.insert(
        NAMESPACE_TYPE_LABEL.to_string(),
        NAMESPACE_TYPE_ROOT.to_string(),
    );
    labels.insert(OWNER_TENANT_LABEL.to_string(), tenant.to_string());
    let mut annotations: BTreeMap<String, String> = config.namespace.common_annotations.clone();
    annotations.extend(spec.annotations.clone().unwrap_or_default());
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": spec.name,
            "labels": labels,
            "annotations": annotations,
        }
    })
}

pub(crate) async fn apply_namespace<S: ObjectStore + ?Sized>(
    store: &S,
    config: &Config,
    tenant: &str,
    spec: &RootNamespaceSpec,
) -> Result<bool, ControllerError> {
    apply_if_changed(
        store,
        &namespace_resource(),
        desired_namespace(config, tenant, spec),
    )
    .await
}

/// Release the ownership markers of `namespace`.
///
/// Only the owner label and the common labels and annotations are released,
/// everything else (including values set by other field managers) stays.
pub(crate) async fn disown_namespace<S: ObjectStore + ?Sized>(
    store: &S,
    config: &Config,
    namespace: &DynamicObject,
) -> Result<bool, ControllerError> {
    let ar = namespace_resource();
    let mut managed = extract(namespace, &ar, MANAGER)?;
    if let Some(labels) = managed["metadata"]["labels"].as_object_mut() {
        labels.remove(OWNER_TENANT_LABEL);
        for k in config.namespace.common_labels.keys() {
            labels.remove(k);
        }
    }
    if let Some(annotations) = managed["metadata"]["annotations"].as_object_mut() {
        for k in config.namespace.common_annotations.keys() {
            annotations.remove(k);
        }
    }
    let changed = apply_if_changed(store, &ar, managed).await?;
    if changed {
        info!("disowned namespace {}", namespace.name_any());
    }
    Ok(changed)
}
