use kube::ResourceExt;
use rustrial_k8s_tenant_controller_apis::{
    Tenant, OWNER_TENANT_LABEL, PROPAGATE_ANNOTATION, PROPAGATE_UPDATE,
};
use serde_json::{Map, Value};

use crate::{
    config::Config,
    errors::ControllerError,
    managed_fields::apply_if_changed,
    store::{role_binding_resource, ObjectStore},
    template::{RoleBindingContext, Roles, TemplateEngine},
};

const ROLE_BINDING: &'static str = "RoleBinding";

pub(crate) fn role_binding_name(tenant: &str) -> String {
    format!("{}-admin", tenant)
}

/// Insert `key: value` into the object at `value[field]`, creating it if needed.
pub(crate) fn force(value: &mut Value, field: &str, key: &str, v: &str) {
    if !value[field].is_object() {
        value[field] = Value::Object(Map::new());
    }
    value[field][key] = Value::String(v.to_string());
}

/// Render the administrator RoleBinding of `tenant` in `namespace`.
///
/// Identity and ownership markers always override what the template produced.
pub(crate) fn desired_role_binding(
    engine: &TemplateEngine,
    config: &Config,
    tenant: &Tenant,
    namespace: &str,
    roles: &Roles,
) -> Result<Value, ControllerError> {
    let name = tenant.name_any();
    let extra_params = tenant.extra_params();
    let mut rb = engine.render(
        ROLE_BINDING,
        config.namespace.role_binding_template.as_str(),
        &RoleBindingContext {
            name: name.as_str(),
            roles,
            extra_params: &extra_params,
        },
    )?;
    let ar = role_binding_resource();
    rb["apiVersion"] = Value::String(ar.api_version.clone());
    rb["kind"] = Value::String(ar.kind.clone());
    if !rb["metadata"].is_object() {
        rb["metadata"] = Value::Object(Map::new());
    }
    let metadata = &mut rb["metadata"];
    metadata["name"] = Value::String(role_binding_name(name.as_str()));
    metadata["namespace"] = Value::String(namespace.to_string());
    force(metadata, "labels", OWNER_TENANT_LABEL, name.as_str());
    force(metadata, "annotations", PROPAGATE_ANNOTATION, PROPAGATE_UPDATE);
    Ok(rb)
}

pub(crate) async fn apply_role_binding<S: ObjectStore + ?Sized>(
    store: &S,
    engine: &TemplateEngine,
    config: &Config,
    tenant: &Tenant,
    namespace: &str,
    roles: &Roles,
) -> Result<bool, ControllerError> {
    let rb = desired_role_binding(engine, config, tenant, namespace, roles)?;
    apply_if_changed(store, &role_binding_resource(), rb).await
}

/// Delete the administrator RoleBinding of `tenant` in `namespace`, if it is
/// still owned by `tenant` and not already being deleted.
pub(crate) async fn remove_role_binding<S: ObjectStore + ?Sized>(
    store: &S,
    tenant: &str,
    namespace: &str,
) -> Result<bool, ControllerError> {
    let ar = role_binding_resource();
    let name = role_binding_name(tenant);
    let rb = match store.get(&ar, Some(namespace), name.as_str()).await? {
        Some(rb) => rb,
        None => return Ok(false),
    };
    if rb.metadata.deletion_timestamp.is_some() {
        return Ok(false);
    }
    if rb.labels().get(OWNER_TENANT_LABEL).map(|v| v.as_str()) != Some(tenant) {
        debug!(
            "RoleBinding {}/{} is not owned by tenant {}",
            namespace, name, tenant
        );
        return Ok(false);
    }
    store.delete(&ar, Some(namespace), name.as_str(), None).await?;
    info!("deleted RoleBinding {}/{}", namespace, name);
    Ok(true)
}
