//! The per-tenant GitOps project (an Argo CD `AppProject`).

use kube::{api::DynamicObject, ResourceExt};
use rustrial_k8s_tenant_controller_apis::{
    Condition, ProjectSyncWindow, SyncWindow, Tenant, CONDITION_SYNCED, OWNER_TENANT_LABEL,
};
use serde_json::{Map, Value};

use crate::{
    config::Config,
    errors::ControllerError,
    index::tenant_namespaces,
    managed_fields::{extract, normalize},
    rbac::force,
    store::{app_project_resource, from_dynamic, sync_window_resource, to_dynamic, ObjectStore},
    template::{AppProjectContext, Roles, TemplateEngine},
    MANAGER,
};

const APP_PROJECT: &'static str = "AppProject";

/// Destinations of the project: the tenant's own namespaces and the
/// namespaces of the tenants it delegates roles to, sorted.
pub(crate) async fn project_namespaces<S: ObjectStore + ?Sized>(
    store: &S,
    tenant: &Tenant,
) -> Result<Vec<String>, ControllerError> {
    let mut namespaces = tenant_namespaces(store, tenant.name_any().as_str()).await?;
    for delegate in &tenant.spec.delegates {
        namespaces.extend(tenant_namespaces(store, delegate.name.as_str()).await?);
    }
    namespaces.sort();
    Ok(namespaces)
}

/// SyncWindow objects in the namespaces of `tenant`, ordered by namespace and name.
pub(crate) async fn sync_windows<S: ObjectStore + ?Sized>(
    store: &S,
    tenant: &str,
) -> Result<Vec<SyncWindow>, ControllerError> {
    let ar = sync_window_resource();
    let mut windows: Vec<SyncWindow> = Vec::new();
    for namespace in tenant_namespaces(store, tenant).await? {
        for obj in store.list(&ar, Some(namespace.as_str()), None).await? {
            windows.push(from_dynamic(obj)?);
        }
    }
    windows.sort_by(|a, b| {
        (a.namespace(), a.name_any()).cmp(&(b.namespace(), b.name_any()))
    });
    Ok(windows)
}

/// Render the project of `tenant`, including all of its sync windows.
pub(crate) fn desired_project(
    engine: &TemplateEngine,
    config: &Config,
    tenant: &Tenant,
    namespaces: &[String],
    roles: &Roles,
    windows: &[SyncWindow],
) -> Result<Value, ControllerError> {
    let name = tenant.name_any();
    let mut repositories = tenant.spec.argocd.repositories.clone();
    repositories.sort();
    let extra_params = tenant.extra_params();
    let mut project = engine.render(
        APP_PROJECT,
        config.argocd.app_project_template.as_str(),
        &AppProjectContext {
            name: name.as_str(),
            namespaces,
            roles,
            repositories: repositories.as_slice(),
            extra_params: &extra_params,
        },
    )?;
    let ar = app_project_resource();
    project["apiVersion"] = Value::String(ar.api_version.clone());
    project["kind"] = Value::String(ar.kind.clone());
    if !project["metadata"].is_object() {
        project["metadata"] = Value::Object(Map::new());
    }
    let metadata = &mut project["metadata"];
    metadata["name"] = Value::String(name.clone());
    metadata["namespace"] = Value::String(config.argocd.namespace.clone());
    force(metadata, "labels", OWNER_TENANT_LABEL, name.as_str());
    let mut all: Vec<ProjectSyncWindow> = match project.get("spec").and_then(|s| s.get("syncWindows")) {
        Some(Value::Null) | None => Vec::new(),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            ControllerError::TemplateDecode(APP_PROJECT, format!("invalid spec.syncWindows: {}", e))
        })?,
    };
    all.extend(windows.iter().flat_map(|w| w.spec.sync_windows.iter().cloned()));
    if !all.is_empty() {
        if !project["spec"].is_object() {
            project["spec"] = Value::Object(Map::new());
        }
        project["spec"]["syncWindows"] = serde_json::to_value(&all)?;
    }
    normalize(&mut project);
    Ok(project)
}

/// Mark every window as merged into the project, reporting all failures at once.
async fn update_sync_window_status<S: ObjectStore + ?Sized>(
    store: &S,
    windows: Vec<SyncWindow>,
) -> Result<(), ControllerError> {
    let ar = sync_window_resource();
    let mut errors: Vec<String> = Vec::new();
    for mut window in windows {
        let before = window.status.clone();
        window.update_condition(Condition::new(
            CONDITION_SYNCED,
            Some(true),
            "OK",
            String::new(),
        ));
        if window.status == before {
            continue;
        }
        let id = format!(
            "{}/{}",
            window.namespace().unwrap_or_default(),
            window.name_any()
        );
        let result = match to_dynamic(&window) {
            Ok(obj) => store.replace_status(&ar, &obj).await.map_err(ControllerError::from),
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(_) => debug!("updated status of SyncWindow {}", id),
            Err(e) => {
                warn!("failed to update status of SyncWindow {}: {}", id, e);
                errors.push(format!("{}: {}", id, e));
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ControllerError::SyncWindowStatus(errors.join(", ")))
    }
}

/// Bring the project of `tenant` and the status of its sync windows up to date.
///
/// Returns whether the project was written.
pub(crate) async fn sync_project<S: ObjectStore + ?Sized>(
    store: &S,
    engine: &TemplateEngine,
    config: &Config,
    tenant: &Tenant,
    roles: &Roles,
) -> Result<bool, ControllerError> {
    let ar = app_project_resource();
    let name = tenant.name_any();
    let namespace = config.argocd.namespace.as_str();
    let live: Option<DynamicObject> = store.get(&ar, Some(namespace), name.as_str()).await?;
    let namespaces = project_namespaces(store, tenant).await?;
    let windows = sync_windows(store, name.as_str()).await?;
    let project = desired_project(engine, config, tenant, &namespaces, roles, &windows)?;
    let up_to_date = match &live {
        Some(live) => extract(live, &ar, MANAGER)? == project,
        None => false,
    };
    if up_to_date && windows.iter().all(|w| w.is_synced()) {
        debug!("AppProject {}/{} is up to date", namespace, name);
        return Ok(false);
    }
    store.apply(&ar, &project).await?;
    info!(
        "applied AppProject {}/{} with namespaces [{}] and {} sync windows",
        namespace,
        name,
        namespaces.join(","),
        windows.len()
    );
    update_sync_window_status(store, windows).await?;
    Ok(true)
}

/// Delete the project of `tenant` if it is still owned by `tenant`.
pub(crate) async fn remove_project<S: ObjectStore + ?Sized>(
    store: &S,
    config: &Config,
    tenant: &str,
) -> Result<bool, ControllerError> {
    let ar = app_project_resource();
    let namespace = config.argocd.namespace.as_str();
    let project = match store.get(&ar, Some(namespace), tenant).await? {
        Some(project) => project,
        None => return Ok(false),
    };
    if project.metadata.deletion_timestamp.is_some() {
        return Ok(false);
    }
    if project.labels().get(OWNER_TENANT_LABEL).map(|v| v.as_str()) != Some(tenant) {
        debug!(
            "AppProject {}/{} is not owned by tenant {}",
            namespace, tenant, tenant
        );
        return Ok(false);
    }
    store.delete(&ar, Some(namespace), tenant, None).await?;
    info!("deleted AppProject {}/{}", namespace, tenant);
    Ok(true)
}
