//! Namespace lists consumed by the application controller shards.
//!
//! Every shard gets a ConfigMap `<shard>-application-controller-cm` listing the
//! namespaces of the tenants assigned to it, and a global ConfigMap lists the
//! namespaces of all tenants.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::{
    api::core::v1::ConfigMap,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::{Resource, ResourceExt};
use rustrial_k8s_tenant_controller_apis::{Tenant, CONTROLLER_NAME_LABEL};

use crate::{
    config::Config,
    errors::ControllerError,
    index::{all_tenants, tenant_namespaces, tenants_of_controller},
    store::{config_map_resource, from_dynamic, to_dynamic, ObjectStore},
    MANAGER,
};

pub(crate) const MANAGED_BY_LABEL: &'static str = "app.kubernetes.io/managed-by";
pub(crate) const PART_OF_LABEL: &'static str = "app.kubernetes.io/part-of";
pub(crate) const PART_OF_VALUE: &'static str = "argocd";
pub(crate) const NAMESPACES_KEY: &'static str = "application.namespaces";
pub(crate) const GLOBAL_CONFIG_MAP: &'static str = "all-tenant-namespaces-cm";

pub(crate) fn config_map_name(shard: &str) -> String {
    format!("{}-application-controller-cm", shard)
}

pub(crate) fn managed_by_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGER)
}

fn owner_reference(tenant: &Tenant) -> Result<OwnerReference, ControllerError> {
    let uid = tenant.uid().ok_or_else(|| {
        ControllerError::InvalidObject(format!("tenant {} has no uid", tenant.name_any()))
    })?;
    Ok(OwnerReference {
        api_version: Tenant::api_version(&()).to_string(),
        kind: Tenant::kind(&()).to_string(),
        name: tenant.name_any(),
        uid,
        ..Default::default()
    })
}

/// Build the namespace list ConfigMap for `tenants`.
pub(crate) async fn desired_config_map<S: ObjectStore + ?Sized>(
    store: &S,
    config: &Config,
    name: String,
    shard: Option<&str>,
    tenants: &[Tenant],
) -> Result<ConfigMap, ControllerError> {
    let mut namespaces: Vec<String> = Vec::new();
    let mut owners: Vec<OwnerReference> = Vec::with_capacity(tenants.len());
    for tenant in tenants {
        namespaces.extend(tenant_namespaces(store, tenant.name_any().as_str()).await?);
        owners.push(owner_reference(tenant)?);
    }
    namespaces.sort();
    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
    labels.insert(PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string());
    if let Some(shard) = shard {
        labels.insert(CONTROLLER_NAME_LABEL.to_string(), shard.to_string());
    }
    let mut data: BTreeMap<String, String> = BTreeMap::new();
    data.insert(NAMESPACES_KEY.to_string(), namespaces.join(","));
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(config.argocd.namespace.clone()),
            labels: Some(labels),
            owner_references: Some(owners),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Create `desired` or update labels, data and owner references of the live
/// ConfigMap, returns whether anything was written.
async fn upsert_config_map<S: ObjectStore + ?Sized>(
    store: &S,
    desired: ConfigMap,
) -> Result<bool, ControllerError> {
    let ar = config_map_resource();
    let namespace = desired.namespace();
    let name = desired.name_any();
    let live: Option<ConfigMap> = match store.get(&ar, namespace.as_deref(), name.as_str()).await? {
        Some(obj) => Some(from_dynamic(obj)?),
        None => None,
    };
    match live {
        None => {
            store.create(&ar, &to_dynamic(&desired)?).await?;
            info!(
                "created ConfigMap {}/{}",
                namespace.unwrap_or_default(),
                name
            );
            Ok(true)
        }
        Some(mut live) => {
            let unchanged = live.metadata.labels == desired.metadata.labels
                && live.data == desired.data
                && live.metadata.owner_references == desired.metadata.owner_references;
            if unchanged {
                debug!(
                    "ConfigMap {}/{} is up to date",
                    namespace.unwrap_or_default(),
                    name
                );
                return Ok(false);
            }
            live.metadata.labels = desired.metadata.labels;
            live.metadata.owner_references = desired.metadata.owner_references;
            live.data = desired.data;
            store.replace(&ar, &to_dynamic(&live)?).await?;
            info!(
                "updated ConfigMap {}/{}",
                namespace.unwrap_or_default(),
                name
            );
            Ok(true)
        }
    }
}

/// Refresh the namespace list of `shard`, deleting it when no tenant is assigned.
pub(crate) async fn sync_shard<S: ObjectStore + ?Sized>(
    store: &S,
    config: &Config,
    shard: &str,
) -> Result<bool, ControllerError> {
    let name = config_map_name(shard);
    let tenants = tenants_of_controller(store, shard).await?;
    if tenants.is_empty() {
        let ar = config_map_resource();
        let namespace = config.argocd.namespace.as_str();
        if store.get(&ar, Some(namespace), name.as_str()).await?.is_none() {
            return Ok(false);
        }
        store.delete(&ar, Some(namespace), name.as_str(), None).await?;
        info!("deleted ConfigMap {}/{} of unused shard", namespace, name);
        return Ok(true);
    }
    let desired = desired_config_map(store, config, name, Some(shard), &tenants).await?;
    upsert_config_map(store, desired).await
}

/// Refresh the namespace lists of every known shard and the global list.
///
/// Known shards are those with an existing ConfigMap plus the shard of `tenant`.
pub(crate) async fn sync_shards<S: ObjectStore + ?Sized>(
    store: &S,
    config: &Config,
    tenant: &Tenant,
) -> Result<(), ControllerError> {
    let selector = managed_by_selector();
    let mut shards: BTreeSet<String> = store
        .list(
            &config_map_resource(),
            Some(config.argocd.namespace.as_str()),
            Some(selector.as_str()),
        )
        .await?
        .iter()
        .filter_map(|cm| cm.labels().get(CONTROLLER_NAME_LABEL).cloned())
        .filter(|shard| !shard.is_empty())
        .collect();
    shards.insert(tenant.controller_name().to_string());
    for shard in &shards {
        sync_shard(store, config, shard.as_str()).await?;
    }
    let tenants = all_tenants(store).await?;
    let desired =
        desired_config_map(store, config, GLOBAL_CONFIG_MAP.to_string(), None, &tenants).await?;
    upsert_config_map(store, desired).await?;
    Ok(())
}
