//! Lookups of the objects related to a tenant.

use kube::{api::DynamicObject, ResourceExt};
use rustrial_k8s_tenant_controller_apis::{
    Tenant, NAMESPACE_TYPE_LABEL, NAMESPACE_TYPE_ROOT, OWNER_TENANT_LABEL,
};

use crate::{
    errors::ControllerError,
    store::{from_dynamic, namespace_resource, tenant_resource, ObjectStore},
};

pub(crate) fn tenant_selector(tenant: &str) -> String {
    format!("{}={}", OWNER_TENANT_LABEL, tenant)
}

pub(crate) fn root_selector(tenant: &str) -> String {
    format!(
        "{}={},{}={}",
        OWNER_TENANT_LABEL, tenant, NAMESPACE_TYPE_LABEL, NAMESPACE_TYPE_ROOT
    )
}

/// Root namespaces currently owned by `tenant`.
pub(crate) async fn root_namespaces<S: ObjectStore + ?Sized>(
    store: &S,
    tenant: &str,
) -> Result<Vec<DynamicObject>, ControllerError> {
    let selector = root_selector(tenant);
    Ok(store
        .list(&namespace_resource(), None, Some(selector.as_str()))
        .await?)
}

/// Names of all namespaces owned by `tenant`, including sub-namespaces, sorted.
pub(crate) async fn tenant_namespaces<S: ObjectStore + ?Sized>(
    store: &S,
    tenant: &str,
) -> Result<Vec<String>, ControllerError> {
    let selector = tenant_selector(tenant);
    let mut names: Vec<String> = store
        .list(&namespace_resource(), None, Some(selector.as_str()))
        .await?
        .iter()
        .map(|ns| ns.name_any())
        .collect();
    names.sort();
    Ok(names)
}

/// All tenants assigned to the application controller shard `controller_name`.
pub(crate) async fn tenants_of_controller<S: ObjectStore + ?Sized>(
    store: &S,
    controller_name: &str,
) -> Result<Vec<Tenant>, ControllerError> {
    let tenants = all_tenants(store).await?;
    Ok(tenants
        .into_iter()
        .filter(|t| t.controller_name() == controller_name)
        .collect())
}

/// All tenants, sorted by name.
pub(crate) async fn all_tenants<S: ObjectStore + ?Sized>(
    store: &S,
) -> Result<Vec<Tenant>, ControllerError> {
    let mut tenants = store
        .list(&tenant_resource(), None, None)
        .await?
        .into_iter()
        .map(|t| from_dynamic::<Tenant>(t))
        .collect::<Result<Vec<_>, _>>()?;
    tenants.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
    Ok(tenants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fake_store::FakeStore, store::to_dynamic};
    use rustrial_k8s_tenant_controller_apis::TenantSpec;
    use serde_json::json;

    fn namespace(name: &str, labels: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name, "labels": labels}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn namespace_indexes() {
        let store = FakeStore::new();
        let ar = namespace_resource();
        store.insert(
            &ar,
            namespace("app-a", json!({OWNER_TENANT_LABEL: "a-team", NAMESPACE_TYPE_LABEL: "root"})),
        );
        store.insert(
            &ar,
            namespace("sub-a", json!({OWNER_TENANT_LABEL: "a-team", "accurate.cybozu.com/parent": "app-a"})),
        );
        store.insert(
            &ar,
            namespace("app-b", json!({OWNER_TENANT_LABEL: "b-team", NAMESPACE_TYPE_LABEL: "root"})),
        );
        let roots: Vec<String> = root_namespaces(&store, "a-team")
            .await
            .unwrap()
            .iter()
            .map(|n| n.name_any())
            .collect();
        assert_eq!(vec!["app-a".to_string()], roots);
        assert_eq!(
            vec!["app-a".to_string(), "sub-a".to_string()],
            tenant_namespaces(&store, "a-team").await.unwrap()
        );
    }

    #[tokio::test]
    async fn controller_index() {
        let store = FakeStore::new();
        let ar = tenant_resource();
        for (name, controller) in [("b", None), ("a", Some("second")), ("c", Some(""))] {
            let tenant = Tenant::new(
                name,
                TenantSpec {
                    controller_name: controller.map(|c: &str| c.to_string()),
                    ..Default::default()
                },
            );
            store.insert(&ar, to_dynamic(&tenant).unwrap());
        }
        let names = |tenants: Vec<Tenant>| -> Vec<String> {
            tenants.iter().map(|t| t.name_any()).collect()
        };
        assert_eq!(
            vec!["b".to_string(), "c".to_string()],
            names(tenants_of_controller(&store, "default").await.unwrap())
        );
        assert_eq!(
            vec!["a".to_string()],
            names(tenants_of_controller(&store, "second").await.unwrap())
        );
    }
}
