use crate::{errors::ExtKubeApiError, MANAGER};
use async_trait::async_trait;
use k8s_openapi::api::{
    core::v1::{ConfigMap, Namespace},
    rbac::v1::RoleBinding,
};
use kube::{
    api::{
        ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
        PatchParams, PostParams, Preconditions, TypeMeta,
    },
    Api, Client, Resource, ResourceExt,
};
use rustrial_k8s_tenant_controller_apis::{SyncWindow, Tenant};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Group of the GitOps controller's custom resources.
pub(crate) const GITOPS_GROUP: &'static str = "argoproj.io";
pub(crate) const GITOPS_VERSION: &'static str = "v1alpha1";

pub(crate) fn namespace_resource() -> ApiResource {
    ApiResource::erase::<Namespace>(&())
}

pub(crate) fn role_binding_resource() -> ApiResource {
    ApiResource::erase::<RoleBinding>(&())
}

pub(crate) fn config_map_resource() -> ApiResource {
    ApiResource::erase::<ConfigMap>(&())
}

pub(crate) fn tenant_resource() -> ApiResource {
    ApiResource::erase::<Tenant>(&())
}

pub(crate) fn sync_window_resource() -> ApiResource {
    ApiResource::erase::<SyncWindow>(&())
}

pub(crate) fn app_project_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(GITOPS_GROUP, GITOPS_VERSION, "AppProject"),
        "appprojects",
    )
}

pub(crate) fn application_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(GITOPS_GROUP, GITOPS_VERSION, "Application"),
        "applications",
    )
}

/// Convert a typed resource into a [`DynamicObject`].
pub(crate) fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

/// Convert a [`DynamicObject`] into a typed resource, filling in missing type meta.
pub(crate) fn from_dynamic<K>(mut obj: DynamicObject) -> Result<K, serde_json::Error>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
        });
    }
    serde_json::from_value(serde_json::to_value(&obj)?)
}

/// Point-in-time access to the versioned object store (the Kubernetes API server).
///
/// Every call is a single request/response, there is no local caching.
#[async_trait]
pub(crate) trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` if it does not exist.
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> kube::Result<Option<DynamicObject>>;

    /// List objects, across all namespaces if `namespace` is `None`.
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> kube::Result<Vec<DynamicObject>>;

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> kube::Result<DynamicObject>;

    /// Replace an object, conditioned on its `resourceVersion` if set.
    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject)
        -> kube::Result<DynamicObject>;

    /// Replace the status subresource, conditioned on its `resourceVersion` if set.
    async fn replace_status(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> kube::Result<DynamicObject>;

    /// Server-side apply `document` with our field manager.
    async fn apply(&self, ar: &ApiResource, document: &Value) -> kube::Result<DynamicObject>;

    async fn patch_json(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> kube::Result<DynamicObject>;

    /// Delete an object, an object which does not exist is not an error.
    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        preconditions: Option<Preconditions>,
    ) -> kube::Result<()>;
}

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub(crate) struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    fn post_params() -> PostParams {
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        pp
    }
}

pub(crate) fn document_name(document: &Value) -> kube::Result<(Option<String>, String)> {
    let metadata = &document["metadata"];
    let name = metadata["name"].as_str().ok_or_else(|| {
        kube::Error::Service(
            format!("document has no metadata.name: {}", document).into(),
        )
    })?;
    let namespace = metadata["namespace"].as_str().map(|v| v.to_string());
    Ok((namespace, name.to_string()))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> kube::Result<Option<DynamicObject>> {
        self.api(ar, namespace).get_opt(name).await
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> kube::Result<Vec<DynamicObject>> {
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        Ok(self.api(ar, namespace).list(&lp).await?.items)
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        let api = self.api(ar, obj.metadata.namespace.as_deref());
        api.create(&Self::post_params(), obj).await
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> kube::Result<DynamicObject> {
        let api = self.api(ar, obj.metadata.namespace.as_deref());
        api.replace(obj.name_any().as_str(), &Self::post_params(), obj)
            .await
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> kube::Result<DynamicObject> {
        let api = self.api(ar, obj.metadata.namespace.as_deref());
        api.replace_status(
            obj.name_any().as_str(),
            &Self::post_params(),
            serde_json::to_vec(obj).map_err(|e| kube::Error::SerdeError(e))?,
        )
        .await
    }

    async fn apply(&self, ar: &ApiResource, document: &Value) -> kube::Result<DynamicObject> {
        let (namespace, name) = document_name(document)?;
        let api = self.api(ar, namespace.as_deref());
        api.patch(
            name.as_str(),
            &PatchParams::apply(MANAGER).force(),
            &Patch::Apply(document),
        )
        .await
    }

    async fn patch_json(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> kube::Result<DynamicObject> {
        let api = self.api(ar, namespace);
        api.patch(
            name,
            &PatchParams {
                field_manager: Some(MANAGER.to_string()),
                dry_run: false,
                force: false,
                field_validation: None,
            },
            &Patch::<DynamicObject>::Json(patch.clone()),
        )
        .await
    }

    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        preconditions: Option<Preconditions>,
    ) -> kube::Result<()> {
        let api = self.api(ar, namespace);
        let dp = DeleteParams {
            preconditions,
            ..Default::default()
        };
        match api.delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use rustrial_k8s_tenant_controller_apis::{RootNamespaceSpec, TenantSpec};

    #[test]
    fn api_resources() {
        let ar = app_project_resource();
        assert_eq!("argoproj.io/v1alpha1", ar.api_version);
        assert_eq!("appprojects", ar.plural);
        assert_eq!("tenants", tenant_resource().plural);
        assert_eq!("v1", namespace_resource().api_version);
        assert_eq!(
            "rbac.authorization.k8s.io/v1",
            role_binding_resource().api_version
        );
    }

    #[test]
    fn typed_conversion() {
        let tenant = Tenant {
            metadata: ObjectMeta {
                name: Some("a-team".to_string()),
                ..Default::default()
            },
            spec: TenantSpec {
                root_namespaces: vec![RootNamespaceSpec {
                    name: "app-a".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        };
        let mut obj = to_dynamic(&tenant).unwrap();
        assert_eq!("Tenant", obj.types.as_ref().unwrap().kind);
        obj.types = None;
        let back: Tenant = from_dynamic(obj).unwrap();
        assert_eq!(tenant, back);
    }

    #[test]
    fn document_without_name() {
        assert!(document_name(&serde_json::json!({"metadata": {}})).is_err());
        let (ns, name) =
            document_name(&serde_json::json!({"metadata": {"name": "a", "namespace": "b"}}))
                .unwrap();
        assert_eq!((Some("b".to_string()), "a".to_string()), (ns, name));
    }
}
