use crate::{
    config::Config,
    delegation,
    errors::ControllerError,
    index::root_namespaces,
    migration::Migrator,
    namespaces::{apply_namespace, disown_namespace},
    project::{remove_project, sync_project},
    prometheus_exporter::HealthMetrics,
    rbac::{apply_role_binding, remove_role_binding},
    sharding::{managed_by_selector, sync_shards},
    store::{app_project_resource, from_dynamic, tenant_resource, KubeStore, ObjectStore},
    template::TemplateEngine,
    tenant_modifications::TenantModifications,
    utils::metric_name,
};

use futures::{Future, StreamExt};
use k8s_openapi::api::{
    core::v1::{ConfigMap, Namespace},
    rbac::v1::RoleBinding,
};
use kube::{api::DynamicObject, Api, Client, Resource, ResourceExt};
use kube_runtime::{
    controller::{Action, Controller},
    reflector::{ObjectRef, Store},
    watcher::Config as WatcherConfig,
};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use rustrial_k8s_tenant_controller_apis::{
    Condition, SyncWindow, Tenant, TenantHealth, CONDITION_READY, OWNER_TENANT_LABEL,
};
use std::{sync::Arc, time::Instant};
use tokio::time::{sleep, Duration};

const TENANT_CONTROLLER: &'static str = "tenant_controller";
pub(crate) const SUCCESS: &'static str = "OK";
pub(crate) const FAILURE: &'static str = "Failed";

/// Reconciles a single [`Tenant`] against an [`ObjectStore`].
pub(crate) struct TenantReconciler<S> {
    store: S,
    config: Config,
    engine: TemplateEngine,
    migrator: Migrator,
    health: HealthMetrics,
    reconcile_tenant_count: Counter<u64>,
    reconcile_tenant_duration: Histogram<u64>,
}

impl<S: ObjectStore> TenantReconciler<S> {
    pub fn new(store: S, config: Config, health: HealthMetrics) -> Self {
        let meter: Meter = global::meter(TENANT_CONTROLLER);
        let reconcile_tenant_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of Tenant reconcile invocations")
            .build();
        let reconcile_tenant_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of Tenant objects in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            store,
            config,
            engine: TemplateEngine::new(),
            migrator: Migrator::new(),
            health,
            reconcile_tenant_count,
            reconcile_tenant_duration,
        }
    }

    /// Reconcile the tenant `name` as currently found in the store.
    pub(crate) async fn reconcile_tenant(&self, name: &str) -> Result<Action, ControllerError> {
        if self
            .migrator
            .run(&self.store, self.config.argocd.namespace.as_str())
            .await?
        {
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        let tenant: Tenant = match self.store.get(&tenant_resource(), None, name).await? {
            Some(obj) => from_dynamic(obj)?,
            None => {
                debug!("Tenant {} does not exist anymore", name);
                return Ok(Action::await_change());
            }
        };
        let mut tenant = TenantModifications::new(tenant);
        let start = Instant::now();
        let result = if tenant.is_deleted() {
            self.finalize(&mut tenant)
                .await
                .map(|_| Action::await_change())
        } else {
            self.sync(&mut tenant)
                .await
                .map(|_| Action::requeue(Duration::from_secs(3600)))
        };
        let duration = Instant::now() - start;
        let labels = &[KeyValue::new("tenant", name.to_string())];
        self.reconcile_tenant_count.add(1, labels);
        self.reconcile_tenant_duration
            .record(duration.as_millis() as u64, labels);
        result
    }

    /// Namespaces, RoleBindings, the project and the shard lists, in that order.
    async fn check(&self, tenant: &Tenant) -> Result<(), ControllerError> {
        let store = &self.store;
        let name = tenant.name_any();
        let roles = delegation::resolve(store, &tenant.spec.delegates).await?;
        for ns in &tenant.spec.root_namespaces {
            apply_namespace(store, &self.config, name.as_str(), ns).await?;
            apply_role_binding(
                store,
                &self.engine,
                &self.config,
                tenant,
                ns.name.as_str(),
                &roles,
            )
            .await?;
        }
        for ns in root_namespaces(store, name.as_str()).await? {
            if tenant.declares_root_namespace(ns.name_any().as_str()) {
                continue;
            }
            // the root namespace index only finds owned namespaces
            remove_role_binding(store, name.as_str(), ns.name_any().as_str()).await?;
            disown_namespace(store, &self.config, &ns).await?;
        }
        sync_project(store, &self.engine, &self.config, tenant, &roles).await?;
        sync_shards(store, &self.config, tenant).await?;
        Ok(())
    }

    async fn sync(&self, tenant: &mut TenantModifications) -> Result<(), ControllerError> {
        // First of all make sure the finalizer is in place.
        tenant.add_finalizer_if_missing(&self.store).await?;
        let name = tenant.name_any();
        let result = self.check(&tenant.modified).await;
        match &result {
            Ok(_) => {
                tenant.set_health(TenantHealth::Healthy);
                tenant.update_condition(Condition::new(
                    CONDITION_READY,
                    Some(true),
                    SUCCESS,
                    String::new(),
                ));
            }
            Err(e) => {
                tenant.set_health(TenantHealth::Unhealthy);
                tenant.update_condition(Condition::new(
                    CONDITION_READY,
                    Some(false),
                    FAILURE,
                    format!("{}", e),
                ));
            }
        }
        let status = tenant.replace_status(&self.store).await;
        self.health.set(name.as_str(), tenant.health());
        match (result, status) {
            (Err(e), Err(status_error)) => {
                warn!(
                    "failed to update status of Tenant {}: {}",
                    name, status_error
                );
                Err(e)
            }
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(_), Ok(changed)) => {
                if changed {
                    info!("Tenant {} successfully reconciled", name);
                } else {
                    debug!("Tenant {} is up to date", name);
                }
                Ok(())
            }
        }
    }

    /// Tear down everything derived from `tenant`, the finalizer is removed last.
    async fn finalize(&self, tenant: &mut TenantModifications) -> Result<(), ControllerError> {
        if !tenant.has_finalizer() {
            return Ok(());
        }
        let store = &self.store;
        let name = tenant.name_any();
        info!("starting finalization of Tenant {}", name);
        for ns in root_namespaces(store, name.as_str()).await? {
            remove_role_binding(store, name.as_str(), ns.name_any().as_str()).await?;
            disown_namespace(store, &self.config, &ns).await?;
        }
        remove_project(store, &self.config, name.as_str()).await?;
        self.health.remove(name.as_str());
        tenant.remove_finalizer(store).await?;
        info!("finished finalization of Tenant {}", name);
        Ok(())
    }

    /// Controller triggers this whenever a tenant or one of its objects changed
    async fn reconcile(object: Arc<Tenant>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        ctx.reconcile_tenant(object.name_any().as_str()).await
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(_object: Arc<Tenant>, error: &ControllerError, _ctx: Arc<Self>) -> Action {
        if error.is_temporary() {
            Action::requeue(Duration::from_secs(30))
        } else {
            Action::requeue(Duration::from_secs(300))
        }
    }
}

/// Map an object to the tenant named in its owner label.
fn owner_of<K: Resource>(obj: K) -> Option<ObjectRef<Tenant>> {
    obj.labels()
        .get(OWNER_TENANT_LABEL)
        .filter(|owner| !owner.is_empty())
        .map(|owner| ObjectRef::new(owner.as_str()))
}

/// Map an object to every tenant listed in its ownerReferences.
///
/// Tenants are cluster scoped, so the references must not inherit the
/// namespace of the object.
fn owner_references_of<K: Resource>(obj: K) -> Vec<ObjectRef<Tenant>> {
    let api_version = Tenant::api_version(&());
    let kind = Tenant::kind(&());
    obj.owner_references()
        .iter()
        .filter(|r| r.api_version == api_version.as_ref() && r.kind == kind.as_ref())
        .map(|r| ObjectRef::new(r.name.as_str()))
        .collect()
}

/// Map a namespaced object to the tenant owning its namespace.
fn namespace_owner<K: Resource>(cache: &Store<Namespace>, obj: K) -> Option<ObjectRef<Tenant>> {
    let namespace = obj.namespace()?;
    let namespace = cache.get(&ObjectRef::new(namespace.as_str()))?;
    owner_of(namespace.as_ref().clone())
}

/// The main controller watching [`Tenant`] objects and everything derived from them.
pub(crate) struct TenantController {
    client: Client,
    namespace_cache: Store<Namespace>,
    reconciler: TenantReconciler<KubeStore>,
}

impl TenantController {
    pub fn new(
        client: Client,
        config: Config,
        health: HealthMetrics,
        namespace_cache: Store<Namespace>,
    ) -> Self {
        let reconciler = TenantReconciler::new(KubeStore::new(client.clone()), config, health);
        Self {
            client,
            namespace_cache,
            reconciler,
        }
    }

    pub fn start(self) -> impl Future<Output = ()> {
        let client = self.client;
        let namespace_cache = self.namespace_cache;
        let gitops_namespace = self.reconciler.config.argocd.namespace.clone();
        let project_resource = app_project_resource();
        let owned = WatcherConfig::default().labels(OWNER_TENANT_LABEL);
        let controller = Controller::new(Api::<Tenant>::all(client.clone()), WatcherConfig::default())
            .watches(
                Api::<ConfigMap>::namespaced(client.clone(), gitops_namespace.as_str()),
                WatcherConfig::default().labels(managed_by_selector().as_str()),
                owner_references_of::<ConfigMap>,
            )
            .watches(
                Api::<Namespace>::all(client.clone()),
                owned.clone(),
                owner_of::<Namespace>,
            )
            .watches(
                Api::<RoleBinding>::all(client.clone()),
                owned.clone(),
                owner_of::<RoleBinding>,
            )
            .watches_with(
                Api::<DynamicObject>::namespaced_with(
                    client.clone(),
                    gitops_namespace.as_str(),
                    &project_resource,
                ),
                project_resource.clone(),
                owned,
                owner_of::<DynamicObject>,
            )
            .watches(
                Api::<SyncWindow>::all(client.clone()),
                WatcherConfig::default(),
                move |sw: SyncWindow| namespace_owner(&namespace_cache, sw),
            );
        controller
            .run(
                TenantReconciler::<KubeStore>::reconcile,
                TenantReconciler::<KubeStore>::error_policy,
                Arc::new(self.reconciler),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => {
                        debug!("reconciled {:?}", o);
                    }
                    Err(e) => {
                        let meter: Meter = global::meter(TENANT_CONTROLLER);
                        let reconcile_tenant_errors = meter
                            .u64_counter(metric_name("reconcile_errors"))
                            .with_description(
                                "Count of reconcile invocation errors for Tenant resources",
                            )
                            .build();
                        let labels = &[];
                        match e {
                            a @ kube_runtime::controller::Error::QueueError { .. } => {
                                debug!("reconcile failed: {:?}", a);
                                reconcile_tenant_errors.add(1, labels);
                                // Slow down on errors caused by missing CRDs or permissions.
                                sleep(Duration::from_secs(30)).await;
                            }
                            a @ kube_runtime::controller::Error::ObjectNotFound { .. } => {
                                debug!("reconcile failed: {:?}", a);
                            }
                            e => {
                                warn!("reconcile failed: {:?}", e);
                                reconcile_tenant_errors.add(1, labels);
                            }
                        };
                    }
                }
            })
    }
}
