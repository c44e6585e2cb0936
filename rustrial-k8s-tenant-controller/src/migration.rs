//! Removal of legacy GitOps Applications which were created per tenant
//! namespace before applications could live in the tenant namespaces.

use std::sync::atomic::{AtomicBool, Ordering};

use kube::{api::Preconditions, ResourceExt};
use rustrial_k8s_tenant_controller_apis::{GITOPS_RESOURCES_FINALIZER, OWNER_APP_NAMESPACE_LABEL};

use crate::{
    errors::ControllerError,
    store::{application_resource, ObjectStore},
};

/// Process-lifetime migration state, once the legacy Applications are gone
/// the store is no longer queried.
#[derive(Default)]
pub(crate) struct Migrator {
    done: AtomicBool,
}

impl Migrator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Advance the migration by one step, returns `true` while the caller has
    /// to requeue before reconciling anything else.
    ///
    /// The GitOps finalizer is stripped from all legacy Applications first, so
    /// deleting them does not cascade into the deployed resources. Only once no
    /// Application holds the finalizer anymore are they deleted, conditioned on
    /// their uid and resourceVersion.
    pub(crate) async fn run<S: ObjectStore + ?Sized>(
        &self,
        store: &S,
        namespace: &str,
    ) -> Result<bool, ControllerError> {
        if self.is_done() {
            return Ok(false);
        }
        let ar = application_resource();
        let apps = store
            .list(&ar, Some(namespace), Some(OWNER_APP_NAMESPACE_LABEL))
            .await?;
        if apps.is_empty() {
            info!("no legacy Applications left in {}, migration complete", namespace);
            self.done.store(true, Ordering::Release);
            return Ok(false);
        }
        let mut stripped = false;
        for mut app in apps.iter().cloned() {
            if !app.finalizers().iter().any(|f| f == GITOPS_RESOURCES_FINALIZER) {
                continue;
            }
            app.finalizers_mut().retain(|f| f != GITOPS_RESOURCES_FINALIZER);
            store.replace(&ar, &app).await?;
            info!(
                "removed finalizer {} from legacy Application {}/{}",
                GITOPS_RESOURCES_FINALIZER,
                namespace,
                app.name_any()
            );
            stripped = true;
        }
        if stripped {
            return Ok(true);
        }
        for app in &apps {
            let preconditions = Preconditions {
                uid: app.uid(),
                resource_version: app.resource_version(),
            };
            store
                .delete(&ar, Some(namespace), app.name_any().as_str(), Some(preconditions))
                .await?;
            info!("deleted legacy Application {}/{}", namespace, app.name_any());
        }
        Ok(true)
    }
}
