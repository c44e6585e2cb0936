use crate::{
    errors::ControllerError,
    store::{from_dynamic, tenant_resource, to_dynamic, ObjectStore},
};
use json_patch::diff;
use kube::ResourceExt;
use rustrial_k8s_tenant_controller_apis::{Tenant, FINALIZER};
use serde_json::{json, Value};
use std::ops::DerefMut;

/// Helper construct to simplify updating and patching [`Tenant`] objects.
///
/// Every write is conditioned on the `resourceVersion` the object had when it
/// was read (or last written through this helper).
pub(crate) struct TenantModifications {
    original: Tenant,
    pub modified: Tenant,
}

impl std::ops::Deref for TenantModifications {
    type Target = Tenant;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for TenantModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl TenantModifications {
    pub(crate) fn new(original: Tenant) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    fn status_has_changed(&self) -> bool {
        self.original.status != self.modified.status
    }

    fn get_metadata_patch(&self) -> Result<Option<json_patch::Patch>, ControllerError> {
        let mut original = self.original.clone();
        let mut modified = self.modified.clone();
        original.status = None;
        modified.status = None;
        let patch = diff(
            &serde_json::to_value(&original)?,
            &serde_json::to_value(&modified)?,
        );
        if patch.0.is_empty() {
            return Ok(None);
        }
        let mut ops = vec![json!({
            "op": "test",
            "path": "/metadata/resourceVersion",
            "value": original.resource_version(),
        })];
        if let Value::Array(rest) = serde_json::to_value(&patch)? {
            ops.extend(rest);
        }
        Ok(Some(serde_json::from_value(Value::Array(ops))?))
    }

    /// Persist status changes, returns whether anything was written.
    pub(crate) async fn replace_status<S: ObjectStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<bool, ControllerError> {
        if !self.status_has_changed() {
            return Ok(false);
        }
        let updated = store
            .replace_status(&tenant_resource(), &to_dynamic(&self.modified)?)
            .await?;
        let updated: Tenant = from_dynamic(updated)?;
        debug!(
            "updated status of Tenant {} to {:?}",
            updated.name_any(),
            updated.status
        );
        self.original = updated.clone();
        self.modified = updated;
        Ok(true)
    }

    /// Persist metadata and spec changes with a JSON patch, pending status
    /// changes are kept.
    pub(crate) async fn patch_metadata<S: ObjectStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<bool, ControllerError> {
        let patch = match self.get_metadata_patch()? {
            Some(patch) => patch,
            None => return Ok(false),
        };
        let name = self.original.name_any();
        let patched = store
            .patch_json(&tenant_resource(), None, name.as_str(), &patch)
            .await?;
        debug!(
            "patched Tenant {} ({:?}) with {}",
            name,
            self.original.resource_version(),
            serde_json::to_string(&patch)?
        );
        let patched: Tenant = from_dynamic(patched)?;
        let status = self.modified.status.take();
        self.original = patched.clone();
        self.modified = patched;
        self.modified.status = status;
        Ok(true)
    }

    /// Add the tenant finalizer if missing and persist it.
    pub(crate) async fn add_finalizer_if_missing<S: ObjectStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<bool, ControllerError> {
        if self.has_finalizer() {
            return Ok(false);
        }
        self.finalizers_mut().push(FINALIZER.to_string());
        let added = self.patch_metadata(store).await?;
        if added {
            info!("added finalizer to Tenant {}", self.name_any());
        }
        Ok(added)
    }

    /// Remove the tenant finalizer and persist it.
    pub(crate) async fn remove_finalizer<S: ObjectStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<bool, ControllerError> {
        if !self.has_finalizer() {
            return Ok(false);
        }
        self.finalizers_mut().retain(|f| f != FINALIZER);
        let removed = self.patch_metadata(store).await?;
        if removed {
            info!("removed finalizer from Tenant {}", self.name_any());
        }
        Ok(removed)
    }
}
