use rustrial_k8s_tenant_controller_apis::{DelegateSpec, Tenant};

use crate::{
    errors::ControllerError,
    store::{from_dynamic, tenant_resource, ObjectStore},
    template::{Role, Roles},
};

/// Resolve the roles granted by `delegates` into role name to tenants.
///
/// Only the listed tenants are resolved, their own delegates are not followed.
pub(crate) async fn resolve<S: ObjectStore + ?Sized>(
    store: &S,
    delegates: &[DelegateSpec],
) -> Result<Roles, ControllerError> {
    let ar = tenant_resource();
    let mut roles = Roles::new();
    for delegate in delegates {
        let tenant: Tenant = match store.get(&ar, None, delegate.name.as_str()).await? {
            Some(obj) => from_dynamic(obj)?,
            None => return Err(ControllerError::DelegateNotFound(delegate.name.clone())),
        };
        for role in &delegate.roles {
            roles.entry(role.clone()).or_default().push(Role {
                name: delegate.name.clone(),
                extra_params: tenant.extra_params(),
            });
        }
    }
    for tenants in roles.values_mut() {
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
    }
    Ok(roles)
}
