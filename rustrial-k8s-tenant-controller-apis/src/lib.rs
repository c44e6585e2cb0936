use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use kube::{CustomResource, ResourceExt};

use schemars::{
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
    JsonSchema,
};
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "tenant.rustrial.org";

/// Label put on every object owned by a [`Tenant`], its value is the tenant's name.
pub const OWNER_TENANT_LABEL: &'static str = "tenant.rustrial.org/tenant";

/// Label carried by GitOps applications which were created by the legacy
/// application mirroring (before applications in any namespace were supported).
pub const OWNER_APP_NAMESPACE_LABEL: &'static str = "tenant.rustrial.org/owner-namespace";

/// Label identifying the application controller shard of a sharding ConfigMap.
pub const CONTROLLER_NAME_LABEL: &'static str = "tenant.rustrial.org/controller-name";

/// The [`Tenant`] finalizer name.
///
/// Note, changing the finalizer name is a breaking change and needs
/// additional code to remove the old finalizer (name) from all affected
/// K8s objects.
pub const FINALIZER: &'static str = "tenant.rustrial.org/finalizer";

/// Namespace type marker used by the hierarchical namespace controller (Accurate).
pub const NAMESPACE_TYPE_LABEL: &'static str = "accurate.cybozu.com/type";
pub const NAMESPACE_TYPE_ROOT: &'static str = "root";

/// Annotation asking the hierarchical namespace controller to propagate an
/// object into sub-namespaces.
pub const PROPAGATE_ANNOTATION: &'static str = "accurate.cybozu.com/propagate";
pub const PROPAGATE_UPDATE: &'static str = "update";

/// Finalizer of the GitOps controller which must be stripped from legacy applications.
pub const GITOPS_RESOURCES_FINALIZER: &'static str = "resources-finalizer.argocd.argoproj.io";

/// Shard name used for tenants without an explicit `controllerName`.
pub const DEFAULT_CONTROLLER_NAME: &'static str = "default";

pub const CONDITION_READY: &'static str = "Ready";
pub const CONDITION_SYNCED: &'static str = "Synced";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another. This should be when the underlying condition changed.  If that is not known, then using the time when the API field changed is acceptable.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon. For instance, if .metadata.generation is currently 12, but the .status.conditions\[x\].observedGeneration is 9, the condition is out of date with respect to the current state of the instance.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition. Producers of specific condition types may define expected values and meanings for this field, and whether the values are considered a guaranteed API. The value should be a CamelCase string. This field may not be empty.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Set `c` in `conditions`, replacing any condition of the same type.
///
/// `lastTransitionTime` only moves when the status flips, so setting an
/// identical condition leaves `conditions` untouched.
pub fn set_condition(conditions: &mut Vec<Condition>, mut c: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|v| v.type_ == c.type_) {
        if existing.status != c.status {
            c.last_transition_time = Some(now());
            *existing = c;
        } else {
            existing.reason = c.reason;
            existing.message = c.message;
            existing.observed_generation = c.observed_generation;
            if existing.last_transition_time.is_none() {
                existing.last_transition_time = Some(now());
            }
        }
    } else {
        c.last_transition_time = Some(now());
        conditions.push(c);
    }
}

pub fn is_condition_true(conditions: &[Condition], tpe: &str) -> bool {
    conditions.iter().any(|c| c.type_ == tpe && c.is_true())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Untyped parameters which are handed to the templates as `ExtraParams`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Params(pub serde_json::Map<String, serde_json::Value>);

impl JsonSchema for Params {
    fn schema_name() -> String {
        "Params".to_string()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        let mut schema = SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            ..Default::default()
        };
        schema.extensions.insert(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        );
        Schema::Object(schema)
    }
}

/// A tenant owns a set of root namespaces, grants roles to other tenants and
/// gets a GitOps project covering all of its namespaces.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "tenant.rustrial.org",
    version = "v1beta1",
    kind = "Tenant",
    derive = "PartialEq",
    status = "TenantStatus",
    printcolumn = r#"{
        "name":"Health",
        "type": "string",
        "jsonPath": ".status.health",
        "description": "Whether the last reconciliation of the tenant succeeded."
    }"#,
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether all resources derived from the tenant are in sync."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// The root namespaces owned by this tenant.
    #[schemars(length(min = 1))]
    pub root_namespaces: Vec<RootNamespaceSpec>,
    /// Settings for the tenant's GitOps project.
    #[serde(rename = "argoCD", default)]
    pub argocd: ArgoCdSpec,
    /// Other tenants granted roles on this tenant's namespaces and project.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegates: Vec<DelegateSpec>,
    /// Free-form parameters available to the RoleBinding and project templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_params: Option<Params>,
    /// The application controller shard this tenant is assigned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct RootNamespaceSpec {
    /// Name of the namespace.
    pub name: String,
    /// Labels added to the namespace on top of the common labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Annotations added to the namespace on top of the common annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct ArgoCdSpec {
    /// Source repositories the tenant's applications may deploy from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct DelegateSpec {
    /// Name of the delegated tenant.
    pub name: String,
    /// Roles granted to the delegated tenant.
    #[schemars(length(min = 1))]
    pub roles: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum TenantHealth {
    Healthy,
    Unhealthy,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct TenantStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<TenantHealth>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Tenant {
    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// The application controller shard, falls back to [`DEFAULT_CONTROLLER_NAME`].
    pub fn controller_name(&self) -> &str {
        self.spec
            .controller_name
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_CONTROLLER_NAME)
    }

    pub fn extra_params(&self) -> serde_json::Map<String, serde_json::Value> {
        self.spec
            .extra_params
            .as_ref()
            .map(|p| p.0.clone())
            .unwrap_or_default()
    }

    pub fn declares_root_namespace(&self, namespace: &str) -> bool {
        self.spec.root_namespaces.iter().any(|ns| ns.name == namespace)
    }

    pub fn update_condition(&mut self, c: Condition) {
        let status = self.status.get_or_insert_with(TenantStatus::default);
        set_condition(&mut status.conditions, c);
    }

    pub fn set_health(&mut self, health: TenantHealth) {
        self.status.get_or_insert_with(TenantStatus::default).health = Some(health);
    }

    pub fn health(&self) -> Option<TenantHealth> {
        self.status.as_ref().and_then(|s| s.health)
    }
}

/// A sync window of the GitOps project, mirrors the project's own schema.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSyncWindow {
    /// Whether the window allows or blocks syncs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Time the window begins, in cron format.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schedule: String,
    /// How long the window stays open.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub duration: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
    /// Allow manual syncs while the window blocks syncs.
    #[serde(default, skip_serializing_if = "is_false")]
    pub manual_sync: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time_zone: String,
    /// Match applications, namespaces and clusters with AND instead of OR.
    #[serde(default, skip_serializing_if = "is_false")]
    pub and_operator: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Sync windows contributed to the owning tenant's GitOps project.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "tenant.rustrial.org",
    version = "v1beta1",
    kind = "SyncWindow",
    derive = "PartialEq",
    status = "SyncWindowStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Synced",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Synced\")].status",
        "description": "Whether the sync windows were merged into the tenant's project."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct SyncWindowSpec {
    #[schemars(length(min = 1))]
    pub sync_windows: Vec<ProjectSyncWindow>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct SyncWindowStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl SyncWindow {
    pub fn is_synced(&self) -> bool {
        self.status
            .as_ref()
            .map_or(false, |s| is_condition_true(&s.conditions, CONDITION_SYNCED))
    }

    pub fn update_condition(&mut self, c: Condition) {
        let status = self.status.get_or_insert_with(SyncWindowStatus::default);
        set_condition(&mut status.conditions, c);
    }
}
