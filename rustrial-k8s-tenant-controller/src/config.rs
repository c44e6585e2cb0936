use std::{collections::BTreeMap, path::Path};

use anyhow::{anyhow, Context};
use serde::Deserialize;

/// Default location of the configuration file, overridden by `CONFIG_FILE`.
pub(crate) const DEFAULT_CONFIG_FILE: &'static str = "/etc/tenant-controller/config.yaml";

/// The controller configuration file.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default)]
    pub namespace: NamespaceConfig,
    #[serde(default)]
    pub argocd: ArgoCdConfig,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(crate) struct NamespaceConfig {
    /// Labels added to every root namespace.
    #[serde(default)]
    pub common_labels: BTreeMap<String, String>,
    /// Annotations added to every root namespace.
    #[serde(default)]
    pub common_annotations: BTreeMap<String, String>,
    /// Template of the administrator RoleBinding created in each root namespace.
    #[serde(default)]
    pub role_binding_template: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(crate) struct ArgoCdConfig {
    /// Namespace of the GitOps controller, home of the projects and sharding ConfigMaps.
    #[serde(default)]
    pub namespace: String,
    /// Template of the per-tenant project.
    #[serde(default)]
    pub app_project_template: String,
}

impl Config {
    pub fn parse(data: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(data.as_str())
            .with_context(|| format!("unable to load the configuration file {}", path.display()))
    }

    /// Validate the configuration, reporting all violations at once.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors: Vec<String> = Default::default();
        for (k, v) in &self.namespace.common_labels {
            if let Err(e) = validate_qualified_name(k) {
                errors.push(format!("namespace.commonLabels: invalid key {:?}: {}", k, e));
            }
            if let Err(e) = validate_label_value(v) {
                errors.push(format!("namespace.commonLabels: invalid value {:?}: {}", v, e));
            }
        }
        for k in self.namespace.common_annotations.keys() {
            if let Err(e) = validate_qualified_name(k) {
                errors.push(format!("namespace.commonAnnotations: invalid key {:?}: {}", k, e));
            }
        }
        if self.namespace.role_binding_template.trim().is_empty() {
            errors.push("namespace.roleBindingTemplate: should not be empty".to_string());
        }
        if let Err(e) = validate_dns1123_subdomain(&self.argocd.namespace) {
            errors.push(format!(
                "argocd.namespace: invalid value {:?}: {}",
                self.argocd.namespace, e
            ));
        }
        if self.argocd.app_project_template.trim().is_empty() {
            errors.push("argocd.appProjectTemplate: should not be empty".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid configuration: [{}]", errors.join(", ")))
        }
    }
}

fn is_alphanumeric(c: char) -> bool {
    c.is_ascii_alphanumeric()
}

/// `[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?` with at most 63 characters.
fn validate_name_part(v: &str) -> Result<(), String> {
    if v.is_empty() {
        return Err("must not be empty".to_string());
    }
    if v.len() > 63 {
        return Err("must be no more than 63 characters".to_string());
    }
    let first = v.chars().next().map_or(false, is_alphanumeric);
    let last = v.chars().last().map_or(false, is_alphanumeric);
    let body = v
        .chars()
        .all(|c| is_alphanumeric(c) || c == '-' || c == '_' || c == '.');
    if first && last && body {
        Ok(())
    } else {
        Err("must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character".to_string())
    }
}

fn validate_dns1123_subdomain(v: &str) -> Result<(), String> {
    if v.is_empty() {
        return Err("must not be empty".to_string());
    }
    if v.len() > 253 {
        return Err("must be no more than 253 characters".to_string());
    }
    for label in v.split('.') {
        let valid = !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err("must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character".to_string());
        }
    }
    Ok(())
}

fn validate_qualified_name(v: &str) -> Result<(), String> {
    let mut parts = v.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(name), None) => validate_name_part(name),
        (Some(prefix), Some(name)) => {
            validate_dns1123_subdomain(prefix).map_err(|e| format!("prefix {}", e))?;
            validate_name_part(name)
        }
        _ => Err("must not be empty".to_string()),
    }
}

fn validate_label_value(v: &str) -> Result<(), String> {
    if v.is_empty() {
        Ok(())
    } else {
        validate_name_part(v)
    }
}
