//! Rendering of the operator supplied RoleBinding and AppProject templates.
//!
//! Templates use Jinja syntax. Undefined variables are errors, use the
//! `default` filter for optional values (e.g. `Roles.admin | default([])`).

use std::collections::BTreeMap;

use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::ControllerError;

/// A tenant which was granted a role, see [`crate::delegation`].
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Role {
    pub name: String,
    pub extra_params: Map<String, Value>,
}

/// Role name to the tenants granted that role, sorted by tenant name.
pub(crate) type Roles = BTreeMap<String, Vec<Role>>;

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct RoleBindingContext<'a> {
    pub name: &'a str,
    pub roles: &'a Roles,
    pub extra_params: &'a Map<String, Value>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AppProjectContext<'a> {
    pub name: &'a str,
    pub namespaces: &'a [String],
    pub roles: &'a Roles,
    pub repositories: &'a [String],
    pub extra_params: &'a Map<String, Value>,
}

pub(crate) struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        Self { env }
    }

    /// Render `template` with `ctx` and decode the output as a YAML object.
    ///
    /// `kind` names the rendered document in error messages.
    pub fn render<C: Serialize>(
        &self,
        kind: &'static str,
        template: &str,
        ctx: &C,
    ) -> Result<Value, ControllerError> {
        let text = self
            .env
            .render_str(template, ctx)
            .map_err(|e| match e.kind() {
                ErrorKind::SyntaxError => ControllerError::TemplateParse(kind, e.to_string()),
                _ => ControllerError::TemplateRender(kind, e.to_string()),
            })?;
        let document: Value = serde_yaml::from_str(text.as_str())
            .map_err(|e| ControllerError::TemplateDecode(kind, e.to_string()))?;
        if document.is_object() {
            Ok(document)
        } else {
            Err(ControllerError::TemplateDecode(
                kind,
                format!("expected a mapping but got {}", document),
            ))
        }
    }
}
