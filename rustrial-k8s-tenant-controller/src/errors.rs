/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// The configured template is not a valid template.
    #[error("failed to parse {0} template: {1}")]
    TemplateParse(&'static str, String),
    /// The template failed while being rendered.
    #[error("failed to render {0} template: {1}")]
    TemplateRender(&'static str, String),
    /// The rendered template is not a valid YAML object.
    #[error("failed to decode rendered {0} template: {1}")]
    TemplateDecode(&'static str, String),
    /// A tenant delegates roles to a tenant which does not exist.
    #[error("delegated tenant {0} does not exist")]
    DelegateNotFound(String),
    /// An object read from or written to the API server lacks mandatory fields.
    #[error("{0}")]
    InvalidObject(String),
    /// Updating the status of some SyncWindow objects failed.
    #[error("failed to update sync window status: {0}")]
    SyncWindowStatus(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl ControllerError {
    /// Configuration errors are not fixed by retrying, they need a change of the
    /// Tenant, its delegates or the controller configuration.
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::TemplateParse(..)
            | ControllerError::TemplateRender(..)
            | ControllerError::TemplateDecode(..)
            | ControllerError::DelegateNotFound(_)
            | ControllerError::InvalidObject(_) => false,
            _ => true,
        }
    }

    pub(crate) fn is_conflict(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_conflict(),
            _ => false,
        }
    }
}
