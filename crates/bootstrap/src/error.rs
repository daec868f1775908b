use keycloak_admin::AdminApiError;
use shared::error::CommonError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("{resource} '{name}' not found")]
    NotFound { resource: &'static str, name: String },
    #[error("identity provider error")]
    IdentityProvider(#[from] AdminApiError),
    #[error("config store error")]
    Persistence(#[from] CommonError),
    #[error("failed to serialize {what}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("bootstrap did not finish within {0:?}")]
    DeadlineExceeded(std::time::Duration),
    #[error("invalid bootstrap plan: step '{step}' depends on '{dependency}' which does not run before it")]
    InvalidPlan {
        step: &'static str,
        dependency: &'static str,
    },
}

impl BootstrapError {
    pub fn not_found(resource: &'static str, name: impl Into<String>) -> Self {
        BootstrapError::NotFound {
            resource,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BootstrapError::NotFound { .. })
    }
}
