//! One-time provisioning of the `leafog` realm.
//!
//! [`plan`] describes what gets created and in which order,
//! [`orchestrator`] executes it against an [`keycloak_admin::IdentityProviderClient`]
//! the config store and the identity provider's own database, resuming where
//! an earlier run stopped.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod plan;

pub use config::BootstrapConfig;
pub use error::BootstrapError;
pub use orchestrator::{
    BootstrapOrchestrator, BootstrapOutcome, BootstrapState, ensure_resource, select_signing_key,
};
pub use plan::{
    BOOTSTRAP_PLAN, PlanStep, ProvisioningDefinitions, StepId, UserViewSource, validate_plan,
};
