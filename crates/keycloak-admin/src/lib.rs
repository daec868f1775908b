//! Keycloak administration surface used to provision a realm.
//!
//! [`IdentityProviderClient`] is the capability trait the bootstrap code
//! depends on; [`AdminClient`] implements it over the Keycloak admin REST API.

pub mod admin_client;
pub mod client;
pub mod errors;
pub mod types;

pub use admin_client::{AdminClient, AdminClientConfig, AdminCredentials};
pub use client::IdentityProviderClient;
pub use errors::{AdminApiError, ApiError, ApiErrorBody};
pub use types::*;
