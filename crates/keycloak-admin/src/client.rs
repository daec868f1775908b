use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::errors::AdminApiError;
use crate::types::{
    ClientRepresentation, ClientScopeRepresentation, ManagementPermissionReference,
    PolicyRepresentation, RealmRepresentation, SigningKey, TimePolicyRepresentation,
};

/// Operations the provisioning code needs from the identity provider.
///
/// Every method is exactly one remote request. Nothing is cached or batched,
/// and `find_*` methods return `Ok(None)` rather than `NotFound` when the
/// lookup simply matched nothing.
///
/// `resource_server_id` is the provider-assigned id of the client that owns
/// the authorization settings (the realm-management client).
#[async_trait]
pub trait IdentityProviderClient: Send + Sync {
    async fn get_realm(&self, realm: &str) -> Result<Option<RealmRepresentation>, AdminApiError>;

    async fn realm_exists(&self, realm: &str) -> Result<bool, AdminApiError> {
        Ok(self.get_realm(realm).await?.is_some())
    }

    async fn create_realm(&self, definition: &RealmRepresentation) -> Result<(), AdminApiError>;

    /// Set the given attributes on a realm, leaving other attributes untouched
    async fn update_realm_attributes(
        &self,
        realm: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), AdminApiError>;

    async fn create_client_scope(
        &self,
        realm: &str,
        definition: &ClientScopeRepresentation,
    ) -> Result<(), AdminApiError>;

    async fn find_client_scope_by_name(
        &self,
        realm: &str,
        name: &str,
    ) -> Result<Option<String>, AdminApiError>;

    /// Make a client scope part of the realm's default scopes for new clients
    async fn set_default_client_scope(
        &self,
        realm: &str,
        scope_id: &str,
    ) -> Result<(), AdminApiError>;

    async fn create_client(
        &self,
        realm: &str,
        definition: &ClientRepresentation,
    ) -> Result<(), AdminApiError>;

    async fn find_client_by_client_id(
        &self,
        realm: &str,
        client_id: &str,
    ) -> Result<Option<ClientRepresentation>, AdminApiError>;

    /// Turn on fine-grained admin permissions for a client. Keycloak reacts by
    /// generating one permission per scope, `token-exchange` included.
    async fn enable_client_management_permissions(
        &self,
        realm: &str,
        client_id: &str,
    ) -> Result<ManagementPermissionReference, AdminApiError>;

    async fn create_time_policy(
        &self,
        realm: &str,
        resource_server_id: &str,
        definition: &TimePolicyRepresentation,
    ) -> Result<(), AdminApiError>;

    async fn find_policy_by_name(
        &self,
        realm: &str,
        resource_server_id: &str,
        name: &str,
    ) -> Result<Option<String>, AdminApiError>;

    async fn find_permission_by_name(
        &self,
        realm: &str,
        resource_server_id: &str,
        name: &str,
    ) -> Result<Option<PolicyRepresentation>, AdminApiError>;

    /// Replace the set of policies a permission is decided by
    async fn update_permission_policies(
        &self,
        realm: &str,
        resource_server_id: &str,
        permission: &PolicyRepresentation,
        policy_ids: &[String],
    ) -> Result<(), AdminApiError>;

    /// Public keys published on the realm's JWKS endpoint
    async fn fetch_signing_keys(&self, realm: &str) -> Result<Vec<SigningKey>, AdminApiError>;
}
