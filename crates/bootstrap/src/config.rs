use std::time::Duration;

use envconfig::Envconfig;
use keycloak_admin::{AdminClientConfig, AdminCredentials};
use shared::error::CommonError;
use url::Url;

use crate::plan::{ProvisioningDefinitions, UserViewSource};

#[derive(Envconfig, Clone)]
pub struct BootstrapConfig {
    #[envconfig(from = "KEYCLOAK_URL")]
    pub keycloak_url: Url,

    #[envconfig(from = "KEYCLOAK_ADMIN_REALM", default = "master")]
    pub keycloak_admin_realm: String,

    #[envconfig(from = "KEYCLOAK_ADMIN_CLIENT_ID", default = "admin-cli")]
    pub keycloak_admin_client_id: String,

    #[envconfig(from = "KEYCLOAK_ADMIN_CLIENT_SECRET")]
    pub keycloak_admin_client_secret: Option<String>,

    #[envconfig(from = "KEYCLOAK_ADMIN_USERNAME")]
    pub keycloak_admin_username: Option<String>,

    #[envconfig(from = "KEYCLOAK_ADMIN_PASSWORD")]
    pub keycloak_admin_password: Option<String>,

    #[envconfig(from = "KEYCLOAK_REQUEST_TIMEOUT_SECS", default = "10")]
    pub keycloak_request_timeout_secs: u64,

    #[envconfig(
        from = "CONFIG_DB_CONN_STRING",
        default = "libsql://./.data/config.db?mode=local"
    )]
    pub config_db_conn_string: Url,

    /// Database the identity provider persists its tables to
    #[envconfig(from = "USER_VIEW_DB_CONN_STRING")]
    pub user_view_db_conn_string: Url,

    #[envconfig(from = "KEYCLOAK_TABLE_PREFIX", default = "keycloak_")]
    pub keycloak_table_prefix: String,

    #[envconfig(from = "MINIO_CLIENT_SECRET")]
    pub minio_client_secret: String,

    #[envconfig(from = "BOOTSTRAP_DEADLINE_SECS", default = "120")]
    pub bootstrap_deadline_secs: u64,

    #[envconfig(from = "SIGNING_KEY_ALGORITHM", default = "RS256")]
    pub signing_key_algorithm: String,
}

impl std::fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("keycloak_url", &self.keycloak_url.as_str())
            .field("keycloak_admin_realm", &self.keycloak_admin_realm)
            .field("keycloak_admin_client_id", &self.keycloak_admin_client_id)
            .field("keycloak_admin_username", &self.keycloak_admin_username)
            .field("keycloak_request_timeout_secs", &self.keycloak_request_timeout_secs)
            .field("config_db_conn_string", &self.config_db_conn_string.as_str())
            .field("user_view_db_conn_string", &self.user_view_db_conn_string.as_str())
            .field("keycloak_table_prefix", &self.keycloak_table_prefix)
            .field("bootstrap_deadline_secs", &self.bootstrap_deadline_secs)
            .field("signing_key_algorithm", &self.signing_key_algorithm)
            .finish_non_exhaustive()
    }
}

impl BootstrapConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.keycloak_request_timeout_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.bootstrap_deadline_secs)
    }

    /// A client secret takes precedence over username/password.
    pub fn admin_credentials(&self) -> Result<AdminCredentials, CommonError> {
        if let Some(client_secret) = self.keycloak_admin_client_secret.clone() {
            return Ok(AdminCredentials::ClientCredentials { client_secret });
        }

        match (
            self.keycloak_admin_username.clone(),
            self.keycloak_admin_password.clone(),
        ) {
            (Some(username), Some(password)) => Ok(AdminCredentials::Password { username, password }),
            _ => Err(CommonError::InvalidRequest {
                msg: "either KEYCLOAK_ADMIN_CLIENT_SECRET or both KEYCLOAK_ADMIN_USERNAME and KEYCLOAK_ADMIN_PASSWORD must be set".to_string(),
                source: None,
            }),
        }
    }

    pub fn admin_client_config(&self) -> Result<AdminClientConfig, CommonError> {
        Ok(AdminClientConfig {
            base_url: self.keycloak_url.clone(),
            admin_realm: self.keycloak_admin_realm.clone(),
            client_id: self.keycloak_admin_client_id.clone(),
            credentials: self.admin_credentials()?,
            request_timeout: self.request_timeout(),
        })
    }

    pub fn provisioning_definitions(&self) -> ProvisioningDefinitions {
        ProvisioningDefinitions::new(self.minio_client_secret.clone())
            .with_signing_key_algorithm(self.signing_key_algorithm.clone())
            .with_user_view_source(UserViewSource::with_table_prefix(&self.keycloak_table_prefix))
    }
}
