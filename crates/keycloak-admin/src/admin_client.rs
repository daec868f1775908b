use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::client::IdentityProviderClient;
use crate::errors::{AdminApiError, ApiError, ApiErrorBody};
use crate::types::{
    CertsResponse, ClientRepresentation, ClientScopeRepresentation, ManagementPermissionReference,
    PolicyRepresentation, RealmRepresentation, SigningKey, TimePolicyRepresentation,
    TokenResponse,
};

/// Tokens are refreshed once they are this close to expiry
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// A lazy wrapper around a reqwest response that deserializes the body on
/// demand and turns non-2xx responses into [`AdminApiError`]s.
pub struct Envelope<T> {
    inner: reqwest::Response,

    _phantom: std::marker::PhantomData<T>,
}

impl<T> Envelope<T>
where
    T: DeserializeOwned,
{
    pub fn status_code(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn url(&self) -> &Url {
        self.inner.url()
    }

    pub async fn into_body(self) -> Result<T, AdminApiError> {
        if !self.status_code().is_success() {
            return Err(self.into_api_error().await);
        }

        let url = self.url().clone();
        let body = self.inner.text().await?;
        debug!("Response from {url}: {body}");
        Ok(serde_json::from_str(&body)?)
    }

    /// Like [`Envelope::into_body`], but `absent` (and an empty body) mean
    /// "no such resource" instead of an error.
    pub async fn into_body_or_none(self, absent: StatusCode) -> Result<Option<T>, AdminApiError> {
        if self.status_code() == absent {
            debug!("Response from {} ({}): treated as absent", self.url(), absent);
            return Ok(None);
        }
        if !self.status_code().is_success() {
            return Err(self.into_api_error().await);
        }

        let body = self.inner.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&body)?))
    }

    pub async fn success_or_error(self) -> Result<StatusCode, AdminApiError> {
        let http_status_code = self.status_code();
        if !http_status_code.is_success() {
            return Err(self.into_api_error().await);
        }
        debug!("Response from {} ({})", self.url(), http_status_code);
        Ok(http_status_code)
    }

    async fn into_api_error(self) -> AdminApiError {
        let http_status_code = self.inner.status();
        let url = self.inner.url().clone();
        let body = match self.inner.text().await {
            Ok(body) => body,
            Err(e) => return AdminApiError::Network(e),
        };
        info!("Response from {} ({})", url, http_status_code);
        info!("  {}", body);

        AdminApiError::from_api_error(ApiError {
            http_status_code,
            url,
            body: ApiErrorBody::from_raw(&body),
        })
    }
}

impl<T> From<reqwest::Response> for Envelope<T> {
    fn from(value: reqwest::Response) -> Self {
        Self {
            inner: value,
            _phantom: Default::default(),
        }
    }
}

/// How the admin client authenticates against the admin realm
#[derive(Clone)]
pub enum AdminCredentials {
    /// Resource-owner password grant, the way `kcadm` and the Java admin
    /// client log in with the bootstrap admin user
    Password { username: String, password: String },
    /// Service-account login of a confidential admin client
    ClientCredentials { client_secret: String },
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminCredentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            AdminCredentials::ClientCredentials { .. } => {
                f.debug_struct("ClientCredentials").finish_non_exhaustive()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdminClientConfig {
    pub base_url: Url,
    pub admin_realm: String,
    pub client_id: String,
    pub credentials: AdminCredentials,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Client for the Keycloak admin REST API.
#[derive(Clone)]
pub struct AdminClient {
    inner: reqwest::Client,
    base_url: Url,
    admin_realm: String,
    client_id: String,
    credentials: AdminCredentials,
    request_timeout: Duration,
    token: Arc<Mutex<Option<AccessToken>>>,
}

impl AdminClient {
    pub fn new(config: AdminClientConfig) -> Result<Self, AdminApiError> {
        if config.base_url.cannot_be_a_base() {
            return Err(AdminApiError::InvalidUrl(config.base_url.to_string()));
        }

        let raw_client = reqwest::Client::builder()
            .user_agent(format!(
                "{}/{} {}-{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH,
            ))
            .connect_timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            inner: raw_client,
            base_url: config.base_url,
            admin_realm: config.admin_realm,
            client_id: config.client_id,
            credentials: config.credentials,
            request_timeout: config.request_timeout,
            token: Arc::new(Mutex::new(None)),
        })
    }

    /// Append percent-encoded path segments to the base url, keeping any
    /// context path (e.g. `/auth`) the base url carries.
    pub fn url<I, S>(&self, path: I) -> Result<Url, AdminApiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AdminApiError::InvalidUrl(self.base_url.to_string()))?;
            segments.pop_if_empty().extend(path);
        }
        Ok(url)
    }

    fn admin_url<I, S>(&self, realm: &str, path: I) -> Result<Url, AdminApiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut segments = vec!["admin".to_string(), "realms".to_string(), realm.to_string()];
        segments.extend(path.into_iter().map(|s| s.as_ref().to_string()));
        self.url(segments)
    }

    fn authz_url(
        &self,
        realm: &str,
        resource_server_id: &str,
        path: &[&str],
    ) -> Result<Url, AdminApiError> {
        let mut segments = vec!["clients", resource_server_id, "authz", "resource-server"];
        segments.extend_from_slice(path);
        self.admin_url(realm, segments)
    }

    async fn access_token(&self) -> Result<String, AdminApiError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref()
            && token.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN
        {
            return Ok(token.value.clone());
        }

        let token_url = self.url([
            "realms",
            self.admin_realm.as_str(),
            "protocol",
            "openid-connect",
            "token",
        ])?;

        let mut form = vec![("client_id", self.client_id.clone())];
        match &self.credentials {
            AdminCredentials::Password { username, password } => {
                form.push(("grant_type", "password".to_string()));
                form.push(("username", username.clone()));
                form.push(("password", password.clone()));
            }
            AdminCredentials::ClientCredentials { client_secret } => {
                form.push(("grant_type", "client_credentials".to_string()));
                form.push(("client_secret", client_secret.clone()));
            }
        }

        let response: TokenResponse = Envelope::from(
            self.inner
                .post(token_url)
                .timeout(self.request_timeout)
                .form(&form)
                .send()
                .await?,
        )
        .into_body()
        .await?;

        debug!(expires_in = response.expires_in, "obtained admin access token");
        *guard = Some(AccessToken {
            value: response.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        });
        Ok(response.access_token)
    }

    /// Prepare an authenticated request builder for the given method and url.
    async fn prepare(
        &self,
        method: reqwest::Method,
        url: Url,
    ) -> Result<reqwest::RequestBuilder, AdminApiError> {
        let token = self.access_token().await?;
        debug!("{method} {url}");
        Ok(self
            .inner
            .request(method, url)
            .timeout(self.request_timeout)
            .bearer_auth(token))
    }

    async fn run<T>(&self, method: reqwest::Method, url: Url) -> Result<Envelope<T>, AdminApiError> {
        let request = self.prepare(method, url).await?;
        Ok(Envelope::from(request.send().await?))
    }

    async fn run_with_body<T, B>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: &B,
    ) -> Result<Envelope<T>, AdminApiError>
    where
        B: Serialize + ?Sized,
    {
        let request = self.prepare(method, url).await?.json(body);
        Ok(Envelope::from(request.send().await?))
    }
}

#[async_trait]
impl IdentityProviderClient for AdminClient {
    async fn get_realm(&self, realm: &str) -> Result<Option<RealmRepresentation>, AdminApiError> {
        let url = self.admin_url(realm, std::iter::empty::<&str>())?;
        self.run(reqwest::Method::GET, url)
            .await?
            .into_body_or_none(StatusCode::NOT_FOUND)
            .await
    }

    async fn create_realm(&self, definition: &RealmRepresentation) -> Result<(), AdminApiError> {
        let url = self.url(["admin", "realms"])?;
        self.run_with_body::<(), _>(reqwest::Method::POST, url, definition)
            .await?
            .success_or_error()
            .await?;
        Ok(())
    }

    async fn update_realm_attributes(
        &self,
        realm: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), AdminApiError> {
        let url = self.admin_url(realm, std::iter::empty::<&str>())?;
        let body = RealmRepresentation {
            realm: realm.to_string(),
            attributes: attributes.clone(),
            ..Default::default()
        };
        self.run_with_body::<(), _>(reqwest::Method::PUT, url, &body)
            .await?
            .success_or_error()
            .await?;
        Ok(())
    }

    async fn create_client_scope(
        &self,
        realm: &str,
        definition: &ClientScopeRepresentation,
    ) -> Result<(), AdminApiError> {
        let url = self.admin_url(realm, ["client-scopes"])?;
        self.run_with_body::<(), _>(reqwest::Method::POST, url, definition)
            .await?
            .success_or_error()
            .await?;
        Ok(())
    }

    async fn find_client_scope_by_name(
        &self,
        realm: &str,
        name: &str,
    ) -> Result<Option<String>, AdminApiError> {
        let url = self.admin_url(realm, ["client-scopes"])?;
        let scopes: Vec<ClientScopeRepresentation> =
            self.run(reqwest::Method::GET, url).await?.into_body().await?;

        Ok(scopes
            .into_iter()
            .find(|scope| scope.name == name)
            .and_then(|scope| scope.id))
    }

    async fn set_default_client_scope(
        &self,
        realm: &str,
        scope_id: &str,
    ) -> Result<(), AdminApiError> {
        let url = self.admin_url(realm, ["default-default-client-scopes", scope_id])?;
        self.run::<()>(reqwest::Method::PUT, url)
            .await?
            .success_or_error()
            .await?;
        Ok(())
    }

    async fn create_client(
        &self,
        realm: &str,
        definition: &ClientRepresentation,
    ) -> Result<(), AdminApiError> {
        let url = self.admin_url(realm, ["clients"])?;
        self.run_with_body::<(), _>(reqwest::Method::POST, url, definition)
            .await?
            .success_or_error()
            .await?;
        Ok(())
    }

    async fn find_client_by_client_id(
        &self,
        realm: &str,
        client_id: &str,
    ) -> Result<Option<ClientRepresentation>, AdminApiError> {
        let mut url = self.admin_url(realm, ["clients"])?;
        url.query_pairs_mut().append_pair("clientId", client_id);
        let clients: Vec<ClientRepresentation> =
            self.run(reqwest::Method::GET, url).await?.into_body().await?;

        // the query parameter is a search, keep the exact match only
        Ok(clients.into_iter().find(|c| c.client_id == client_id))
    }

    async fn enable_client_management_permissions(
        &self,
        realm: &str,
        client_id: &str,
    ) -> Result<ManagementPermissionReference, AdminApiError> {
        let url = self.admin_url(realm, ["clients", client_id, "management", "permissions"])?;
        self.run_with_body(reqwest::Method::PUT, url, &json!({ "enabled": true }))
            .await?
            .into_body()
            .await
    }

    async fn create_time_policy(
        &self,
        realm: &str,
        resource_server_id: &str,
        definition: &TimePolicyRepresentation,
    ) -> Result<(), AdminApiError> {
        let url = self.authz_url(realm, resource_server_id, &["policy", "time"])?;
        self.run_with_body::<(), _>(reqwest::Method::POST, url, definition)
            .await?
            .success_or_error()
            .await?;
        Ok(())
    }

    async fn find_policy_by_name(
        &self,
        realm: &str,
        resource_server_id: &str,
        name: &str,
    ) -> Result<Option<String>, AdminApiError> {
        let mut url = self.authz_url(realm, resource_server_id, &["policy", "search"])?;
        url.query_pairs_mut().append_pair("name", name);
        // Keycloak answers a search without match with 204 No Content
        let policy: Option<PolicyRepresentation> = self
            .run(reqwest::Method::GET, url)
            .await?
            .into_body_or_none(StatusCode::NO_CONTENT)
            .await?;
        Ok(policy.map(|p| p.id))
    }

    async fn find_permission_by_name(
        &self,
        realm: &str,
        resource_server_id: &str,
        name: &str,
    ) -> Result<Option<PolicyRepresentation>, AdminApiError> {
        let mut url = self.authz_url(realm, resource_server_id, &["permission", "search"])?;
        url.query_pairs_mut().append_pair("name", name);
        self.run(reqwest::Method::GET, url)
            .await?
            .into_body_or_none(StatusCode::NO_CONTENT)
            .await
    }

    async fn update_permission_policies(
        &self,
        realm: &str,
        resource_server_id: &str,
        permission: &PolicyRepresentation,
        policy_ids: &[String],
    ) -> Result<(), AdminApiError> {
        let url = self.authz_url(
            realm,
            resource_server_id,
            &["permission", permission.policy_type.as_str(), permission.id.as_str()],
        )?;
        let body = PolicyRepresentation {
            policies: Some(policy_ids.to_vec()),
            ..permission.clone()
        };
        self.run_with_body::<(), _>(reqwest::Method::PUT, url, &body)
            .await?
            .success_or_error()
            .await?;
        Ok(())
    }

    async fn fetch_signing_keys(&self, realm: &str) -> Result<Vec<SigningKey>, AdminApiError> {
        // the JWKS endpoint is public, no admin token
        let url = self.url(["realms", realm, "protocol", "openid-connect", "certs"])?;
        let certs: CertsResponse = Envelope::from(
            self.inner
                .get(url)
                .timeout(self.request_timeout)
                .send()
                .await?,
        )
        .into_body()
        .await?;
        Ok(certs.keys)
    }
}
