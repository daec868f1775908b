use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use config_store::{ConfigEntryRepositoryLike, RawStatementExecutor};
use keycloak_admin::{AdminApiError, IdentityProviderClient, SigningKey};
use tracing::{debug, info, warn};

use crate::error::BootstrapError;
use crate::plan::{
    BOOTSTRAP_COMPLETED_ATTRIBUTE, BOOTSTRAP_COMPLETED_VALUE, BOOTSTRAP_PLAN, PGRST_JWT_SECRET_KEY,
    PlanStep, ProvisioningDefinitions, StepId, token_exchange_permission_name, validate_plan,
};

/// Where the target realm stands, as far as the identity provider tells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NotBootstrapped,
    /// The realm exists but the completion marker was never written
    PartiallyBootstrapped,
    Bootstrapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Nothing was written
    AlreadyBootstrapped,
    Bootstrapped,
    /// A previous run stopped half-way and this one finished it
    Resumed,
}

/// Find a resource, create it when absent, and find it again.
///
/// Creation endpoints do not return the created resource, so the value
/// always comes from a lookup. A resource that is still missing after a
/// successful create is reported as [`BootstrapError::NotFound`].
pub async fn ensure_resource<T, L, LF, C, CF>(
    resource: &'static str,
    name: &str,
    lookup: L,
    create: C,
) -> Result<T, BootstrapError>
where
    L: Fn() -> LF,
    LF: Future<Output = Result<Option<T>, AdminApiError>>,
    C: FnOnce() -> CF,
    CF: Future<Output = Result<(), AdminApiError>>,
{
    if let Some(existing) = lookup().await? {
        debug!(resource, name, "already exists");
        return Ok(existing);
    }

    create().await?;
    info!(resource, name, "created");

    lookup()
        .await?
        .ok_or_else(|| BootstrapError::not_found(resource, name))
}

/// Pick the first key whose `alg` matches.
pub fn select_signing_key<'a>(
    keys: &'a [SigningKey],
    algorithm: &str,
) -> Result<&'a SigningKey, BootstrapError> {
    keys.iter()
        .find(|key| key.alg == algorithm)
        .ok_or_else(|| BootstrapError::not_found("signing key", algorithm))
}

/// Values produced by earlier steps and consumed by later ones
#[derive(Debug, Default)]
struct StepOutputs {
    client_scope_id: Option<String>,
    client_id: Option<String>,
    resource_server_id: Option<String>,
    policy_id: Option<String>,
}

fn require<'a>(
    value: &'a Option<String>,
    step: StepId,
    dependency: StepId,
) -> Result<&'a str, BootstrapError> {
    value.as_deref().ok_or(BootstrapError::InvalidPlan {
        step: step.as_str(),
        dependency: dependency.as_str(),
    })
}

/// Runs the bootstrap plan against the identity provider, the config store
/// and the relational store holding the identity provider's tables.
///
/// Holds no state of its own between runs: whether work is left to do is
/// always decided from what the identity provider reports.
pub struct BootstrapOrchestrator<I, S, V> {
    identity_provider: I,
    store: S,
    relational_store: V,
    definitions: ProvisioningDefinitions,
    plan: &'static [PlanStep],
}

impl<I, S, V> BootstrapOrchestrator<I, S, V>
where
    I: IdentityProviderClient,
    S: ConfigEntryRepositoryLike,
    V: RawStatementExecutor,
{
    pub fn new(
        identity_provider: I,
        store: S,
        relational_store: V,
        definitions: ProvisioningDefinitions,
    ) -> Self {
        Self {
            identity_provider,
            store,
            relational_store,
            definitions,
            plan: BOOTSTRAP_PLAN,
        }
    }

    pub fn identity_provider(&self) -> &I {
        &self.identity_provider
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn relational_store(&self) -> &V {
        &self.relational_store
    }

    pub async fn detect_state(&self) -> Result<BootstrapState, BootstrapError> {
        let realm = self
            .identity_provider
            .get_realm(self.definitions.realm_name())
            .await?;

        Ok(match realm {
            None => BootstrapState::NotBootstrapped,
            Some(realm)
                if realm
                    .attributes
                    .get(BOOTSTRAP_COMPLETED_ATTRIBUTE)
                    .is_some_and(|v| v == BOOTSTRAP_COMPLETED_VALUE) =>
            {
                BootstrapState::Bootstrapped
            }
            Some(_) => BootstrapState::PartiallyBootstrapped,
        })
    }

    pub async fn run(&self) -> Result<BootstrapOutcome, BootstrapError> {
        validate_plan(self.plan)?;
        let realm = self.definitions.realm_name();

        let state = self.detect_state().await?;
        match state {
            BootstrapState::Bootstrapped => {
                info!(realm, "realm already bootstrapped, nothing to do");
                return Ok(BootstrapOutcome::AlreadyBootstrapped);
            }
            BootstrapState::PartiallyBootstrapped => {
                warn!(realm, "realm exists without completion marker, resuming bootstrap");
            }
            BootstrapState::NotBootstrapped => {
                info!(realm, "bootstrapping realm");
            }
        }

        let mut outputs = StepOutputs::default();
        for step in self.plan {
            info!(step = %step.id, "starting bootstrap step");
            self.execute_step(step.id, &mut outputs).await?;
            info!(step = %step.id, "finished bootstrap step");
        }

        Ok(match state {
            BootstrapState::PartiallyBootstrapped => BootstrapOutcome::Resumed,
            _ => BootstrapOutcome::Bootstrapped,
        })
    }

    /// [`BootstrapOrchestrator::run`] bounded by an overall deadline.
    /// Steps already applied when the deadline hits stay applied.
    pub async fn run_with_deadline(
        &self,
        deadline: Duration,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        tokio::time::timeout(deadline, self.run())
            .await
            .map_err(|_| BootstrapError::DeadlineExceeded(deadline))?
    }

    async fn execute_step(
        &self,
        step: StepId,
        outputs: &mut StepOutputs,
    ) -> Result<(), BootstrapError> {
        let idp = &self.identity_provider;
        let defs = &self.definitions;
        let realm = defs.realm_name();

        match step {
            StepId::CreateRealm => {
                ensure_resource(
                    "realm",
                    realm,
                    || idp.get_realm(realm),
                    || idp.create_realm(&defs.realm),
                )
                .await?;
            }
            StepId::CreateUserView => {
                self.relational_store
                    .execute_raw_statement(&defs.user_view_sql)
                    .await?;
                info!(view = %defs.user_view_source.view_name, "user view created");
            }
            StepId::CreateClientScope => {
                let name = defs.client_scope.name.as_str();
                let id = ensure_resource(
                    "client scope",
                    name,
                    || idp.find_client_scope_by_name(realm, name),
                    || idp.create_client_scope(realm, &defs.client_scope),
                )
                .await?;
                outputs.client_scope_id = Some(id);
            }
            StepId::SetDefaultClientScope => {
                let scope_id = require(&outputs.client_scope_id, step, StepId::CreateClientScope)?;
                idp.set_default_client_scope(realm, scope_id).await?;
            }
            StepId::CreateClient => {
                let client_id = defs.client.client_id.as_str();
                let client = ensure_resource(
                    "client",
                    client_id,
                    || idp.find_client_by_client_id(realm, client_id),
                    || idp.create_client(realm, &defs.client),
                )
                .await?;
                let id = client
                    .id
                    .ok_or_else(|| BootstrapError::not_found("client id", client_id))?;
                outputs.client_id = Some(id);
            }
            StepId::EnableClientPermissions => {
                let client_id = require(&outputs.client_id, step, StepId::CreateClient)?;
                let reference = idp
                    .enable_client_management_permissions(realm, client_id)
                    .await?;
                debug!(
                    scopes = ?reference.scope_permissions.keys().collect::<Vec<_>>(),
                    "client management permissions enabled"
                );
            }
            StepId::CreateTimePolicy => {
                let rm_client_id = defs.realm_management_client_id.as_str();
                let resource_server_id = idp
                    .find_client_by_client_id(realm, rm_client_id)
                    .await?
                    .and_then(|client| client.id)
                    .ok_or_else(|| BootstrapError::not_found("client", rm_client_id))?;

                let name = defs.time_policy.name.as_str();
                let policy_id = ensure_resource(
                    "policy",
                    name,
                    || idp.find_policy_by_name(realm, &resource_server_id, name),
                    || idp.create_time_policy(realm, &resource_server_id, &defs.time_policy),
                )
                .await?;

                outputs.resource_server_id = Some(resource_server_id);
                outputs.policy_id = Some(policy_id);
            }
            StepId::AttachTokenExchangePolicy => {
                let client_id = require(&outputs.client_id, step, StepId::EnableClientPermissions)?;
                let resource_server_id =
                    require(&outputs.resource_server_id, step, StepId::CreateTimePolicy)?;
                let policy_id = require(&outputs.policy_id, step, StepId::CreateTimePolicy)?;

                let name = token_exchange_permission_name(client_id);
                let permission = idp
                    .find_permission_by_name(realm, resource_server_id, &name)
                    .await?
                    .ok_or_else(|| BootstrapError::not_found("permission", name.as_str()))?;

                // the search endpoint omits associated policies, so the set is
                // always replaced
                idp.update_permission_policies(
                    realm,
                    resource_server_id,
                    &permission,
                    &[policy_id.to_string()],
                )
                .await?;
            }
            StepId::SyncSigningKey => {
                self.sync_signing_key().await?;
            }
            StepId::MarkCompleted => {
                let attributes = BTreeMap::from([(
                    BOOTSTRAP_COMPLETED_ATTRIBUTE.to_string(),
                    BOOTSTRAP_COMPLETED_VALUE.to_string(),
                )]);
                idp.update_realm_attributes(realm, &attributes).await?;
            }
        }

        Ok(())
    }

    /// Copy the realm's public signing key into the config store, where the
    /// gateway picks it up to verify tokens.
    async fn sync_signing_key(&self) -> Result<(), BootstrapError> {
        let keys = self
            .identity_provider
            .fetch_signing_keys(self.definitions.realm_name())
            .await?;
        let key = select_signing_key(&keys, &self.definitions.signing_key_algorithm)?;
        debug!(kid = %key.kid, alg = %key.alg, "selected signing key");

        let serialized = serde_json::to_string(key).map_err(|source| {
            BootstrapError::Serialization {
                what: "signing key",
                source,
            }
        })?;

        let entries = BTreeMap::from([(PGRST_JWT_SECRET_KEY.to_string(), serialized)]);
        config_store::upsert_all(&self.store, &entries).await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use async_trait::async_trait;
    use config_store::{ConfigEntry, Repository, SqlStatementExecutor, list_config_entries};
    use http::StatusCode;
    use keycloak_admin::{
        ApiError, ApiErrorBody, ClientRepresentation, ClientScopeRepresentation,
        ManagementPermissionReference, PolicyRepresentation, RealmRepresentation,
        TimePolicyRepresentation,
    };
    use shared::error::CommonError;
    use shared::primitives::SqlMigrationLoader;
    use shared::test_utils::repository::setup_in_memory_database;
    use std::sync::Mutex;
    use url::Url;

    const MUTATING_CALLS: &[&str] = &[
        "create_realm",
        "update_realm_attributes",
        "create_client_scope",
        "set_default_client_scope",
        "create_client",
        "enable_client_management_permissions",
        "create_time_policy",
        "update_permission_policies",
    ];

    #[derive(Default)]
    struct FakeState {
        realm: Option<RealmRepresentation>,
        scopes: Vec<ClientScopeRepresentation>,
        default_scopes: Vec<String>,
        clients: Vec<ClientRepresentation>,
        policies: Vec<PolicyRepresentation>,
        permissions: Vec<PolicyRepresentation>,
        keys: Vec<SigningKey>,
        calls: Vec<String>,
        next_id: usize,
        // created scopes never show up in lookups
        hide_created_scopes: bool,
        conflict_on_create_client: bool,
        realm_lookup_delay: Option<Duration>,
    }

    impl FakeState {
        fn id(&mut self, prefix: &str) -> String {
            self.next_id += 1;
            format!("{prefix}-{}", self.next_id)
        }
    }

    /// In-memory identity provider that records every call it receives
    #[derive(Default)]
    struct FakeIdentityProvider {
        state: Mutex<FakeState>,
    }

    impl FakeIdentityProvider {
        fn with_realm_management() -> Self {
            let fake = Self::default();
            {
                let mut state = fake.state.lock().unwrap();
                state.clients.push(ClientRepresentation {
                    id: Some("rm-id".into()),
                    client_id: "realm-management".into(),
                    ..Default::default()
                });
                state.keys = vec![
                    key("enc-1", "RSA-OAEP"),
                    key("ec-1", "ES256"),
                    key("k1", "RS256"),
                ];
            }
            fake
        }

        fn record(&self, call: &str) -> std::sync::MutexGuard<'_, FakeState> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.to_string());
            state
        }

        fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn mutating_calls(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| MUTATING_CALLS.contains(&c.as_str()))
                .collect()
        }

        fn position(&self, call: &str) -> Option<usize> {
            self.calls().iter().position(|c| c == call)
        }
    }

    fn key(kid: &str, alg: &str) -> SigningKey {
        SigningKey {
            kid: kid.into(),
            kty: "RSA".into(),
            alg: alg.into(),
            use_: "sig".into(),
            n: format!("n-{kid}"),
            e: "AQAB".into(),
        }
    }

    #[async_trait]
    impl IdentityProviderClient for FakeIdentityProvider {
        async fn get_realm(
            &self,
            realm: &str,
        ) -> Result<Option<RealmRepresentation>, AdminApiError> {
            let (found, delay) = {
                let state = self.record("get_realm");
                (
                    state.realm.clone().filter(|r| r.realm == realm),
                    state.realm_lookup_delay,
                )
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(found)
        }

        async fn create_realm(&self, definition: &RealmRepresentation) -> Result<(), AdminApiError> {
            let mut state = self.record("create_realm");
            let id = state.id("realm");
            state.realm = Some(RealmRepresentation {
                id: Some(id),
                ..definition.clone()
            });
            Ok(())
        }

        async fn update_realm_attributes(
            &self,
            _realm: &str,
            attributes: &BTreeMap<String, String>,
        ) -> Result<(), AdminApiError> {
            let mut state = self.record("update_realm_attributes");
            if let Some(realm) = state.realm.as_mut() {
                realm.attributes.extend(attributes.clone());
            }
            Ok(())
        }

        async fn create_client_scope(
            &self,
            _realm: &str,
            definition: &ClientScopeRepresentation,
        ) -> Result<(), AdminApiError> {
            let mut state = self.record("create_client_scope");
            if !state.hide_created_scopes {
                let id = state.id("scope");
                state.scopes.push(ClientScopeRepresentation {
                    id: Some(id),
                    ..definition.clone()
                });
            }
            Ok(())
        }

        async fn find_client_scope_by_name(
            &self,
            _realm: &str,
            name: &str,
        ) -> Result<Option<String>, AdminApiError> {
            let state = self.record("find_client_scope_by_name");
            Ok(state
                .scopes
                .iter()
                .find(|s| s.name == name)
                .and_then(|s| s.id.clone()))
        }

        async fn set_default_client_scope(
            &self,
            _realm: &str,
            scope_id: &str,
        ) -> Result<(), AdminApiError> {
            let mut state = self.record("set_default_client_scope");
            state.default_scopes.push(scope_id.to_string());
            Ok(())
        }

        async fn create_client(
            &self,
            _realm: &str,
            definition: &ClientRepresentation,
        ) -> Result<(), AdminApiError> {
            let mut state = self.record("create_client");
            if state.conflict_on_create_client {
                return Err(AdminApiError::Conflict(Box::new(ApiError {
                    http_status_code: StatusCode::CONFLICT,
                    url: Url::parse("http://keycloak/admin/realms/leafog/clients").unwrap(),
                    body: ApiErrorBody::from_raw(r#"{"errorMessage":"Client minio already exists"}"#),
                })));
            }
            let id = state.id("client");
            state.clients.push(ClientRepresentation {
                id: Some(id),
                ..definition.clone()
            });
            Ok(())
        }

        async fn find_client_by_client_id(
            &self,
            _realm: &str,
            client_id: &str,
        ) -> Result<Option<ClientRepresentation>, AdminApiError> {
            let state = self.record("find_client_by_client_id");
            Ok(state
                .clients
                .iter()
                .find(|c| c.client_id == client_id)
                .cloned())
        }

        async fn enable_client_management_permissions(
            &self,
            _realm: &str,
            client_id: &str,
        ) -> Result<ManagementPermissionReference, AdminApiError> {
            let mut state = self.record("enable_client_management_permissions");
            let name = token_exchange_permission_name(client_id);
            if !state.permissions.iter().any(|p| p.name == name) {
                let id = state.id("permission");
                state.permissions.push(PolicyRepresentation {
                    id,
                    name,
                    policy_type: "scope".into(),
                    ..Default::default()
                });
            }
            let permission_id = state
                .permissions
                .iter()
                .find(|p| p.name == token_exchange_permission_name(client_id))
                .map(|p| p.id.clone())
                .unwrap();
            Ok(ManagementPermissionReference {
                enabled: true,
                resource: Some(client_id.to_string()),
                scope_permissions: BTreeMap::from([("token-exchange".to_string(), permission_id)]),
            })
        }

        async fn create_time_policy(
            &self,
            _realm: &str,
            _resource_server_id: &str,
            definition: &TimePolicyRepresentation,
        ) -> Result<(), AdminApiError> {
            let mut state = self.record("create_time_policy");
            let id = state.id("policy");
            state.policies.push(PolicyRepresentation {
                id,
                name: definition.name.clone(),
                policy_type: definition.policy_type.clone(),
                ..Default::default()
            });
            Ok(())
        }

        async fn find_policy_by_name(
            &self,
            _realm: &str,
            _resource_server_id: &str,
            name: &str,
        ) -> Result<Option<String>, AdminApiError> {
            let state = self.record("find_policy_by_name");
            Ok(state
                .policies
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.id.clone()))
        }

        async fn find_permission_by_name(
            &self,
            _realm: &str,
            _resource_server_id: &str,
            name: &str,
        ) -> Result<Option<PolicyRepresentation>, AdminApiError> {
            let state = self.record("find_permission_by_name");
            Ok(state.permissions.iter().find(|p| p.name == name).cloned())
        }

        async fn update_permission_policies(
            &self,
            _realm: &str,
            _resource_server_id: &str,
            permission: &PolicyRepresentation,
            policy_ids: &[String],
        ) -> Result<(), AdminApiError> {
            let mut state = self.record("update_permission_policies");
            // a permission can only reference policies that exist
            for policy_id in policy_ids {
                assert!(state.policies.iter().any(|p| &p.id == policy_id));
            }
            if let Some(existing) = state.permissions.iter_mut().find(|p| p.id == permission.id) {
                existing.policies = Some(policy_ids.to_vec());
            }
            Ok(())
        }

        async fn fetch_signing_keys(&self, _realm: &str) -> Result<Vec<SigningKey>, AdminApiError> {
            let state = self.record("fetch_signing_keys");
            Ok(state.keys.clone())
        }
    }

    /// Config store backed by in-memory libsql
    struct TestStore {
        repository: Repository,
        _db: libsql::Database,
    }

    impl TestStore {
        async fn new() -> Self {
            let (db, conn) = setup_in_memory_database(vec![Repository::load_sql_migrations()])
                .await
                .unwrap();
            Self {
                repository: Repository::new(conn),
                _db: db,
            }
        }

        async fn entries(&self) -> Vec<ConfigEntry> {
            list_config_entries(&self.repository).await.unwrap()
        }
    }

    /// Records raw statements instead of executing them
    #[derive(Default)]
    struct RecordingExecutor {
        statements: Mutex<Vec<String>>,
    }

    impl RecordingExecutor {
        fn statement_count(&self) -> usize {
            self.statements.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ConfigEntryRepositoryLike for TestStore {
        async fn get_config_entry_by_key(&self, key: &str) -> Result<Option<ConfigEntry>, CommonError> {
            self.repository.get_config_entry_by_key(key).await
        }

        async fn get_config_entries(&self) -> Result<Vec<ConfigEntry>, CommonError> {
            self.repository.get_config_entries().await
        }

        async fn upsert_config_entries(
            &self,
            params: &[config_store::repository::UpsertConfigEntry],
        ) -> Result<(), CommonError> {
            self.repository.upsert_config_entries(params).await
        }

        async fn update_config_entry_with<F>(
            &self,
            key: &str,
            transform: F,
        ) -> Result<ConfigEntry, CommonError>
        where
            F: FnOnce(Option<String>) -> String + Send,
        {
            self.repository.update_config_entry_with(key, transform).await
        }
    }

    #[async_trait]
    impl RawStatementExecutor for RecordingExecutor {
        async fn execute_raw_statement(&self, sql: &str) -> Result<(), CommonError> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(())
        }
    }

    async fn orchestrator(
        idp: FakeIdentityProvider,
    ) -> BootstrapOrchestrator<FakeIdentityProvider, TestStore, RecordingExecutor> {
        BootstrapOrchestrator::new(
            idp,
            TestStore::new().await,
            RecordingExecutor::default(),
            ProvisioningDefinitions::new("minio-secret"),
        )
    }

    #[tokio::test]
    async fn test_fresh_realm_is_fully_bootstrapped() {
        shared::setup_test!();
        let orchestrator = orchestrator(FakeIdentityProvider::with_realm_management()).await;

        let outcome = orchestrator.run().await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Bootstrapped);

        let idp = orchestrator.identity_provider();
        let state = idp.state.lock().unwrap();
        let realm = state.realm.as_ref().unwrap();
        assert_eq!(realm.attributes[BOOTSTRAP_COMPLETED_ATTRIBUTE], "true");
        assert_eq!(state.clients[1].secret.as_deref(), Some("minio-secret"));

        // the default scope id is the one the post-create lookup returned
        let scope_id = state.scopes[0].id.clone().unwrap();
        assert_eq!(state.default_scopes, vec![scope_id]);

        let permission = &state.permissions[0];
        let client_id = state.clients[1].id.clone().unwrap();
        assert_eq!(permission.name, token_exchange_permission_name(&client_id));
        assert_eq!(permission.policies, Some(vec![state.policies[0].id.clone()]));
        drop(state);

        assert_eq!(orchestrator.relational_store().statement_count(), 1);
        let entries = orchestrator.store().entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, PGRST_JWT_SECRET_KEY);
        let stored: serde_json::Value = serde_json::from_str(&entries[0].value).unwrap();
        assert_eq!(
            stored,
            serde_json::json!({"kid": "k1", "kty": "RSA", "alg": "RS256", "use": "sig", "n": "n-k1", "e": "AQAB"})
        );
    }

    #[tokio::test]
    async fn test_permission_update_happens_after_client_and_policy() {
        shared::setup_test!();
        let orchestrator = orchestrator(FakeIdentityProvider::with_realm_management()).await;
        orchestrator.run().await.unwrap();

        let idp = orchestrator.identity_provider();
        let update = idp.position("update_permission_policies").unwrap();
        assert!(idp.position("create_client").unwrap() < update);
        assert!(idp.position("create_time_policy").unwrap() < update);
        assert!(idp.position("enable_client_management_permissions").unwrap() < update);
        assert!(idp.position("create_client_scope").unwrap() < idp.position("set_default_client_scope").unwrap());
        assert_eq!(
            idp.mutating_calls().last().map(String::as_str),
            Some("update_realm_attributes")
        );
    }

    #[tokio::test]
    async fn test_second_run_performs_no_writes() {
        shared::setup_test!();
        let orchestrator = orchestrator(FakeIdentityProvider::with_realm_management()).await;
        orchestrator.run().await.unwrap();

        let mutating_before = orchestrator.identity_provider().mutating_calls().len();
        let entries_before = orchestrator.store().entries().await;

        let outcome = orchestrator.run().await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::AlreadyBootstrapped);
        assert_eq!(orchestrator.identity_provider().mutating_calls().len(), mutating_before);
        assert_eq!(orchestrator.store().entries().await, entries_before);
        assert_eq!(orchestrator.relational_store().statement_count(), 1);
        assert_eq!(
            orchestrator.detect_state().await.unwrap(),
            BootstrapState::Bootstrapped
        );
    }

    #[tokio::test]
    async fn test_no_matching_signing_key_writes_nothing() {
        shared::setup_test!();
        let idp = FakeIdentityProvider::with_realm_management();
        idp.state.lock().unwrap().keys = vec![key("ec-1", "ES256")];
        let orchestrator = orchestrator(idp).await;

        let err = orchestrator.run().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(orchestrator.store().entries().await.is_empty());
        // not marked complete, the next run resumes
        assert_eq!(
            orchestrator.detect_state().await.unwrap(),
            BootstrapState::PartiallyBootstrapped
        );
    }

    #[tokio::test]
    async fn test_scope_missing_after_create_stops_the_plan() {
        shared::setup_test!();
        let idp = FakeIdentityProvider::with_realm_management();
        idp.state.lock().unwrap().hide_created_scopes = true;
        let orchestrator = orchestrator(idp).await;

        match orchestrator.run().await.unwrap_err() {
            BootstrapError::NotFound { resource, name } => {
                assert_eq!(resource, "client scope");
                assert_eq!(name, "minio");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let idp = orchestrator.identity_provider();
        assert!(idp.position("create_client_scope").is_some());
        assert!(idp.position("set_default_client_scope").is_none());
        assert!(idp.position("create_client").is_none());
        assert!(idp.position("enable_client_management_permissions").is_none());
        assert!(idp.position("update_permission_policies").is_none());
        assert!(orchestrator.store().entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_realm_is_resumed() {
        shared::setup_test!();
        let idp = FakeIdentityProvider::with_realm_management();
        {
            let mut state = idp.state.lock().unwrap();
            state.realm = Some(RealmRepresentation {
                id: Some("realm-0".into()),
                realm: "leafog".into(),
                enabled: Some(true),
                ..Default::default()
            });
            state.scopes.push(ClientScopeRepresentation {
                id: Some("scope-0".into()),
                name: "minio".into(),
                ..Default::default()
            });
        }
        let orchestrator = orchestrator(idp).await;

        assert_eq!(
            orchestrator.detect_state().await.unwrap(),
            BootstrapState::PartiallyBootstrapped
        );
        let outcome = orchestrator.run().await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Resumed);

        let idp = orchestrator.identity_provider();
        assert!(idp.position("create_realm").is_none());
        assert!(idp.position("create_client_scope").is_none());
        assert!(idp.position("create_client").is_some());
        assert_eq!(idp.state.lock().unwrap().default_scopes, vec!["scope-0".to_string()]);
        assert_eq!(
            orchestrator.detect_state().await.unwrap(),
            BootstrapState::Bootstrapped
        );
        assert_eq!(orchestrator.store().entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_realm_management_client_is_not_found() {
        shared::setup_test!();
        let idp = FakeIdentityProvider::with_realm_management();
        idp.state.lock().unwrap().clients.clear();
        let orchestrator = orchestrator(idp).await;

        match orchestrator.run().await.unwrap_err() {
            BootstrapError::NotFound { resource, name } => {
                assert_eq!(resource, "client");
                assert_eq!(name, "realm-management");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(orchestrator.identity_provider().position("create_time_policy").is_none());
    }

    #[tokio::test]
    async fn test_provider_error_aborts_remaining_steps() {
        shared::setup_test!();
        let idp = FakeIdentityProvider::with_realm_management();
        idp.state.lock().unwrap().conflict_on_create_client = true;
        let orchestrator = orchestrator(idp).await;

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::IdentityProvider(AdminApiError::Conflict(_))
        ));
        let idp = orchestrator.identity_provider();
        assert!(idp.position("enable_client_management_permissions").is_none());
        assert!(idp.position("fetch_signing_keys").is_none());
    }

    #[tokio::test]
    async fn test_user_view_runs_on_relational_store_not_config_store() {
        shared::setup_test!();
        // identity provider tables live in their own database
        let (_relational_db, relational_conn) = setup_in_memory_database(vec![]).await.unwrap();
        relational_conn
            .execute_batch(
                "CREATE TABLE keycloak_realm (id TEXT PRIMARY KEY, name TEXT);
                 CREATE TABLE keycloak_user_entity (
                     id TEXT PRIMARY KEY, realm_id TEXT, username TEXT, first_name TEXT,
                     last_name TEXT, email TEXT, email_verified INTEGER,
                     created_timestamp INTEGER, enabled INTEGER);
                 CREATE TABLE keycloak_user_attribute (user_id TEXT, name TEXT, value TEXT);",
            )
            .await
            .unwrap();
        let orchestrator = BootstrapOrchestrator::new(
            FakeIdentityProvider::with_realm_management(),
            TestStore::new().await,
            SqlStatementExecutor::new(relational_conn),
            ProvisioningDefinitions::new("minio-secret"),
        );

        orchestrator.run().await.unwrap();

        let view_exists = |conn: libsql::Connection| async move {
            let mut rows = conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type = 'view' AND name = 'auth_user'",
                    (),
                )
                .await
                .unwrap();
            rows.next().await.unwrap().is_some()
        };
        assert!(view_exists(orchestrator.relational_store().connection().0.clone()).await);
        assert!(!view_exists(orchestrator.store().repository.connection().0.clone()).await);
    }

    #[tokio::test]
    async fn test_missing_identity_tables_stop_the_plan() {
        shared::setup_test!();
        let (_relational_db, relational_conn) = setup_in_memory_database(vec![]).await.unwrap();
        let orchestrator = BootstrapOrchestrator::new(
            FakeIdentityProvider::with_realm_management(),
            TestStore::new().await,
            SqlStatementExecutor::new(relational_conn),
            ProvisioningDefinitions::new("minio-secret"),
        );

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, BootstrapError::Persistence(_)));

        let idp = orchestrator.identity_provider();
        assert!(idp.position("create_realm").is_some());
        assert!(idp.position("create_client_scope").is_none());
        assert_eq!(
            orchestrator.detect_state().await.unwrap(),
            BootstrapState::PartiallyBootstrapped
        );
    }

    #[tokio::test]
    async fn test_resumed_run_replaces_permission_policies() {
        shared::setup_test!();
        let orchestrator = orchestrator(FakeIdentityProvider::with_realm_management()).await;
        orchestrator.run().await.unwrap();

        // drop the completion marker so the next run walks the plan again
        {
            let mut state = orchestrator.identity_provider().state.lock().unwrap();
            if let Some(realm) = state.realm.as_mut() {
                realm.attributes.clear();
            }
            state.calls.clear();
        }

        let outcome = orchestrator.run().await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Resumed);

        let idp = orchestrator.identity_provider();
        assert!(idp.position("update_permission_policies").is_some());
        assert!(idp.position("create_time_policy").is_none());
        let state = idp.state.lock().unwrap();
        assert_eq!(state.permissions.len(), 1);
        assert_eq!(
            state.permissions[0].policies,
            Some(vec![state.policies[0].id.clone()])
        );
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        shared::setup_test!();
        let idp = FakeIdentityProvider::with_realm_management();
        idp.state.lock().unwrap().realm_lookup_delay = Some(Duration::from_millis(500));
        let orchestrator = orchestrator(idp).await;

        let err = orchestrator
            .run_with_deadline(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::DeadlineExceeded(_)));
    }

    #[test]
    fn test_select_signing_key_by_algorithm() {
        let keys = vec![key("enc-1", "RSA-OAEP"), key("k1", "RS256"), key("k2", "RS256")];
        assert_eq!(select_signing_key(&keys, "RS256").unwrap().kid, "k1");
        assert!(select_signing_key(&keys, "ES256").unwrap_err().is_not_found());
        assert!(select_signing_key(&[], "RS256").is_err());
    }

    #[tokio::test]
    async fn test_ensure_resource_skips_create_when_present() {
        let created = Mutex::new(false);
        let value = ensure_resource(
            "thing",
            "a",
            || async { Ok::<_, AdminApiError>(Some(7)) },
            || async {
                *created.lock().unwrap() = true;
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert!(!*created.lock().unwrap());
    }
}
