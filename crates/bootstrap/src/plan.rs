//! The static provisioning plan and the resource definitions it creates.
//!
//! The plan is data: an ordered list of steps with their declared
//! dependencies. The orchestrator walks it in order and looks up each step's
//! inputs from the outputs of the steps it depends on.

use std::collections::BTreeMap;

use keycloak_admin::{
    ClientRepresentation, ClientScopeRepresentation, DecisionStrategy, Logic,
    ProtocolMapperRepresentation, RealmRepresentation, TimePolicyRepresentation,
};

use crate::error::BootstrapError;

pub const REALM_NAME: &str = "leafog";

/// Realm attribute written after the last step succeeded
pub const BOOTSTRAP_COMPLETED_ATTRIBUTE: &str = "leafog.bootstrap.completed";
pub const BOOTSTRAP_COMPLETED_VALUE: &str = "true";

/// Config key the gateway reads its JWT verification key from
pub const PGRST_JWT_SECRET_KEY: &str = "pgrst.jwt_secret";
/// Config key listing the schemas the gateway exposes
pub const PGRST_DB_SCHEMAS_KEY: &str = "pgrst.db_schemas";

/// Schemas that must never be exposed through the gateway
pub const PROTECTED_SCHEMAS: &[&str] = &["auth", "postgrest", "public"];

pub const DEFAULT_SIGNING_KEY_ALGORITHM: &str = "RS256";

/// Built-in client that owns the realm's fine-grained admin permissions
pub const REALM_MANAGEMENT_CLIENT_ID: &str = "realm-management";

pub const MINIO_CLIENT_ID: &str = "minio";
pub const MINIO_CLIENT_SCOPE_NAME: &str = "minio";
pub const ALL_TIME_POLICY_NAME: &str = "all time";

/// Prefix the identity provider's tables carry in the relational store
pub const DEFAULT_TABLE_PREFIX: &str = "keycloak_";
pub const USER_VIEW_NAME: &str = "auth_user";

const OPENID_CONNECT: &str = "openid-connect";

pub fn is_protected_namespace(name: &str) -> bool {
    PROTECTED_SCHEMAS.contains(&name)
}

/// Name Keycloak gives the token-exchange permission it generates for a
/// client once management permissions are enabled. `client_id` is the
/// provider-assigned id, not the `clientId`.
pub fn token_exchange_permission_name(client_id: &str) -> String {
    format!("token-exchange.permission.client.{client_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    CreateRealm,
    CreateUserView,
    CreateClientScope,
    SetDefaultClientScope,
    CreateClient,
    EnableClientPermissions,
    CreateTimePolicy,
    AttachTokenExchangePolicy,
    SyncSigningKey,
    MarkCompleted,
}

impl StepId {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StepId::CreateRealm => "create-realm",
            StepId::CreateUserView => "create-user-view",
            StepId::CreateClientScope => "create-client-scope",
            StepId::SetDefaultClientScope => "set-default-client-scope",
            StepId::CreateClient => "create-client",
            StepId::EnableClientPermissions => "enable-client-permissions",
            StepId::CreateTimePolicy => "create-time-policy",
            StepId::AttachTokenExchangePolicy => "attach-token-exchange-policy",
            StepId::SyncSigningKey => "sync-signing-key",
            StepId::MarkCompleted => "mark-completed",
        }
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStep {
    pub id: StepId,
    pub depends_on: &'static [StepId],
}

pub const BOOTSTRAP_PLAN: &[PlanStep] = &[
    PlanStep {
        id: StepId::CreateRealm,
        depends_on: &[],
    },
    PlanStep {
        id: StepId::CreateUserView,
        depends_on: &[StepId::CreateRealm],
    },
    PlanStep {
        id: StepId::CreateClientScope,
        depends_on: &[StepId::CreateRealm],
    },
    PlanStep {
        id: StepId::SetDefaultClientScope,
        depends_on: &[StepId::CreateClientScope],
    },
    PlanStep {
        id: StepId::CreateClient,
        depends_on: &[StepId::CreateRealm],
    },
    PlanStep {
        id: StepId::EnableClientPermissions,
        depends_on: &[StepId::CreateClient],
    },
    // the realm-management client already exists in every realm
    PlanStep {
        id: StepId::CreateTimePolicy,
        depends_on: &[StepId::CreateRealm],
    },
    PlanStep {
        id: StepId::AttachTokenExchangePolicy,
        depends_on: &[StepId::EnableClientPermissions, StepId::CreateTimePolicy],
    },
    PlanStep {
        id: StepId::SyncSigningKey,
        depends_on: &[StepId::CreateRealm],
    },
    PlanStep {
        id: StepId::MarkCompleted,
        depends_on: &[
            StepId::CreateUserView,
            StepId::SetDefaultClientScope,
            StepId::AttachTokenExchangePolicy,
            StepId::SyncSigningKey,
        ],
    },
];

/// Check that every dependency names a step that runs earlier in `plan`.
pub fn validate_plan(plan: &[PlanStep]) -> Result<(), BootstrapError> {
    for (position, step) in plan.iter().enumerate() {
        for dependency in step.depends_on {
            if !plan[..position].iter().any(|earlier| earlier.id == *dependency) {
                return Err(BootstrapError::InvalidPlan {
                    step: step.id.as_str(),
                    dependency: dependency.as_str(),
                });
            }
        }
    }
    Ok(())
}

/// Tables the user view reads from and the name it is published under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserViewSource {
    pub view_name: String,
    pub user_table: String,
    pub realm_table: String,
    pub attribute_table: String,
}

impl UserViewSource {
    pub fn with_table_prefix(prefix: &str) -> Self {
        Self {
            view_name: USER_VIEW_NAME.to_string(),
            user_table: format!("{prefix}user_entity"),
            realm_table: format!("{prefix}realm"),
            attribute_table: format!("{prefix}user_attribute"),
        }
    }
}

impl Default for UserViewSource {
    fn default() -> Self {
        Self::with_table_prefix(DEFAULT_TABLE_PREFIX)
    }
}

/// Every resource the bootstrap creates, built once from configuration.
#[derive(Debug, Clone)]
pub struct ProvisioningDefinitions {
    pub realm: RealmRepresentation,
    pub client_scope: ClientScopeRepresentation,
    pub client: ClientRepresentation,
    pub time_policy: TimePolicyRepresentation,
    pub user_view_source: UserViewSource,
    pub user_view_sql: String,
    pub realm_management_client_id: String,
    pub signing_key_algorithm: String,
}

impl ProvisioningDefinitions {
    pub fn new(minio_client_secret: impl Into<String>) -> Self {
        Self {
            realm: realm_definition(REALM_NAME),
            client_scope: minio_client_scope(),
            client: minio_client(minio_client_secret.into()),
            time_policy: all_time_policy(),
            user_view_source: UserViewSource::default(),
            user_view_sql: user_view_sql(REALM_NAME, &UserViewSource::default()),
            realm_management_client_id: REALM_MANAGEMENT_CLIENT_ID.to_string(),
            signing_key_algorithm: DEFAULT_SIGNING_KEY_ALGORITHM.to_string(),
        }
    }

    pub fn with_signing_key_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.signing_key_algorithm = algorithm.into();
        self
    }

    pub fn with_user_view_source(mut self, source: UserViewSource) -> Self {
        self.user_view_sql = user_view_sql(&self.realm.realm, &source);
        self.user_view_source = source;
        self
    }

    pub fn realm_name(&self) -> &str {
        &self.realm.realm
    }
}

fn realm_definition(name: &str) -> RealmRepresentation {
    RealmRepresentation {
        realm: name.to_string(),
        enabled: Some(true),
        ..Default::default()
    }
}

fn minio_client_scope() -> ClientScopeRepresentation {
    let attributes = BTreeMap::from([
        ("consent.screen.text".to_string(), String::new()),
        ("display.on.consent.screen".to_string(), "true".to_string()),
        ("gui.order".to_string(), String::new()),
        ("include.in.token.scope".to_string(), "true".to_string()),
    ]);

    let mapper_config = BTreeMap::from([
        ("user.attribute".to_string(), "minioPolicy".to_string()),
        ("claim.name".to_string(), "minio_policy".to_string()),
        ("jsonType.label".to_string(), "String".to_string()),
        ("id.token.claim".to_string(), "true".to_string()),
        ("access.token.claim".to_string(), "true".to_string()),
        ("userinfo.token.claim".to_string(), "true".to_string()),
    ]);

    ClientScopeRepresentation {
        id: None,
        name: MINIO_CLIENT_SCOPE_NAME.to_string(),
        protocol: OPENID_CONNECT.to_string(),
        attributes,
        protocol_mappers: vec![ProtocolMapperRepresentation {
            id: None,
            name: "minio-policy-mapper".to_string(),
            protocol: OPENID_CONNECT.to_string(),
            protocol_mapper: "oidc-usermodel-attribute-mapper".to_string(),
            config: mapper_config,
        }],
    }
}

fn minio_client(secret: String) -> ClientRepresentation {
    ClientRepresentation {
        id: None,
        client_id: MINIO_CLIENT_ID.to_string(),
        protocol: OPENID_CONNECT.to_string(),
        public_client: false,
        service_accounts_enabled: false,
        standard_flow_enabled: true,
        authorization_services_enabled: false,
        always_display_in_console: false,
        secret: Some(secret),
    }
}

fn all_time_policy() -> TimePolicyRepresentation {
    TimePolicyRepresentation {
        id: None,
        name: ALL_TIME_POLICY_NAME.to_string(),
        description: String::new(),
        policy_type: "time".to_string(),
        logic: Logic::Positive,
        decision_strategy: DecisionStrategy::Unanimous,
        not_before: "1970-01-01 00:00:00".to_string(),
        not_on_or_after: "2970-01-01 00:00:00".to_string(),
        day_month: "0".to_string(),
        day_month_end: "31".to_string(),
        month: "0".to_string(),
        month_end: "12".to_string(),
        hour: "0".to_string(),
        hour_end: "23".to_string(),
        minute: "0".to_string(),
        minute_end: "59".to_string(),
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Projection of the identity provider's users of `realm` with their
/// attributes folded into one JSON object. Drops and recreates the view so
/// it can run any number of times.
///
/// The leading `SELECT ... LIMIT 0` statements fail the batch when a source
/// table is missing, so the old view is kept and the step errors out.
fn user_view_sql(realm: &str, source: &UserViewSource) -> String {
    let realm = realm.replace('\'', "''");
    let view = quote_identifier(&source.view_name);
    let users = quote_identifier(&source.user_table);
    let realms = quote_identifier(&source.realm_table);
    let attributes = quote_identifier(&source.attribute_table);
    format!(
        "SELECT 1 FROM {users} LIMIT 0;
SELECT 1 FROM {realms} LIMIT 0;
SELECT 1 FROM {attributes} LIMIT 0;
DROP VIEW IF EXISTS {view};
CREATE VIEW {view} AS
SELECT u.username,
       u.first_name,
       u.last_name,
       u.email,
       u.email_verified,
       u.created_timestamp,
       u.enabled,
       coalesce(
           json_group_object(ua.name, ua.value)
               FILTER (WHERE ua.name IS NOT NULL AND ua.value IS NOT NULL),
           '{{}}'
       ) AS user_attributes
FROM {users} AS u
LEFT JOIN {realms} AS r ON r.id = u.realm_id
LEFT JOIN {attributes} AS ua ON ua.user_id = u.id
WHERE r.name = '{realm}'
GROUP BY u.id;"
    )
}
