//! Storage engines.
//!
//! One asynchronous contract, two interchangeable back-ends: an embedded
//! single-file SQLite engine and a networked PostgreSQL engine. The
//! engine is selected by the connection-string scheme. All persisted
//! rows (authentications, profiles, scopes, codes/tokens, resources,
//! redeemed tickets, and the chore almanac) are owned exclusively by
//! this layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

/// Oldest schema version this build can run against.
pub const SCHEMA_MIN_SUPPORTED: SchemaVersion = SchemaVersion::new(1, 0, 0);
/// Newest schema version this build knows how to reach.
pub const SCHEMA_MAX_SUPPORTED: SchemaVersion = SchemaVersion::new(1, 1, 0);

/// Almanac event recorded by token cleanup.
pub const EVENT_TOKEN_CLEANUP: &str = "token_cleanup";
/// Almanac event recorded by scope cleanup.
pub const EVENT_SCOPE_CLEANUP: &str = "scope_cleanup";
/// Almanac event recorded by the ticket publication chore.
pub const EVENT_PUBLISH_TICKETS: &str = "publish_tickets";

/// A `major.minor.patch` schema version, stored as one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaVersion {
    pub major: i64,
    pub minor: i64,
    pub patch: i64,
}

impl SchemaVersion {
    pub const fn new(major: i64, minor: i64, patch: i64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Failure categories surfaced by storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// A mutation matched an unexpected number of rows.
    #[error("unexpected result from storage operation")]
    UnexpectedResult,

    #[error("data validation failed: {0}")]
    DataValidation(String),

    #[error("schema version {found} outside supported range {min} ..= {max}")]
    MigrationNeeded {
        found: String,
        min: String,
        max: String,
    },

    #[error("unsupported storage engine: {0}")]
    UnsupportedEngine(String),

    #[error("operation not implemented by this engine")]
    NotImplemented,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// True when the underlying driver reported a unique-constraint
/// violation. Swallowed only in the code re-redemption path; everywhere
/// else these propagate.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// An operator login record
#[derive(Debug, Clone)]
pub struct Authentication {
    pub identifier: String,
    /// Opaque verifier whose prefix names the algorithm
    /// (`$argon2id$…`, or the `$PAM$` delegation sentinel).
    pub credential: Option<String>,
    pub otp_key: Option<String>,
    pub created: DateTime<Utc>,
    pub last_authentication: Option<DateTime<Utc>>,
}

/// Details of one known scope
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeDetails {
    pub application: String,
    pub description: String,
    pub is_permanent: bool,
    pub is_manually_added: bool,
}

/// Scope details plus the profiles currently offering it by default
#[derive(Debug, Clone)]
pub struct ScopeUsage {
    pub details: ScopeDetails,
    pub profiles: Vec<String>,
}

/// Everything the consent and admin surfaces need to know about an
/// identifier's profiles and their default-offered scopes.
#[derive(Debug, Clone, Default)]
pub struct ProfilesScopes {
    pub profiles: Vec<String>,
    pub profile_scopes: HashMap<String, HashMap<String, ScopeDetails>>,
    pub scope_index: HashMap<String, ScopeUsage>,
}

/// The unified code/token row. Authorization codes and issued tokens
/// share this record, distinguished by `is_token`.
#[derive(Debug, Clone)]
pub struct CodeRecord {
    pub code_id: Uuid,
    pub created: DateTime<Utc>,
    pub is_token: bool,
    pub client_id: String,
    pub profile: String,
    pub identifier: String,
    pub scopes: Vec<String>,
    /// None means the grant never expires.
    pub expires: Option<DateTime<Utc>>,
    pub refresh_expires: Option<DateTime<Utc>>,
    pub refreshed: Option<DateTime<Utc>>,
    /// Seconds added to both validity bounds on each refresh.
    pub refresh_duration: Option<i64>,
    pub is_revoked: bool,
    pub profile_data: Option<Value>,
    pub resource: Option<String>,
}

impl CodeRecord {
    /// An active token: issued, not revoked, not past its expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.is_token && !self.is_revoked && self.expires.map(|e| e > now).unwrap_or(true)
    }
}

/// Parameters for redeeming a code into a row
#[derive(Debug, Clone)]
pub struct RedeemCodeData {
    pub code_id: Uuid,
    pub created: DateTime<Utc>,
    pub is_token: bool,
    pub client_id: String,
    pub profile: String,
    pub identifier: String,
    pub scopes: Vec<String>,
    /// None means no expiration.
    pub lifespan_seconds: Option<i64>,
    pub refresh_lifespan_seconds: Option<i64>,
    pub profile_data: Option<Value>,
    pub resource: Option<String>,
}

/// New validity bounds after a successful refresh
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub expires: DateTime<Utc>,
    pub refresh_expires: DateTime<Utc>,
    /// Present when the refresh narrowed the scope set.
    pub scopes: Option<Vec<String>>,
}

/// A resource server allowed to call the introspection endpoint
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub resource_id: Uuid,
    pub secret: String,
    pub description: String,
    pub created: DateTime<Utc>,
}

/// A ticket that has been redeemed for a token. Rows with
/// `published = None` await delivery to the queue.
#[derive(Debug, Clone)]
pub struct RedeemedTicketRecord {
    pub ticket: String,
    pub resource: String,
    pub subject: String,
    pub iss: Option<String>,
    pub token: String,
    pub created: DateTime<Utc>,
    pub published: Option<DateTime<Utc>>,
}

/// Data recorded when a ticket is redeemed
#[derive(Debug, Clone)]
pub struct RedeemedTicketData {
    pub ticket: String,
    pub resource: String,
    pub subject: String,
    pub iss: Option<String>,
    pub token: String,
}

/// One almanac entry: when a housekeeping event last ran
#[derive(Debug, Clone)]
pub struct AlmanacEntry {
    pub event: String,
    pub date: DateTime<Utc>,
}

/// The storage contract shared by both engines.
///
/// Every method acquires its own connection from the engine's pool;
/// methods that need atomicity run inside a transaction internally.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Apply schema migrations up to the supported maximum. Fails with
    /// `MigrationNeeded` when the stored version is outside
    /// `[SCHEMA_MIN_SUPPORTED, SCHEMA_MAX_SUPPORTED]`.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Cheap liveness probe; errors when the store is unusable.
    async fn health_check(&self) -> Result<(), StorageError>;

    // authentication

    async fn authentication_get(
        &self,
        identifier: &str,
    ) -> Result<Option<Authentication>, StorageError>;

    async fn authentication_upsert(
        &self,
        identifier: &str,
        credential: &str,
        otp_key: Option<&str>,
    ) -> Result<(), StorageError>;

    async fn authentication_update_credential(
        &self,
        identifier: &str,
        credential: &str,
    ) -> Result<(), StorageError>;

    async fn authentication_update_otp_key(
        &self,
        identifier: &str,
        otp_key: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Record a successful login.
    async fn authentication_success(&self, identifier: &str) -> Result<(), StorageError>;

    // profiles and scopes

    async fn profile_is_valid(&self, profile: &str) -> Result<bool, StorageError>;

    async fn profile_identifier_insert(
        &self,
        profile: &str,
        identifier: &str,
    ) -> Result<(), StorageError>;

    async fn profile_scope_insert(&self, profile: &str, scope: &str)
        -> Result<(), StorageError>;

    /// Replace a profile's default-offered scope set.
    async fn profile_scopes_set_all(
        &self,
        profile: &str,
        scopes: &[String],
    ) -> Result<(), StorageError>;

    async fn profiles_scopes_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<ProfilesScopes, StorageError>;

    async fn scope_upsert(
        &self,
        scope: &str,
        application: &str,
        description: &str,
        manually_added: bool,
    ) -> Result<(), StorageError>;

    /// Delete a scope; returns false when it is still referenced by a
    /// profile or an active code.
    async fn scope_delete(&self, scope: &str) -> Result<bool, StorageError>;

    /// Remove unreferenced ephemeral scopes. Returns None when the
    /// almanac says the last run was less than `at_least_ms_since_last`
    /// ago.
    async fn scope_cleanup(
        &self,
        at_least_ms_since_last: i64,
    ) -> Result<Option<u64>, StorageError>;

    // codes and tokens

    /// Insert the code row, or revoke it on re-redemption. Returns true
    /// when the row was inserted fresh; false when the code id had been
    /// seen before (the pre-existing row is revoked as a side effect).
    async fn redeem_code(&self, data: &RedeemCodeData) -> Result<bool, StorageError>;

    /// Extend a refreshable row's bounds by its stored refresh
    /// duration, advance `refreshed`, and drop `remove_scopes` from its
    /// scope set, atomically. Returns None when no refreshable row
    /// exists.
    async fn refresh_code(
        &self,
        code_id: &Uuid,
        refreshed_at: DateTime<Utc>,
        remove_scopes: &[String],
    ) -> Result<Option<RefreshOutcome>, StorageError>;

    async fn token_get_by_code_id(
        &self,
        code_id: &Uuid,
    ) -> Result<Option<CodeRecord>, StorageError>;

    /// Fails with `UnexpectedResult` when no such row exists.
    async fn token_revoke_by_code_id(&self, code_id: &Uuid) -> Result<(), StorageError>;

    /// Mark the row unrefreshable; the access token itself stays valid.
    async fn token_refresh_revoke_by_code_id(
        &self,
        code_id: &Uuid,
    ) -> Result<(), StorageError>;

    async fn tokens_get_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Vec<CodeRecord>, StorageError>;

    /// Remove expired codes and tokens. Returns None when rate-limited
    /// by the almanac.
    async fn token_cleanup(
        &self,
        code_lifespan_seconds: i64,
        at_least_ms_since_last: i64,
    ) -> Result<Option<u64>, StorageError>;

    // tickets

    async fn ticket_redeemed(&self, data: &RedeemedTicketData) -> Result<(), StorageError>;

    /// Mark a redeemed ticket as published to the queue.
    async fn ticket_token_published(
        &self,
        ticket: &str,
        resource: &str,
    ) -> Result<(), StorageError>;

    async fn ticket_token_get_unpublished(
        &self,
        limit: i64,
    ) -> Result<Vec<RedeemedTicketRecord>, StorageError>;

    // resources

    async fn resource_get(
        &self,
        resource_id: &Uuid,
    ) -> Result<Option<ResourceRecord>, StorageError>;

    async fn resource_upsert(
        &self,
        resource_id: &Uuid,
        secret: &str,
        description: &str,
    ) -> Result<(), StorageError>;

    // almanac

    async fn almanac_get_all(&self) -> Result<Vec<AlmanacEntry>, StorageError>;

    async fn almanac_upsert(
        &self,
        event: &str,
        date: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;
}

/// Engine factory: pick a back-end by connection-string scheme.
pub async fn connect(
    connection_string: &str,
    query_log_level: &str,
) -> Result<Arc<dyn Storage>, StorageError> {
    if connection_string.starts_with("sqlite:") {
        Ok(Arc::new(
            SqliteStorage::connect(connection_string, query_log_level).await?,
        ))
    } else if connection_string.starts_with("postgresql://")
        || connection_string.starts_with("postgres://")
    {
        Ok(Arc::new(
            PostgresStorage::connect(connection_string, query_log_level).await?,
        ))
    } else {
        let scheme = connection_string
            .split(':')
            .next()
            .unwrap_or(connection_string);
        Err(StorageError::UnsupportedEngine(scheme.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_version_ordering() {
        assert!(SchemaVersion::new(1, 0, 0) < SchemaVersion::new(1, 1, 0));
        assert!(SchemaVersion::new(1, 1, 0) < SchemaVersion::new(2, 0, 0));
        assert_eq!(SchemaVersion::new(1, 0, 0).to_string(), "1.0.0");
        assert!(SCHEMA_MIN_SUPPORTED <= SCHEMA_MAX_SUPPORTED);
    }

    #[test]
    fn test_code_record_active() {
        let now = Utc::now();
        let mut record = CodeRecord {
            code_id: Uuid::new_v4(),
            created: now,
            is_token: true,
            client_id: "https://app.example/".to_string(),
            profile: "https://alice.example/".to_string(),
            identifier: "alice".to_string(),
            scopes: vec!["profile".to_string()],
            expires: None,
            refresh_expires: None,
            refreshed: None,
            refresh_duration: None,
            is_revoked: false,
            profile_data: None,
            resource: None,
        };
        assert!(record.is_active(now));

        record.expires = Some(now - chrono::Duration::seconds(1));
        assert!(!record.is_active(now));

        record.expires = Some(now + chrono::Duration::hours(1));
        assert!(record.is_active(now));

        record.is_revoked = true;
        assert!(!record.is_active(now));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let result = connect("mysql://localhost/db", "debug").await;
        match result {
            Err(StorageError::UnsupportedEngine(scheme)) => assert_eq!(scheme, "mysql"),
            other => panic!("expected UnsupportedEngine, got {:?}", other.err()),
        }
    }
}
