//! Embedded storage engine backed by a single SQLite file.
//!
//! Timestamps are stored as epoch seconds, UUIDs as text, and JSON
//! profile data as serialized text, keeping the schema identical in
//! shape to the PostgreSQL engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    is_unique_violation, AlmanacEntry, Authentication, CodeRecord, ProfilesScopes,
    RedeemCodeData, RedeemedTicketData, RedeemedTicketRecord, RefreshOutcome, ResourceRecord,
    SchemaVersion, ScopeDetails, ScopeUsage, Storage, StorageError, EVENT_SCOPE_CLEANUP,
    EVENT_TOKEN_CLEANUP, SCHEMA_MAX_SUPPORTED, SCHEMA_MIN_SUPPORTED,
};

/// Migrations in apply order. Each entry is a multi-statement script.
const MIGRATIONS: &[(SchemaVersion, &str)] = &[
    (SchemaVersion::new(1, 0, 0), MIGRATION_1_0_0),
    (SchemaVersion::new(1, 1, 0), MIGRATION_1_1_0),
];

const MIGRATION_1_0_0: &str = r#"
CREATE TABLE IF NOT EXISTS authentication (
    identifier TEXT PRIMARY KEY,
    credential TEXT,
    otp_key TEXT,
    created INTEGER NOT NULL,
    last_authentication INTEGER
);

CREATE TABLE IF NOT EXISTS profile (
    profile TEXT PRIMARY KEY,
    identifier TEXT NOT NULL REFERENCES authentication(identifier) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_profile_identifier ON profile(identifier);

CREATE TABLE IF NOT EXISTS scope (
    scope TEXT PRIMARY KEY,
    application TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    is_permanent INTEGER NOT NULL DEFAULT 0,
    is_manually_added INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS profile_scope (
    profile TEXT NOT NULL REFERENCES profile(profile) ON DELETE CASCADE,
    scope TEXT NOT NULL REFERENCES scope(scope),
    PRIMARY KEY (profile, scope)
);

CREATE TABLE IF NOT EXISTS code (
    code_id TEXT PRIMARY KEY,
    created INTEGER NOT NULL,
    is_token INTEGER NOT NULL DEFAULT 0,
    client_id TEXT NOT NULL,
    profile TEXT NOT NULL,
    identifier TEXT NOT NULL,
    expires INTEGER,
    refresh_expires INTEGER,
    refreshed INTEGER,
    refresh_duration INTEGER,
    is_revoked INTEGER NOT NULL DEFAULT 0,
    profile_data TEXT,
    resource TEXT
);
CREATE INDEX IF NOT EXISTS idx_code_identifier ON code(identifier);
CREATE INDEX IF NOT EXISTS idx_code_expires ON code(expires);

CREATE TABLE IF NOT EXISTS code_scope (
    code_id TEXT NOT NULL REFERENCES code(code_id) ON DELETE CASCADE,
    scope TEXT NOT NULL REFERENCES scope(scope),
    PRIMARY KEY (code_id, scope)
);

CREATE TABLE IF NOT EXISTS resource (
    resource_id TEXT PRIMARY KEY,
    secret TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS redeemed_ticket (
    ticket TEXT NOT NULL,
    resource TEXT NOT NULL,
    subject TEXT NOT NULL,
    iss TEXT,
    token TEXT NOT NULL,
    created INTEGER NOT NULL,
    published INTEGER,
    PRIMARY KEY (ticket, resource)
);

CREATE TABLE IF NOT EXISTS almanac (
    event TEXT PRIMARY KEY,
    date INTEGER NOT NULL
);

INSERT OR IGNORE INTO scope (scope, application, description, is_permanent) VALUES
    ('profile', 'IndieAuth', 'Deliver profile information', 1),
    ('email', 'IndieAuth', 'Include email address with profile information', 1);
"#;

const MIGRATION_1_1_0: &str = r#"
CREATE INDEX IF NOT EXISTS idx_redeemed_ticket_pending
    ON redeemed_ticket(created) WHERE published IS NULL;
"#;

/// SQLite-backed storage engine
pub struct SqliteStorage {
    pool: SqlitePool,
}

fn epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn statement_log_level(name: &str) -> log::LevelFilter {
    match name {
        "trace" => log::LevelFilter::Trace,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Debug,
    }
}

impl SqliteStorage {
    /// Open (creating if missing) the database named by the connection
    /// string, e.g. `sqlite://var/indieauthd.db` or `sqlite::memory:`.
    pub async fn connect(
        connection_string: &str,
        query_log_level: &str,
    ) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(connection_string)?
            .create_if_missing(true)
            .foreign_keys(true)
            .log_statements(statement_log_level(query_log_level));

        // An in-memory database exists per connection; a pool larger
        // than one would hand out empty databases.
        let max_connections = if connection_string.contains(":memory:") {
            1
        } else {
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    async fn current_schema_version(&self) -> Result<Option<SchemaVersion>, StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                major INTEGER NOT NULL,
                minor INTEGER NOT NULL,
                patch INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT major, minor, patch FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| {
            SchemaVersion::new(
                r.get::<i64, _>("major"),
                r.get::<i64, _>("minor"),
                r.get::<i64, _>("patch"),
            )
        }))
    }

    fn row_to_code(row: &SqliteRow, scopes: Vec<String>) -> Result<CodeRecord, StorageError> {
        let code_id: String = row.get("code_id");
        let code_id = Uuid::parse_str(&code_id)
            .map_err(|e| StorageError::DataValidation(format!("bad code_id: {e}")))?;
        let profile_data: Option<String> = row.get("profile_data");
        let profile_data = match profile_data {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| StorageError::DataValidation(format!("bad profile_data: {e}")))?,
            ),
            None => None,
        };
        Ok(CodeRecord {
            code_id,
            created: from_epoch(row.get("created")),
            is_token: row.get("is_token"),
            client_id: row.get("client_id"),
            profile: row.get("profile"),
            identifier: row.get("identifier"),
            scopes,
            expires: row.get::<Option<i64>, _>("expires").map(from_epoch),
            refresh_expires: row.get::<Option<i64>, _>("refresh_expires").map(from_epoch),
            refreshed: row.get::<Option<i64>, _>("refreshed").map(from_epoch),
            refresh_duration: row.get("refresh_duration"),
            is_revoked: row.get("is_revoked"),
            profile_data,
            resource: row.get("resource"),
        })
    }

    async fn code_scopes(&self, code_id: &Uuid) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT scope FROM code_scope WHERE code_id = ? ORDER BY scope")
            .bind(code_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("scope")).collect())
    }

    /// Almanac gate shared by the cleanup chores: true when the event
    /// ran more recently than `at_least_ms` ago.
    async fn ran_recently(&self, event: &str, at_least_ms: i64) -> Result<bool, StorageError> {
        if at_least_ms <= 0 {
            return Ok(false);
        }
        let row = sqlx::query("SELECT date FROM almanac WHERE event = ?")
            .bind(event)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let last: i64 = row.get("date");
        Ok((Utc::now().timestamp() - last) * 1000 < at_least_ms)
    }
}

impl SqliteStorage {
    async fn initialize_impl(&self) -> Result<(), StorageError> {
        let mut current = self
            .current_schema_version()
            .await?
            .unwrap_or(SchemaVersion::new(0, 0, 0));

        if current > SCHEMA_MAX_SUPPORTED {
            return Err(StorageError::MigrationNeeded {
                found: current.to_string(),
                min: SCHEMA_MIN_SUPPORTED.to_string(),
                max: SCHEMA_MAX_SUPPORTED.to_string(),
            });
        }

        for (version, script) in MIGRATIONS {
            if *version <= current || *version > SCHEMA_MAX_SUPPORTED {
                continue;
            }
            info!(version = %version, "applying schema migration");
            Self::apply_migration(&self.pool, *version, script).await?;
            current = *version;
        }

        if current < SCHEMA_MIN_SUPPORTED {
            return Err(StorageError::MigrationNeeded {
                found: current.to_string(),
                min: SCHEMA_MIN_SUPPORTED.to_string(),
                max: SCHEMA_MAX_SUPPORTED.to_string(),
            });
        }

        debug!(version = %current, "schema ready");
        Ok(())
    }

    async fn apply_migration(
        pool: &SqlitePool,
        version: SchemaVersion,
        script: &str,
    ) -> Result<(), StorageError> {
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(script).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM schema_version")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO schema_version (major, minor, patch) VALUES (?, ?, ?)")
            .bind(version.major)
            .bind(version.minor)
            .bind(version.patch)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.initialize_impl().await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn authentication_get(
        &self,
        identifier: &str,
    ) -> Result<Option<Authentication>, StorageError> {
        let row = sqlx::query(
            "SELECT identifier, credential, otp_key, created, last_authentication
             FROM authentication WHERE identifier = ?",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Authentication {
            identifier: r.get("identifier"),
            credential: r.get("credential"),
            otp_key: r.get("otp_key"),
            created: from_epoch(r.get("created")),
            last_authentication: r
                .get::<Option<i64>, _>("last_authentication")
                .map(from_epoch),
        }))
    }

    async fn authentication_upsert(
        &self,
        identifier: &str,
        credential: &str,
        otp_key: Option<&str>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO authentication (identifier, credential, otp_key, created)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(identifier) DO UPDATE
                 SET credential = excluded.credential, otp_key = excluded.otp_key",
        )
        .bind(identifier)
        .bind(credential)
        .bind(otp_key)
        .bind(epoch(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn authentication_update_credential(
        &self,
        identifier: &str,
        credential: &str,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE authentication SET credential = ? WHERE identifier = ?")
            .bind(credential)
            .bind(identifier)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            return Err(StorageError::UnexpectedResult);
        }
        Ok(())
    }

    async fn authentication_update_otp_key(
        &self,
        identifier: &str,
        otp_key: Option<&str>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE authentication SET otp_key = ? WHERE identifier = ?")
            .bind(otp_key)
            .bind(identifier)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            return Err(StorageError::UnexpectedResult);
        }
        Ok(())
    }

    async fn authentication_success(&self, identifier: &str) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE authentication SET last_authentication = ? WHERE identifier = ?")
                .bind(epoch(Utc::now()))
                .bind(identifier)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() != 1 {
            return Err(StorageError::UnexpectedResult);
        }
        Ok(())
    }

    async fn profile_is_valid(&self, profile: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 AS present FROM profile WHERE profile = ?")
            .bind(profile)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn profile_identifier_insert(
        &self,
        profile: &str,
        identifier: &str,
    ) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO profile (profile, identifier) VALUES (?, ?)")
            .bind(profile)
            .bind(identifier)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn profile_scope_insert(
        &self,
        profile: &str,
        scope: &str,
    ) -> Result<(), StorageError> {
        if !crate::scopes::scope_valid(scope) {
            return Err(StorageError::DataValidation(format!(
                "invalid scope name: {scope}"
            )));
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO scope (scope) VALUES (?) ON CONFLICT(scope) DO NOTHING")
            .bind(scope)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO profile_scope (profile, scope) VALUES (?, ?)
             ON CONFLICT(profile, scope) DO NOTHING",
        )
        .bind(profile)
        .bind(scope)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn profile_scopes_set_all(
        &self,
        profile: &str,
        scopes: &[String],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM profile_scope WHERE profile = ?")
            .bind(profile)
            .execute(&mut *tx)
            .await?;
        for scope in scopes {
            if !crate::scopes::scope_valid(scope) {
                return Err(StorageError::DataValidation(format!(
                    "invalid scope name: {scope}"
                )));
            }
            sqlx::query("INSERT INTO scope (scope) VALUES (?) ON CONFLICT(scope) DO NOTHING")
                .bind(scope)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO profile_scope (profile, scope) VALUES (?, ?)")
                .bind(profile)
                .bind(scope)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn profiles_scopes_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<ProfilesScopes, StorageError> {
        let profile_rows =
            sqlx::query("SELECT profile FROM profile WHERE identifier = ? ORDER BY profile")
                .bind(identifier)
                .fetch_all(&self.pool)
                .await?;

        let mut result = ProfilesScopes::default();
        for row in &profile_rows {
            let profile: String = row.get("profile");
            result.profile_scopes.insert(profile.clone(), Default::default());
            result.profiles.push(profile);
        }

        let rows = sqlx::query(
            "SELECT ps.profile, s.scope, s.application, s.description,
                    s.is_permanent, s.is_manually_added
             FROM profile_scope ps
             JOIN scope s ON s.scope = ps.scope
             JOIN profile p ON p.profile = ps.profile
             WHERE p.identifier = ?
             ORDER BY ps.profile, s.scope",
        )
        .bind(identifier)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let profile: String = row.get("profile");
            let scope: String = row.get("scope");
            let details = ScopeDetails {
                application: row.get("application"),
                description: row.get("description"),
                is_permanent: row.get("is_permanent"),
                is_manually_added: row.get("is_manually_added"),
            };
            result
                .profile_scopes
                .entry(profile.clone())
                .or_default()
                .insert(scope.clone(), details.clone());
            result
                .scope_index
                .entry(scope)
                .or_insert_with(|| ScopeUsage {
                    details,
                    profiles: Vec::new(),
                })
                .profiles
                .push(profile);
        }

        Ok(result)
    }

    async fn scope_upsert(
        &self,
        scope: &str,
        application: &str,
        description: &str,
        manually_added: bool,
    ) -> Result<(), StorageError> {
        if !crate::scopes::scope_valid(scope) {
            return Err(StorageError::DataValidation(format!(
                "invalid scope name: {scope}"
            )));
        }
        sqlx::query(
            "INSERT INTO scope (scope, application, description, is_manually_added)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(scope) DO UPDATE SET
                 application = excluded.application,
                 description = excluded.description,
                 is_manually_added = excluded.is_manually_added",
        )
        .bind(scope)
        .bind(application)
        .bind(description)
        .bind(manually_added)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scope_delete(&self, scope: &str) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let refs = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM profile_scope WHERE scope = ?)
                  + (SELECT COUNT(*) FROM code_scope WHERE scope = ?) AS refs",
        )
        .bind(scope)
        .bind(scope)
        .fetch_one(&mut *tx)
        .await?;
        if refs.get::<i64, _>("refs") > 0 {
            return Ok(false);
        }
        let result = sqlx::query("DELETE FROM scope WHERE scope = ?")
            .bind(scope)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn scope_cleanup(
        &self,
        at_least_ms_since_last: i64,
    ) -> Result<Option<u64>, StorageError> {
        if self
            .ran_recently(EVENT_SCOPE_CLEANUP, at_least_ms_since_last)
            .await?
        {
            return Ok(None);
        }
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "DELETE FROM scope
             WHERE is_permanent = 0 AND is_manually_added = 0
               AND scope NOT IN (SELECT scope FROM profile_scope)
               AND scope NOT IN (SELECT scope FROM code_scope)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO almanac (event, date) VALUES (?, ?)
             ON CONFLICT(event) DO UPDATE SET date = excluded.date",
        )
        .bind(EVENT_SCOPE_CLEANUP)
        .bind(epoch(Utc::now()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(result.rows_affected()))
    }

    async fn redeem_code(&self, data: &RedeemCodeData) -> Result<bool, StorageError> {
        let code_id = data.code_id.to_string();

        // Fast path: an existing row means re-redemption; revoke it.
        let existing = sqlx::query("SELECT is_revoked FROM code WHERE code_id = ?")
            .bind(&code_id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = existing {
            if !row.get::<bool, _>("is_revoked") {
                sqlx::query("UPDATE code SET is_revoked = 1 WHERE code_id = ?")
                    .bind(&code_id)
                    .execute(&self.pool)
                    .await?;
            }
            return Ok(false);
        }

        let expires = data
            .lifespan_seconds
            .map(|s| epoch(data.created) + s);
        let refresh_expires = data
            .refresh_lifespan_seconds
            .map(|s| epoch(data.created) + s);
        let profile_data = data
            .profile_data
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()
            .map_err(|e| StorageError::DataValidation(format!("bad profile data: {e}")))?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO code (code_id, created, is_token, client_id, profile, identifier,
                               expires, refresh_expires, refresh_duration, profile_data, resource)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&code_id)
        .bind(epoch(data.created))
        .bind(data.is_token)
        .bind(&data.client_id)
        .bind(&data.profile)
        .bind(&data.identifier)
        .bind(expires)
        .bind(refresh_expires)
        .bind(data.refresh_lifespan_seconds)
        .bind(profile_data)
        .bind(data.resource.as_deref())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            // A concurrent redemption won the insert; the code is
            // replayed. Revoke the winner's row and refuse.
            Err(err) if is_unique_violation(&err) => {
                drop(tx);
                sqlx::query("UPDATE code SET is_revoked = 1 WHERE code_id = ?")
                    .bind(&code_id)
                    .execute(&self.pool)
                    .await?;
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        for scope in &data.scopes {
            sqlx::query("INSERT INTO scope (scope) VALUES (?) ON CONFLICT(scope) DO NOTHING")
                .bind(scope)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO code_scope (code_id, scope) VALUES (?, ?)")
                .bind(&code_id)
                .bind(scope)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn refresh_code(
        &self,
        code_id: &Uuid,
        refreshed_at: DateTime<Utc>,
        remove_scopes: &[String],
    ) -> Result<Option<RefreshOutcome>, StorageError> {
        let id = code_id.to_string();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT refresh_duration, refresh_expires FROM code
             WHERE code_id = ? AND is_token = 1 AND is_revoked = 0
               AND refresh_expires IS NOT NULL AND refresh_duration IS NOT NULL",
        )
        .bind(&id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let duration: i64 = row.get("refresh_duration");
        let previous_bound: i64 = row.get("refresh_expires");
        // Strictly advance the bound so an envelope minted against the
        // previous one is always distinguishable as superseded.
        let new_bound = (epoch(refreshed_at) + duration).max(previous_bound + 1);

        sqlx::query(
            "UPDATE code SET expires = ?, refresh_expires = ?, refreshed = ?
             WHERE code_id = ?",
        )
        .bind(new_bound)
        .bind(new_bound)
        .bind(epoch(refreshed_at))
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        let scopes = if remove_scopes.is_empty() {
            None
        } else {
            for scope in remove_scopes {
                sqlx::query("DELETE FROM code_scope WHERE code_id = ? AND scope = ?")
                    .bind(&id)
                    .bind(scope)
                    .execute(&mut *tx)
                    .await?;
            }
            let rows =
                sqlx::query("SELECT scope FROM code_scope WHERE code_id = ? ORDER BY scope")
                    .bind(&id)
                    .fetch_all(&mut *tx)
                    .await?;
            Some(rows.into_iter().map(|r| r.get("scope")).collect())
        };

        tx.commit().await?;
        Ok(Some(RefreshOutcome {
            expires: from_epoch(new_bound),
            refresh_expires: from_epoch(new_bound),
            scopes,
        }))
    }

    async fn token_get_by_code_id(
        &self,
        code_id: &Uuid,
    ) -> Result<Option<CodeRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM code WHERE code_id = ?")
            .bind(code_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let scopes = self.code_scopes(code_id).await?;
        Ok(Some(Self::row_to_code(&row, scopes)?))
    }

    async fn token_revoke_by_code_id(&self, code_id: &Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE code SET is_revoked = 1 WHERE code_id = ?")
            .bind(code_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            return Err(StorageError::UnexpectedResult);
        }
        Ok(())
    }

    async fn token_refresh_revoke_by_code_id(
        &self,
        code_id: &Uuid,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE code SET refresh_expires = NULL, refresh_duration = NULL
             WHERE code_id = ? AND refresh_expires IS NOT NULL",
        )
        .bind(code_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(StorageError::UnexpectedResult);
        }
        Ok(())
    }

    async fn tokens_get_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Vec<CodeRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM code WHERE identifier = ? AND is_token = 1 ORDER BY created DESC",
        )
        .bind(identifier)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let code_id: String = row.get("code_id");
            let code_id = Uuid::parse_str(&code_id)
                .map_err(|e| StorageError::DataValidation(format!("bad code_id: {e}")))?;
            let scopes = self.code_scopes(&code_id).await?;
            records.push(Self::row_to_code(&row, scopes)?);
        }
        Ok(records)
    }

    async fn token_cleanup(
        &self,
        code_lifespan_seconds: i64,
        at_least_ms_since_last: i64,
    ) -> Result<Option<u64>, StorageError> {
        if self
            .ran_recently(EVENT_TOKEN_CLEANUP, at_least_ms_since_last)
            .await?
        {
            return Ok(None);
        }
        let now = epoch(Utc::now());
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "DELETE FROM code
             WHERE (is_token = 0 AND created < ?)
                OR (is_token = 1 AND expires IS NOT NULL AND expires < ?)",
        )
        .bind(now - code_lifespan_seconds)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO almanac (event, date) VALUES (?, ?)
             ON CONFLICT(event) DO UPDATE SET date = excluded.date",
        )
        .bind(EVENT_TOKEN_CLEANUP)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(result.rows_affected()))
    }

    async fn ticket_redeemed(&self, data: &RedeemedTicketData) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO redeemed_ticket (ticket, resource, subject, iss, token, created)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&data.ticket)
        .bind(&data.resource)
        .bind(&data.subject)
        .bind(data.iss.as_deref())
        .bind(&data.token)
        .bind(epoch(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ticket_token_published(
        &self,
        ticket: &str,
        resource: &str,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE redeemed_ticket SET published = ? WHERE ticket = ? AND resource = ?",
        )
        .bind(epoch(Utc::now()))
        .bind(ticket)
        .bind(resource)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(StorageError::UnexpectedResult);
        }
        Ok(())
    }

    async fn ticket_token_get_unpublished(
        &self,
        limit: i64,
    ) -> Result<Vec<RedeemedTicketRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT ticket, resource, subject, iss, token, created, published
             FROM redeemed_ticket WHERE published IS NULL
             ORDER BY created LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| RedeemedTicketRecord {
                ticket: r.get("ticket"),
                resource: r.get("resource"),
                subject: r.get("subject"),
                iss: r.get("iss"),
                token: r.get("token"),
                created: from_epoch(r.get("created")),
                published: r.get::<Option<i64>, _>("published").map(from_epoch),
            })
            .collect())
    }

    async fn resource_get(
        &self,
        resource_id: &Uuid,
    ) -> Result<Option<ResourceRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT resource_id, secret, description, created
             FROM resource WHERE resource_id = ?",
        )
        .bind(resource_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let resource_id: String = r.get("resource_id");
            Ok(ResourceRecord {
                resource_id: Uuid::parse_str(&resource_id)
                    .map_err(|e| StorageError::DataValidation(format!("bad resource_id: {e}")))?,
                secret: r.get("secret"),
                description: r.get("description"),
                created: from_epoch(r.get("created")),
            })
        })
        .transpose()
    }

    async fn resource_upsert(
        &self,
        resource_id: &Uuid,
        secret: &str,
        description: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO resource (resource_id, secret, description, created)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(resource_id) DO UPDATE SET
                 secret = excluded.secret, description = excluded.description",
        )
        .bind(resource_id.to_string())
        .bind(secret)
        .bind(description)
        .bind(epoch(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn almanac_get_all(&self) -> Result<Vec<AlmanacEntry>, StorageError> {
        let rows = sqlx::query("SELECT event, date FROM almanac ORDER BY event")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| AlmanacEntry {
                event: r.get("event"),
                date: from_epoch(r.get("date")),
            })
            .collect())
    }

    async fn almanac_upsert(
        &self,
        event: &str,
        date: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO almanac (event, date) VALUES (?, ?)
             ON CONFLICT(event) DO UPDATE SET date = excluded.date",
        )
        .bind(event)
        .bind(epoch(date.unwrap_or_else(Utc::now)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open() -> SqliteStorage {
        let store = SqliteStorage::connect("sqlite::memory:", "off")
            .await
            .expect("connect");
        store.initialize().await.expect("initialize");
        store
    }

    fn redeem_data(code_id: Uuid, is_token: bool) -> RedeemCodeData {
        RedeemCodeData {
            code_id,
            created: Utc::now(),
            is_token,
            client_id: "https://app.example/".to_string(),
            profile: "https://alice.example/".to_string(),
            identifier: "alice".to_string(),
            scopes: vec!["profile".to_string(), "email".to_string()],
            lifespan_seconds: Some(86_400),
            refresh_lifespan_seconds: Some(604_800),
            profile_data: Some(serde_json::json!({"name": "Alice"})),
            resource: None,
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = open().await;
        store.initialize().await.expect("second initialize");
        store.health_check().await.expect("healthy");
    }

    #[tokio::test]
    async fn test_file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let connection_string =
            format!("sqlite://{}", dir.path().join("indieauthd.db").display());

        {
            let store = SqliteStorage::connect(&connection_string, "off")
                .await
                .expect("create database file");
            store.initialize().await.unwrap();
            store
                .authentication_upsert("alice", "$argon2id$stub", None)
                .await
                .unwrap();
        }

        // A fresh connection sees the migrated schema and the row.
        let store = SqliteStorage::connect(&connection_string, "off")
            .await
            .expect("reopen database file");
        store.initialize().await.unwrap();
        let auth = store.authentication_get("alice").await.unwrap().unwrap();
        assert_eq!(auth.credential.as_deref(), Some("$argon2id$stub"));
    }

    #[tokio::test]
    async fn test_future_schema_is_refused() {
        let store = SqliteStorage::connect("sqlite::memory:", "off")
            .await
            .unwrap();
        store.initialize().await.unwrap();
        sqlx::query("UPDATE schema_version SET major = 99")
            .execute(&store.pool)
            .await
            .unwrap();
        match store.initialize().await {
            Err(StorageError::MigrationNeeded { found, .. }) => {
                assert!(found.starts_with("99."));
            }
            other => panic!("expected MigrationNeeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_authentication_lifecycle() {
        let store = open().await;
        store
            .authentication_upsert("alice", "$argon2id$stub", None)
            .await
            .unwrap();

        let auth = store.authentication_get("alice").await.unwrap().unwrap();
        assert_eq!(auth.identifier, "alice");
        assert_eq!(auth.credential.as_deref(), Some("$argon2id$stub"));
        assert!(auth.last_authentication.is_none());

        store.authentication_success("alice").await.unwrap();
        let auth = store.authentication_get("alice").await.unwrap().unwrap();
        assert!(auth.last_authentication.is_some());

        store
            .authentication_update_credential("alice", "$argon2id$new")
            .await
            .unwrap();
        let auth = store.authentication_get("alice").await.unwrap().unwrap();
        assert_eq!(auth.credential.as_deref(), Some("$argon2id$new"));

        store
            .authentication_update_otp_key("alice", Some("JBSWY3DPEHPK3PXP"))
            .await
            .unwrap();
        let auth = store.authentication_get("alice").await.unwrap().unwrap();
        assert_eq!(auth.otp_key.as_deref(), Some("JBSWY3DPEHPK3PXP"));
        store
            .authentication_update_otp_key("alice", None)
            .await
            .unwrap();
        let auth = store.authentication_get("alice").await.unwrap().unwrap();
        assert!(auth.otp_key.is_none());

        assert!(matches!(
            store.authentication_success("nobody").await,
            Err(StorageError::UnexpectedResult)
        ));
    }

    #[tokio::test]
    async fn test_profiles_and_scopes() {
        let store = open().await;
        store
            .authentication_upsert("alice", "$argon2id$stub", None)
            .await
            .unwrap();
        store
            .profile_identifier_insert("https://alice.example/", "alice")
            .await
            .unwrap();

        assert!(store.profile_is_valid("https://alice.example/").await.unwrap());
        assert!(!store.profile_is_valid("https://bob.example/").await.unwrap());

        store
            .scope_upsert("profile", "IndieAuth", "profile info", false)
            .await
            .unwrap();
        store
            .profile_scope_insert("https://alice.example/", "profile")
            .await
            .unwrap();
        store
            .profile_scope_insert("https://alice.example/", "create")
            .await
            .unwrap();

        let ps = store.profiles_scopes_by_identifier("alice").await.unwrap();
        assert_eq!(ps.profiles, vec!["https://alice.example/"]);
        let scopes = &ps.profile_scopes["https://alice.example/"];
        assert!(scopes.contains_key("profile"));
        assert!(scopes.contains_key("create"));
        assert_eq!(
            ps.scope_index["profile"].profiles,
            vec!["https://alice.example/"]
        );

        store
            .profile_scopes_set_all("https://alice.example/", &["profile".to_string()])
            .await
            .unwrap();
        let ps = store.profiles_scopes_by_identifier("alice").await.unwrap();
        assert!(!ps.profile_scopes["https://alice.example/"].contains_key("create"));
    }

    #[tokio::test]
    async fn test_scope_validation_at_boundary() {
        let store = open().await;
        assert!(matches!(
            store.scope_upsert("bad scope", "", "", false).await,
            Err(StorageError::DataValidation(_))
        ));
    }

    #[tokio::test]
    async fn test_redeem_code_once_only() {
        let store = open().await;
        let code_id = Uuid::new_v4();

        assert!(store.redeem_code(&redeem_data(code_id, true)).await.unwrap());
        // Replay refuses and revokes.
        assert!(!store.redeem_code(&redeem_data(code_id, true)).await.unwrap());

        let record = store.token_get_by_code_id(&code_id).await.unwrap().unwrap();
        assert!(record.is_revoked);

        // A third attempt still refuses.
        assert!(!store.redeem_code(&redeem_data(code_id, true)).await.unwrap());
    }

    #[tokio::test]
    async fn test_redeemed_row_contents() {
        let store = open().await;
        let code_id = Uuid::new_v4();
        store.redeem_code(&redeem_data(code_id, true)).await.unwrap();

        let record = store.token_get_by_code_id(&code_id).await.unwrap().unwrap();
        assert!(record.is_token);
        assert_eq!(record.scopes, vec!["email", "profile"]);
        assert!(record.expires.is_some());
        assert_eq!(record.refresh_duration, Some(604_800));
        assert_eq!(
            record.profile_data.unwrap()["name"],
            serde_json::json!("Alice")
        );
    }

    #[tokio::test]
    async fn test_infinite_lifespan_round_trips() {
        let store = open().await;
        let code_id = Uuid::new_v4();
        let mut data = redeem_data(code_id, true);
        data.lifespan_seconds = None;
        data.refresh_lifespan_seconds = None;
        store.redeem_code(&data).await.unwrap();

        let record = store.token_get_by_code_id(&code_id).await.unwrap().unwrap();
        assert!(record.expires.is_none());
        assert!(record.is_active(Utc::now()));
    }

    #[tokio::test]
    async fn test_refresh_extends_and_narrows() {
        let store = open().await;
        let code_id = Uuid::new_v4();
        store.redeem_code(&redeem_data(code_id, true)).await.unwrap();
        let before = store.token_get_by_code_id(&code_id).await.unwrap().unwrap();

        let refreshed_at = Utc::now() + chrono::Duration::hours(1);
        let outcome = store
            .refresh_code(&code_id, refreshed_at, &["email".to_string()])
            .await
            .unwrap()
            .unwrap();

        assert!(outcome.refresh_expires > before.refresh_expires.unwrap());
        assert_eq!(outcome.scopes, Some(vec!["profile".to_string()]));

        let after = store.token_get_by_code_id(&code_id).await.unwrap().unwrap();
        assert_eq!(after.scopes, vec!["profile"]);
        assert_eq!(after.refreshed, Some(from_epoch(epoch(refreshed_at))));
    }

    #[tokio::test]
    async fn test_refresh_missing_row() {
        let store = open().await;
        let outcome = store
            .refresh_code(&Uuid::new_v4(), Utc::now(), &[])
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_refresh_revoke_blocks_refresh() {
        let store = open().await;
        let code_id = Uuid::new_v4();
        store.redeem_code(&redeem_data(code_id, true)).await.unwrap();

        store.token_refresh_revoke_by_code_id(&code_id).await.unwrap();
        assert!(store
            .refresh_code(&code_id, Utc::now(), &[])
            .await
            .unwrap()
            .is_none());

        // The access token row itself is still there and unrevoked.
        let record = store.token_get_by_code_id(&code_id).await.unwrap().unwrap();
        assert!(!record.is_revoked);
        assert!(record.refresh_expires.is_none());
    }

    #[tokio::test]
    async fn test_revoke_missing_row() {
        let store = open().await;
        assert!(matches!(
            store.token_revoke_by_code_id(&Uuid::new_v4()).await,
            Err(StorageError::UnexpectedResult)
        ));
    }

    #[tokio::test]
    async fn test_tokens_by_identifier() {
        let store = open().await;
        store.redeem_code(&redeem_data(Uuid::new_v4(), true)).await.unwrap();
        store.redeem_code(&redeem_data(Uuid::new_v4(), true)).await.unwrap();
        // Authorization-code stage rows are not tokens.
        store.redeem_code(&redeem_data(Uuid::new_v4(), false)).await.unwrap();

        let tokens = store.tokens_get_by_identifier("alice").await.unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().all(|t| t.is_token));
    }

    #[tokio::test]
    async fn test_token_cleanup_removes_expired() {
        let store = open().await;

        let expired_id = Uuid::new_v4();
        let mut expired = redeem_data(expired_id, true);
        expired.created = Utc::now() - chrono::Duration::days(3);
        expired.lifespan_seconds = Some(60);
        store.redeem_code(&expired).await.unwrap();

        let live_id = Uuid::new_v4();
        store.redeem_code(&redeem_data(live_id, true)).await.unwrap();

        let removed = store.token_cleanup(600, 0).await.unwrap();
        assert_eq!(removed, Some(1));
        assert!(store.token_get_by_code_id(&expired_id).await.unwrap().is_none());
        assert!(store.token_get_by_code_id(&live_id).await.unwrap().is_some());

        // A second run inside the rate window is skipped.
        let skipped = store.token_cleanup(600, 3_600_000).await.unwrap();
        assert_eq!(skipped, None);
    }

    #[tokio::test]
    async fn test_scope_cleanup_spares_referenced_and_special() {
        let store = open().await;
        // 'profile' and 'email' are seeded permanent by the migration.
        store.scope_upsert("kept-manual", "", "", true).await.unwrap();
        store.scope_upsert("orphan", "", "", false).await.unwrap();

        let removed = store.scope_cleanup(0).await.unwrap();
        assert_eq!(removed, Some(1));

        let remaining: Vec<String> = sqlx::query("SELECT scope FROM scope ORDER BY scope")
            .fetch_all(&store.pool)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.get("scope"))
            .collect();
        assert_eq!(remaining, vec!["email", "kept-manual", "profile"]);
        assert!(store.scope_delete("kept-manual").await.unwrap());
    }

    #[tokio::test]
    async fn test_scope_delete_refuses_referenced() {
        let store = open().await;
        store
            .authentication_upsert("alice", "$argon2id$stub", None)
            .await
            .unwrap();
        store
            .profile_identifier_insert("https://alice.example/", "alice")
            .await
            .unwrap();
        store
            .profile_scope_insert("https://alice.example/", "create")
            .await
            .unwrap();

        assert!(!store.scope_delete("create").await.unwrap());
        store
            .profile_scopes_set_all("https://alice.example/", &[])
            .await
            .unwrap();
        assert!(store.scope_delete("create").await.unwrap());
    }

    #[tokio::test]
    async fn test_ticket_publication_flow() {
        let store = open().await;
        let data = RedeemedTicketData {
            ticket: "sealed-ticket".to_string(),
            resource: "https://alice.example/feed".to_string(),
            subject: "https://bob.example/".to_string(),
            iss: Some("https://auth.alice.example/".to_string()),
            token: "sealed-token".to_string(),
        };
        store.ticket_redeemed(&data).await.unwrap();

        let pending = store.ticket_token_get_unpublished(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ticket, "sealed-ticket");
        assert!(pending[0].published.is_none());

        store
            .ticket_token_published("sealed-ticket", "https://alice.example/feed")
            .await
            .unwrap();
        assert!(store.ticket_token_get_unpublished(10).await.unwrap().is_empty());

        assert!(matches!(
            store.ticket_token_published("missing", "nowhere").await,
            Err(StorageError::UnexpectedResult)
        ));
    }

    #[tokio::test]
    async fn test_resources() {
        let store = open().await;
        let id = Uuid::new_v4();
        store.resource_upsert(&id, "s3cret", "feed server").await.unwrap();

        let resource = store.resource_get(&id).await.unwrap().unwrap();
        assert_eq!(resource.secret, "s3cret");
        assert_eq!(resource.description, "feed server");
        assert!(store.resource_get(&Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_almanac() {
        let store = open().await;
        assert!(store.almanac_get_all().await.unwrap().is_empty());

        store.almanac_upsert("token_cleanup", None).await.unwrap();
        let entries = store.almanac_get_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "token_cleanup");

        let fixed = from_epoch(1_700_000_000);
        store.almanac_upsert("token_cleanup", Some(fixed)).await.unwrap();
        let entries = store.almanac_get_all().await.unwrap();
        assert_eq!(entries[0].date, fixed);
    }
}
