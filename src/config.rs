//! Configuration loader with layered sources.
//!
//! Loads configuration from:
//! 1. Default values
//! 2. An explicit `--config` file, or `indieauthd.yaml` in the working directory
//! 3. Environment variables with `INDIEAUTHD_` prefix

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Secret under which all sealed envelopes are packed. Rotating it
    /// invalidates every outstanding code, token, and ticket.
    #[serde(default)]
    pub encryption_secret: String,
    #[serde(default)]
    pub listen: ListenConfig,
    pub db: DbConfig,
    pub dingus: DingusConfig,
    #[serde(default)]
    pub route: RouteConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub chores: ChoresConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub authenticator: AuthenticatorConfig,
}

/// Bind address for the daemon
#[derive(Debug, Deserialize, Clone)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Storage configuration. The connection-string scheme selects the
/// engine: `sqlite://…` or `postgresql://…`.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub connection_string: String,
    /// Level at which engine queries are logged: trace, debug, or off.
    #[serde(default = "default_query_log_level")]
    pub query_log_level: String,
}

fn default_query_log_level() -> String {
    "debug".to_string()
}

/// Service self-identity
#[derive(Debug, Deserialize, Clone)]
pub struct DingusConfig {
    /// Public base URL of this server; used verbatim as the metadata
    /// `issuer` and the authorization-response `iss` parameter.
    pub self_base_url: String,
}

/// Endpoint paths, all overridable
#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    #[serde(default = "default_route_authorization")]
    pub authorization: String,
    #[serde(default = "default_route_consent")]
    pub consent: String,
    #[serde(default = "default_route_token")]
    pub token: String,
    #[serde(default = "default_route_revocation")]
    pub revocation: String,
    #[serde(default = "default_route_introspection")]
    pub introspection: String,
    #[serde(default = "default_route_userinfo")]
    pub userinfo: String,
    #[serde(default = "default_route_ticket")]
    pub ticket: String,
    #[serde(default = "default_route_metadata")]
    pub metadata: String,
    #[serde(default = "default_route_healthcheck")]
    pub healthcheck: String,
    #[serde(default = "default_route_admin")]
    pub admin: String,
}

fn default_route_authorization() -> String {
    "/authorize".to_string()
}
fn default_route_consent() -> String {
    "/consent".to_string()
}
fn default_route_token() -> String {
    "/token".to_string()
}
fn default_route_revocation() -> String {
    "/revocation".to_string()
}
fn default_route_introspection() -> String {
    "/introspection".to_string()
}
fn default_route_userinfo() -> String {
    "/userinfo".to_string()
}
fn default_route_ticket() -> String {
    "/ticket".to_string()
}
fn default_route_metadata() -> String {
    "/metadata".to_string()
}
fn default_route_healthcheck() -> String {
    "/healthcheck".to_string()
}
fn default_route_admin() -> String {
    "/admin".to_string()
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            authorization: default_route_authorization(),
            consent: default_route_consent(),
            token: default_route_token(),
            revocation: default_route_revocation(),
            introspection: default_route_introspection(),
            userinfo: default_route_userinfo(),
            ticket: default_route_ticket(),
            metadata: default_route_metadata(),
            healthcheck: default_route_healthcheck(),
            admin: default_route_admin(),
        }
    }
}

/// AMQP queue configuration. Ticket proffering and publication are
/// disabled when no URL is configured.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct QueuesConfig {
    #[serde(default)]
    pub amqp_url: Option<String>,
    #[serde(default = "default_ticket_publish_name")]
    pub ticket_publish_name: String,
    #[serde(default = "default_ticket_redeemed_name")]
    pub ticket_redeemed_name: String,
}

fn default_ticket_publish_name() -> String {
    "ticket.published".to_string()
}

fn default_ticket_redeemed_name() -> String {
    "ticket.proffered".to_string()
}

/// Chore intervals in milliseconds; 0 disables a chore.
#[derive(Debug, Deserialize, Clone)]
pub struct ChoresConfig {
    #[serde(default = "default_token_cleanup_ms")]
    pub token_cleanup_ms: u64,
    #[serde(default = "default_scope_cleanup_ms")]
    pub scope_cleanup_ms: u64,
    #[serde(default = "default_publish_tickets_ms")]
    pub publish_tickets_ms: u64,
}

fn default_token_cleanup_ms() -> u64 {
    86_400_000
}
fn default_scope_cleanup_ms() -> u64 {
    86_400_000
}
fn default_publish_tickets_ms() -> u64 {
    60_000
}

impl Default for ChoresConfig {
    fn default() -> Self {
        Self {
            token_cleanup_ms: default_token_cleanup_ms(),
            scope_cleanup_ms: default_scope_cleanup_ms(),
            publish_tickets_ms: default_publish_tickets_ms(),
        }
    }
}

/// Authorization-engine tunables
#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    /// How long an unredeemed authorization code stays valid.
    #[serde(default = "default_code_validity_timeout_ms")]
    pub code_validity_timeout_ms: u64,
    /// Lifespan of minted tickets.
    #[serde(default = "default_ticket_lifespan_seconds")]
    pub ticket_lifespan_seconds: u64,
    /// Accept authorization requests without PKCE. Off by default; only
    /// for clients that predate PKCE.
    #[serde(default)]
    pub allow_legacy_non_pkce: bool,
}

fn default_code_validity_timeout_ms() -> u64 {
    600_000
}
fn default_ticket_lifespan_seconds() -> u64 {
    86_400
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            code_validity_timeout_ms: default_code_validity_timeout_ms(),
            ticket_lifespan_seconds: default_ticket_lifespan_seconds(),
            allow_legacy_non_pkce: false,
        }
    }
}

/// Request-authentication switches
#[derive(Debug, Deserialize, Clone)]
pub struct AuthenticatorConfig {
    /// When false the server trusts a front proxy to have authenticated
    /// the operator and skips its own credential check.
    #[serde(default = "default_true")]
    pub authn_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        Self {
            authn_enabled: true,
        }
    }
}

impl AppConfig {
    /// Code validity window as a chrono duration.
    pub fn code_validity(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.manager.code_validity_timeout_ms as i64)
    }

    /// Code validity window in whole seconds, as handed to token cleanup.
    pub fn code_validity_seconds(&self) -> i64 {
        (self.manager.code_validity_timeout_ms / 1000) as i64
    }
}

/// Load configuration from all sources
pub fn load_config(explicit_file: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    builder = builder
        .set_default("listen.host", default_host())?
        .set_default("listen.port", default_port() as i64)?
        .set_default("db.connection_string", "sqlite://indieauthd.db")?
        .set_default("dingus.self_base_url", "http://127.0.0.1:8765/")?;

    if let Some(path) = explicit_file {
        builder = builder.add_source(File::from(path.to_path_buf()));
    } else {
        let local = PathBuf::from("indieauthd.yaml");
        if local.exists() {
            builder = builder.add_source(File::from(local).required(false));
        }
    }

    // e.g. INDIEAUTHD_DB__CONNECTION_STRING, INDIEAUTHD_ENCRYPTION_SECRET
    builder = builder.add_source(
        Environment::with_prefix("INDIEAUTHD")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
