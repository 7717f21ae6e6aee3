//! Token lifecycle: grant dispatch, refresh, revocation, Bearer
//! validation, introspection, and userinfo.
//!
//! Access and refresh tokens are sealed envelopes around a `code_id`;
//! the storage row reached through that id is the source of truth for
//! revocation and expiry.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authorize::{verify_challenge, CodeGrant};
use crate::config::AppConfig;
use crate::envelope::EnvelopeCodec;
use crate::errors::{clean_description, EngineError, OAuthError};
use crate::store::{RedeemCodeData, RedeemedTicketData, Storage, StorageError};
use crate::ticket::TicketPayload;

/// Sealed access-token payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessTokenPayload {
    /// The code id of the backing row.
    pub c: Uuid,
    /// Epoch seconds at mint time.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Sealed refresh-token payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshTokenPayload {
    pub rc: Uuid,
    pub ts: i64,
    /// Epoch seconds; equals the row's refresh bound at mint time. A
    /// smaller value than the stored bound marks a superseded token.
    pub exp: i64,
}

/// Form fields accepted by the token endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenForm {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub ticket: Option<String>,
    pub action: Option<String>,
    pub token: Option<String>,
    pub token_hint_type: Option<String>,
}

/// Successful token response body
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
    pub me: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
}

/// Response to redeeming a code at the authorization endpoint itself:
/// identity only, no token.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileResponse {
    pub me: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
    pub scope: String,
}

/// Introspection response body
#[derive(Debug, Clone, Serialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<&'static str>,
}

impl IntrospectionResponse {
    pub fn inactive() -> Self {
        Self {
            active: false,
            me: None,
            client_id: None,
            scope: None,
            iat: None,
            exp: None,
            token_type: None,
        }
    }
}

/// Failures surfaced by the token surface
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("{description}")]
    Protocol {
        status: StatusCode,
        error: OAuthError,
        description: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<StorageError> for TokenError {
    fn from(err: StorageError) -> Self {
        TokenError::Engine(err.into())
    }
}

fn protocol(status: StatusCode, error: OAuthError, description: &str) -> TokenError {
    TokenError::Protocol {
        status,
        error,
        description: clean_description(description),
    }
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        match self {
            TokenError::Protocol {
                status,
                error,
                description,
            } => {
                let body = serde_json::json!({
                    "error": error.as_str(),
                    "error_description": description,
                });
                no_store((status, Json(body)).into_response())
            }
            TokenError::Engine(err) => {
                warn!(error = %err, "internal failure in token surface");
                let body = serde_json::json!({
                    "error": OAuthError::ServerError.as_str(),
                });
                no_store((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response())
            }
        }
    }
}

/// Apply the cache discipline required of every token-bearing response.
pub fn no_store(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    );
    response
        .headers_mut()
        .insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

fn join_scopes(scopes: &[String]) -> String {
    scopes.join(" ")
}

/// Profile claims for a response: stored profile data, with email
/// withheld unless the email scope was accepted.
fn profile_claims(profile_data: &Value, scopes: &[String]) -> Value {
    let mut claims = profile_data.clone();
    if !scopes.iter().any(|s| s == "email") {
        if let Some(map) = claims.as_object_mut() {
            map.remove("email");
        }
    }
    claims
}

/// Unpack and validate a code against the token-endpoint form fields.
fn validate_code_grant(
    codec: &EnvelopeCodec,
    config: &AppConfig,
    form: &TokenForm,
) -> Result<CodeGrant, TokenError> {
    let Some(code) = form.code.as_deref() else {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidRequest,
            "missing code",
        ));
    };
    let grant: CodeGrant = codec.unpack(code).map_err(|_| {
        protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidGrant,
            "code is not valid",
        )
    })?;

    if grant.code_challenge.is_none() && !config.manager.allow_legacy_non_pkce {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidGrant,
            "code lacks a PKCE binding",
        ));
    }

    if form.client_id.as_deref() != Some(grant.client_id.as_str()) {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidRequest,
            "client_id does not match code",
        ));
    }
    if form.redirect_uri.as_deref() != Some(grant.redirect_uri.as_str()) {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidRequest,
            "redirect_uri does not match code",
        ));
    }

    if let (Some(method), Some(challenge)) = (
        grant.code_challenge_method.as_deref(),
        grant.code_challenge.as_deref(),
    ) {
        let Some(verifier) = form.code_verifier.as_deref() else {
            return Err(protocol(
                StatusCode::BAD_REQUEST,
                OAuthError::InvalidRequest,
                "missing code_verifier",
            ));
        };
        if !verify_challenge(method, challenge, verifier) {
            return Err(protocol(
                StatusCode::BAD_REQUEST,
                OAuthError::InvalidGrant,
                "code_verifier does not satisfy the challenge",
            ));
        }
    }

    let age_ms = (Utc::now().timestamp() - grant.minted) * 1000;
    if age_ms > config.manager.code_validity_timeout_ms as i64 {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidGrant,
            "code has expired",
        ));
    }

    Ok(grant)
}

async fn redeem_grant(
    store: &dyn Storage,
    grant: &CodeGrant,
    is_token: bool,
) -> Result<(), TokenError> {
    let accepted = store
        .redeem_code(&RedeemCodeData {
            code_id: grant.code_id,
            created: Utc::now(),
            is_token,
            client_id: grant.client_id.clone(),
            profile: grant.profile.clone(),
            identifier: grant.identifier.clone(),
            scopes: grant.accepted_scopes.clone(),
            lifespan_seconds: grant.token_lifespan,
            refresh_lifespan_seconds: grant.refresh_lifespan,
            profile_data: grant.profile_data.clone(),
            resource: None,
        })
        .await?;
    if !accepted {
        info!(code_id = %grant.code_id, "refusing replayed code");
        return Err(protocol(
            StatusCode::FORBIDDEN,
            OAuthError::AccessDenied,
            "code has already been redeemed",
        ));
    }
    Ok(())
}

/// `grant_type=authorization_code`: redeem a code into an access
/// token, optionally refreshable.
pub async fn authorization_code_grant(
    store: &dyn Storage,
    codec: &EnvelopeCodec,
    config: &AppConfig,
    form: &TokenForm,
) -> Result<TokenResponse, TokenError> {
    let grant = validate_code_grant(codec, config, form)?;
    redeem_grant(store, &grant, true).await?;

    let now = Utc::now().timestamp();
    let exp = grant.token_lifespan.map(|s| now + s);
    let access_token = codec
        .pack(&AccessTokenPayload {
            c: grant.code_id,
            ts: now,
            exp,
        })
        .map_err(EngineError::from)?;

    let refresh_token = match grant.refresh_lifespan {
        Some(lifespan) => Some(
            codec
                .pack(&RefreshTokenPayload {
                    rc: grant.code_id,
                    ts: now,
                    exp: now + lifespan,
                })
                .map_err(EngineError::from)?,
        ),
        None => None,
    };

    let profile = grant
        .profile_data
        .as_ref()
        .filter(|_| grant.accepted_scopes.iter().any(|s| s == "profile"))
        .map(|data| profile_claims(data, &grant.accepted_scopes));

    Ok(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in: grant.token_lifespan,
        refresh_token,
        scope: join_scopes(&grant.accepted_scopes),
        me: grant.me,
        profile,
    })
}

/// Code redemption at the authorization endpoint: confirms identity
/// without issuing a token.
pub async fn profile_redemption(
    store: &dyn Storage,
    codec: &EnvelopeCodec,
    config: &AppConfig,
    form: &TokenForm,
) -> Result<ProfileResponse, TokenError> {
    let grant = validate_code_grant(codec, config, form)?;
    redeem_grant(store, &grant, false).await?;

    let profile = grant
        .profile_data
        .as_ref()
        .filter(|_| grant.accepted_scopes.iter().any(|s| s == "profile"))
        .map(|data| profile_claims(data, &grant.accepted_scopes));

    Ok(ProfileResponse {
        me: grant.me,
        profile,
        scope: join_scopes(&grant.accepted_scopes),
    })
}

/// `grant_type=refresh_token`: roll the token forward, optionally
/// narrowing its scope set.
pub async fn refresh_token_grant(
    store: &dyn Storage,
    codec: &EnvelopeCodec,
    form: &TokenForm,
) -> Result<TokenResponse, TokenError> {
    let Some(refresh_token) = form.refresh_token.as_deref() else {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidRequest,
            "missing refresh_token",
        ));
    };
    let payload: RefreshTokenPayload = codec.unpack(refresh_token).map_err(|_| {
        protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidGrant,
            "refresh_token is not valid",
        )
    })?;

    let Some(record) = store.token_get_by_code_id(&payload.rc).await? else {
        return Err(protocol(
            StatusCode::NOT_FOUND,
            OAuthError::InvalidGrant,
            "no such token",
        ));
    };
    if record.is_revoked {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidGrant,
            "token has been revoked",
        ));
    }

    let now = Utc::now();
    let Some(refresh_expires) = record.refresh_expires else {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidGrant,
            "token is not refreshable",
        ));
    };
    if refresh_expires <= now {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidGrant,
            "refresh window has expired",
        ));
    }
    // A refresh envelope minted before the stored bound advanced has
    // already been used.
    if payload.exp < refresh_expires.timestamp() {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidGrant,
            "refresh token has already been refreshed",
        ));
    }

    if form.client_id.as_deref() != Some(record.client_id.as_str()) {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidRequest,
            "client_id does not match token",
        ));
    }

    // An optional scope field may only narrow the stored set.
    let remove_scopes = match form.scope.as_deref() {
        None => Vec::new(),
        Some(raw) => {
            let requested = crate::scopes::split_scope_string(raw);
            if requested.iter().any(|s| !record.scopes.contains(s)) {
                return Err(protocol(
                    StatusCode::BAD_REQUEST,
                    OAuthError::InvalidScope,
                    "scope may only narrow the existing grant",
                ));
            }
            record
                .scopes
                .iter()
                .filter(|s| !requested.contains(s))
                .cloned()
                .collect()
        }
    };

    let Some(outcome) = store
        .refresh_code(&payload.rc, now, &remove_scopes)
        .await?
    else {
        return Err(StorageError::UnexpectedResult.into());
    };

    let scopes = outcome.scopes.unwrap_or_else(|| record.scopes.clone());
    let now_ts = now.timestamp();
    let access_token = codec
        .pack(&AccessTokenPayload {
            c: payload.rc,
            ts: now_ts,
            exp: Some(outcome.expires.timestamp()),
        })
        .map_err(EngineError::from)?;
    let new_refresh = codec
        .pack(&RefreshTokenPayload {
            rc: payload.rc,
            ts: now_ts,
            exp: outcome.refresh_expires.timestamp(),
        })
        .map_err(EngineError::from)?;

    let profile = record
        .profile_data
        .as_ref()
        .filter(|_| scopes.iter().any(|s| s == "profile"))
        .map(|data| profile_claims(data, &scopes));

    Ok(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in: Some(outcome.expires.timestamp() - now_ts),
        refresh_token: Some(new_refresh),
        scope: join_scopes(&scopes),
        me: record.profile,
        profile,
    })
}

/// `grant_type=ticket`: redeem a proactively delivered ticket into an
/// access token for the named resource.
pub async fn ticket_grant(
    store: &dyn Storage,
    codec: &EnvelopeCodec,
    form: &TokenForm,
) -> Result<TokenResponse, TokenError> {
    let Some(ticket) = form.ticket.as_deref() else {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidRequest,
            "missing ticket",
        ));
    };
    let payload: TicketPayload = codec.unpack(ticket).map_err(|_| {
        protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidGrant,
            "ticket is not valid",
        )
    })?;

    let now = Utc::now();
    if payload.exp < now.timestamp() {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidGrant,
            "ticket has expired",
        ));
    }

    let accepted = store
        .redeem_code(&RedeemCodeData {
            code_id: payload.c,
            created: now,
            is_token: true,
            client_id: payload.sub.clone(),
            profile: payload.profile.clone(),
            identifier: payload.ident.clone(),
            scopes: payload.scope.clone(),
            lifespan_seconds: None,
            refresh_lifespan_seconds: None,
            profile_data: None,
            resource: Some(payload.res.clone()),
        })
        .await?;
    if !accepted {
        info!(code_id = %payload.c, "refusing replayed ticket");
        return Err(protocol(
            StatusCode::FORBIDDEN,
            OAuthError::AccessDenied,
            "ticket has already been redeemed",
        ));
    }

    let access_token = codec
        .pack(&AccessTokenPayload {
            c: payload.c,
            ts: now.timestamp(),
            exp: None,
        })
        .map_err(EngineError::from)?;

    store
        .ticket_redeemed(&RedeemedTicketData {
            ticket: ticket.to_string(),
            resource: payload.res.clone(),
            subject: payload.sub.clone(),
            iss: Some(payload.iss.clone()),
            token: access_token.clone(),
        })
        .await?;

    Ok(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in: None,
        refresh_token: None,
        scope: join_scopes(&payload.scope),
        me: payload.profile,
        profile: None,
    })
}

/// Identify which kind of token envelope a revocation request carries.
fn unpack_revocable(codec: &EnvelopeCodec, token: &str) -> Option<(Uuid, bool)> {
    let value: Value = codec.unpack(token).ok()?;
    if let Some(c) = value.get("c").and_then(|v| v.as_str()) {
        return Uuid::parse_str(c).ok().map(|id| (id, false));
    }
    if let Some(rc) = value.get("rc").and_then(|v| v.as_str()) {
        return Uuid::parse_str(rc).ok().map(|id| (id, true));
    }
    None
}

/// Revoke an access token (by `c`) or a token's refreshability (by
/// `rc`). Succeeds with empty 200; unknown rows are 404.
pub async fn revoke(
    store: &dyn Storage,
    codec: &EnvelopeCodec,
    token: &str,
) -> Result<(), TokenError> {
    let Some((code_id, is_refresh)) = unpack_revocable(codec, token) else {
        return Err(protocol(
            StatusCode::NOT_FOUND,
            OAuthError::InvalidGrant,
            "token is not valid",
        ));
    };

    let result = if is_refresh {
        store.token_refresh_revoke_by_code_id(&code_id).await
    } else {
        store.token_revoke_by_code_id(&code_id).await
    };
    match result {
        Ok(()) => {
            info!(code_id = %code_id, refresh = is_refresh, "token revoked");
            Ok(())
        }
        Err(StorageError::UnexpectedResult) => Err(protocol(
            StatusCode::NOT_FOUND,
            OAuthError::InvalidGrant,
            "no such token",
        )),
        Err(err) => Err(err.into()),
    }
}

/// Legacy Bearer validation body
#[derive(Debug, Clone, Serialize)]
pub struct BearerValidation {
    pub me: String,
    pub client_id: String,
    pub scope: Vec<String>,
}

/// Validate an `Authorization: Bearer` header against the store.
pub async fn validate_bearer(
    store: &dyn Storage,
    codec: &EnvelopeCodec,
    authorization: &str,
) -> Result<BearerValidation, TokenError> {
    let unauthorized = || protocol(
        StatusCode::UNAUTHORIZED,
        OAuthError::InvalidGrant,
        "token is not valid",
    );

    let Some(token) = authorization.strip_prefix("Bearer ") else {
        return Err(unauthorized());
    };
    let payload: AccessTokenPayload =
        codec.unpack(token.trim()).map_err(|_| unauthorized())?;

    let Some(record) = store.token_get_by_code_id(&payload.c).await? else {
        return Err(unauthorized());
    };
    if !record.is_active(Utc::now()) {
        debug!(code_id = %payload.c, "bearer token inactive");
        return Err(unauthorized());
    }

    Ok(BearerValidation {
        me: record.profile,
        client_id: record.client_id,
        scope: record.scopes,
    })
}

/// Resource-server introspection of a token or ticket.
pub async fn introspect(
    store: &dyn Storage,
    codec: &EnvelopeCodec,
    form: &TokenForm,
) -> Result<IntrospectionResponse, TokenError> {
    let Some(token) = form.token.as_deref() else {
        return Err(protocol(
            StatusCode::BAD_REQUEST,
            OAuthError::InvalidRequest,
            "missing token",
        ));
    };
    let now = Utc::now();

    if form.token_hint_type.as_deref() == Some("ticket") {
        let Ok(payload) = codec.unpack::<TicketPayload>(token) else {
            return Ok(IntrospectionResponse::inactive());
        };
        if payload.exp < now.timestamp() {
            return Ok(IntrospectionResponse::inactive());
        }
        // A redeemed ticket's code id already has a row; the ticket
        // itself can no longer be used.
        if store.token_get_by_code_id(&payload.c).await?.is_some() {
            return Ok(IntrospectionResponse::inactive());
        }
        return Ok(IntrospectionResponse {
            active: true,
            me: Some(payload.profile),
            client_id: None,
            scope: Some(join_scopes(&payload.scope)),
            iat: None,
            exp: Some(payload.exp),
            token_type: Some("ticket"),
        });
    }

    let Ok(payload) = codec.unpack::<AccessTokenPayload>(token) else {
        return Ok(IntrospectionResponse::inactive());
    };
    let Some(record) = store.token_get_by_code_id(&payload.c).await? else {
        return Ok(IntrospectionResponse::inactive());
    };
    if !record.is_active(now) {
        return Ok(IntrospectionResponse::inactive());
    }

    Ok(IntrospectionResponse {
        active: true,
        me: Some(record.profile),
        client_id: Some(record.client_id),
        scope: Some(join_scopes(&record.scopes)),
        iat: Some(record.created.timestamp()),
        exp: record.expires.map(|e| e.timestamp()),
        token_type: Some("Bearer"),
    })
}

/// Userinfo: profile claims for a token carrying the profile scope.
pub async fn userinfo(
    store: &dyn Storage,
    codec: &EnvelopeCodec,
    token: &str,
) -> Result<Value, TokenError> {
    let unauthorized = || protocol(
        StatusCode::UNAUTHORIZED,
        OAuthError::InvalidGrant,
        "token is not valid",
    );

    let payload: AccessTokenPayload = codec.unpack(token).map_err(|_| unauthorized())?;
    let Some(record) = store.token_get_by_code_id(&payload.c).await? else {
        return Err(unauthorized());
    };
    if !record.is_active(Utc::now()) {
        return Err(unauthorized());
    }
    if !record.scopes.iter().any(|s| s == "profile") {
        return Err(protocol(
            StatusCode::FORBIDDEN,
            OAuthError::InvalidScope,
            "token does not carry the profile scope",
        ));
    }

    let data = record.profile_data.unwrap_or_else(|| serde_json::json!({}));
    Ok(profile_claims(&data, &record.scopes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStorage;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use sha2::{Digest, Sha256};

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

    fn challenge() -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(VERIFIER.as_bytes()))
    }

    fn config() -> AppConfig {
        serde_json::from_str(
            r#"{
                "encryption_secret": "test-secret",
                "db": { "connection_string": "sqlite::memory:" },
                "dingus": { "self_base_url": "https://auth.example.com/" }
            }"#,
        )
        .unwrap()
    }

    async fn store() -> SqliteStorage {
        let store = SqliteStorage::connect("sqlite::memory:", "off").await.unwrap();
        store.initialize().await.unwrap();
        store
    }

    fn grant(lifespan: Option<i64>, refresh: Option<i64>) -> CodeGrant {
        CodeGrant {
            code_id: Uuid::new_v4(),
            code_challenge_method: Some("S256".to_string()),
            code_challenge: Some(challenge()),
            client_id: "https://app.example/".to_string(),
            redirect_uri: "https://app.example/cb".to_string(),
            accepted_scopes: vec!["profile".to_string(), "email".to_string()],
            token_lifespan: lifespan,
            refresh_lifespan: refresh,
            me: "https://alice.example/".to_string(),
            profile: "https://alice.example/".to_string(),
            identifier: "alice".to_string(),
            minted: Utc::now().timestamp(),
            profile_data: Some(serde_json::json!({
                "name": "Alice",
                "email": "alice@example.com"
            })),
        }
    }

    fn form_for(codec: &EnvelopeCodec, grant: &CodeGrant) -> TokenForm {
        TokenForm {
            grant_type: Some("authorization_code".to_string()),
            code: Some(codec.pack(grant).unwrap()),
            client_id: Some(grant.client_id.clone()),
            redirect_uri: Some(grant.redirect_uri.clone()),
            code_verifier: Some(VERIFIER.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_authorization_code_grant_happy_path() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let grant = grant(None, None);
        let form = form_for(&codec, &grant);

        let response = authorization_code_grant(&store, &codec, &config(), &form)
            .await
            .unwrap();

        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.scope, "profile email");
        assert_eq!(response.me, "https://alice.example/");
        assert!(response.expires_in.is_none());
        assert!(response.refresh_token.is_none());
        // email scope accepted, so the claim is disclosed.
        assert_eq!(response.profile.unwrap()["email"], "alice@example.com");

        // The access token resolves to an active row.
        let validated = validate_bearer(
            &store,
            &codec,
            &format!("Bearer {}", response.access_token),
        )
        .await
        .unwrap();
        assert_eq!(validated.me, "https://alice.example/");
    }

    #[tokio::test]
    async fn test_replayed_code_is_refused() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let grant = grant(None, None);
        let form = form_for(&codec, &grant);

        authorization_code_grant(&store, &codec, &config(), &form)
            .await
            .unwrap();
        match authorization_code_grant(&store, &codec, &config(), &form).await {
            Err(TokenError::Protocol { status, .. }) => {
                assert_eq!(status, StatusCode::FORBIDDEN)
            }
            other => panic!("expected 403, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mismatched_redirect_uri_is_refused() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let grant = grant(None, None);
        let mut form = form_for(&codec, &grant);
        form.redirect_uri = Some("https://evil.example/cb".to_string());

        match authorization_code_grant(&store, &codec, &config(), &form).await {
            Err(TokenError::Protocol { status, error, .. }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(error, OAuthError::InvalidRequest);
            }
            other => panic!("expected 400, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_verifier_is_refused() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let grant = grant(None, None);
        let mut form = form_for(&codec, &grant);
        form.code_verifier = Some("wrong-verifier-wrong-verifier-wrong-verifier".to_string());

        match authorization_code_grant(&store, &codec, &config(), &form).await {
            Err(TokenError::Protocol { error, .. }) => {
                assert_eq!(error, OAuthError::InvalidGrant)
            }
            other => panic!("expected invalid_grant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_code_is_refused() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let mut stale = grant(None, None);
        stale.minted = Utc::now().timestamp() - 3600;
        let form = form_for(&codec, &stale);

        match authorization_code_grant(&store, &codec, &config(), &form).await {
            Err(TokenError::Protocol { error, .. }) => {
                assert_eq!(error, OAuthError::InvalidGrant)
            }
            other => panic!("expected invalid_grant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_flow_rolls_tokens() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let grant = grant(Some(86_400), Some(604_800));
        let form = form_for(&codec, &grant);

        let first = authorization_code_grant(&store, &codec, &config(), &form)
            .await
            .unwrap();
        assert_eq!(first.expires_in, Some(86_400));
        let first_refresh = first.refresh_token.unwrap();

        let refresh_form = TokenForm {
            grant_type: Some("refresh_token".to_string()),
            refresh_token: Some(first_refresh.clone()),
            client_id: Some(grant.client_id.clone()),
            ..Default::default()
        };
        let second = refresh_token_grant(&store, &codec, &refresh_form)
            .await
            .unwrap();
        assert!(second.refresh_token.is_some());
        assert_eq!(second.scope, "email profile");

        // The superseded refresh token no longer works.
        match refresh_token_grant(&store, &codec, &refresh_form).await {
            Err(TokenError::Protocol { error, .. }) => {
                assert_eq!(error, OAuthError::InvalidGrant)
            }
            other => panic!("expected invalid_grant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_narrows_scopes() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let grant = grant(Some(86_400), Some(604_800));
        let form = form_for(&codec, &grant);

        let first = authorization_code_grant(&store, &codec, &config(), &form)
            .await
            .unwrap();

        let refresh_form = TokenForm {
            grant_type: Some("refresh_token".to_string()),
            refresh_token: first.refresh_token,
            client_id: Some(grant.client_id.clone()),
            scope: Some("profile".to_string()),
            ..Default::default()
        };
        let narrowed = refresh_token_grant(&store, &codec, &refresh_form)
            .await
            .unwrap();
        assert_eq!(narrowed.scope, "profile");
        // email gone from the stored row, so userinfo withholds it.
        let claims = userinfo(&store, &codec, &narrowed.access_token).await.unwrap();
        assert!(claims.get("email").is_none());

        // Widening back is refused.
        let widen_form = TokenForm {
            grant_type: Some("refresh_token".to_string()),
            refresh_token: narrowed.refresh_token,
            client_id: Some(grant.client_id.clone()),
            scope: Some("profile email".to_string()),
            ..Default::default()
        };
        match refresh_token_grant(&store, &codec, &widen_form).await {
            Err(TokenError::Protocol { error, .. }) => {
                assert_eq!(error, OAuthError::InvalidScope)
            }
            other => panic!("expected invalid_scope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_unknown_token_is_404() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let refresh_form = TokenForm {
            grant_type: Some("refresh_token".to_string()),
            refresh_token: Some(
                codec
                    .pack(&RefreshTokenPayload {
                        rc: Uuid::new_v4(),
                        ts: 0,
                        exp: Utc::now().timestamp() + 1000,
                    })
                    .unwrap(),
            ),
            client_id: Some("https://app.example/".to_string()),
            ..Default::default()
        };
        match refresh_token_grant(&store, &codec, &refresh_form).await {
            Err(TokenError::Protocol { status, .. }) => {
                assert_eq!(status, StatusCode::NOT_FOUND)
            }
            other => panic!("expected 404, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_revocation() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let grant = grant(Some(86_400), Some(604_800));
        let form = form_for(&codec, &grant);
        let response = authorization_code_grant(&store, &codec, &config(), &form)
            .await
            .unwrap();

        revoke(&store, &codec, &response.access_token).await.unwrap();
        let record = store
            .token_get_by_code_id(&grant.code_id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_revoked);

        match validate_bearer(
            &store,
            &codec,
            &format!("Bearer {}", response.access_token),
        )
        .await
        {
            Err(TokenError::Protocol { status, .. }) => {
                assert_eq!(status, StatusCode::UNAUTHORIZED)
            }
            other => panic!("expected 401, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_revocation_keeps_access_token() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let grant = grant(Some(86_400), Some(604_800));
        let form = form_for(&codec, &grant);
        let response = authorization_code_grant(&store, &codec, &config(), &form)
            .await
            .unwrap();

        revoke(&store, &codec, &response.refresh_token.clone().unwrap())
            .await
            .unwrap();

        // Access token still validates; refresh no longer possible.
        validate_bearer(
            &store,
            &codec,
            &format!("Bearer {}", response.access_token),
        )
        .await
        .unwrap();

        let refresh_form = TokenForm {
            grant_type: Some("refresh_token".to_string()),
            refresh_token: response.refresh_token,
            client_id: Some(grant.client_id.clone()),
            ..Default::default()
        };
        assert!(refresh_token_grant(&store, &codec, &refresh_form).await.is_err());
    }

    #[tokio::test]
    async fn test_revoking_garbage_is_404() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        match revoke(&store, &codec, "not-a-token").await {
            Err(TokenError::Protocol { status, .. }) => {
                assert_eq!(status, StatusCode::NOT_FOUND)
            }
            other => panic!("expected 404, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_introspection_states() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let grant = grant(Some(86_400), None);
        let form = form_for(&codec, &grant);
        let response = authorization_code_grant(&store, &codec, &config(), &form)
            .await
            .unwrap();

        let active = introspect(
            &store,
            &codec,
            &TokenForm {
                token: Some(response.access_token.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(active.active);
        assert_eq!(active.me.as_deref(), Some("https://alice.example/"));
        assert!(active.exp.is_some());

        revoke(&store, &codec, &response.access_token).await.unwrap();
        let inactive = introspect(
            &store,
            &codec,
            &TokenForm {
                token: Some(response.access_token),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(!inactive.active);

        let garbage = introspect(
            &store,
            &codec,
            &TokenForm {
                token: Some("garbage".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(!garbage.active);
    }

    #[tokio::test]
    async fn test_userinfo_requires_profile_scope() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let mut bare = grant(None, None);
        bare.accepted_scopes = vec!["create".to_string()];
        let form = form_for(&codec, &bare);
        let response = authorization_code_grant(&store, &codec, &config(), &form)
            .await
            .unwrap();

        match userinfo(&store, &codec, &response.access_token).await {
            Err(TokenError::Protocol { status, .. }) => {
                assert_eq!(status, StatusCode::FORBIDDEN)
            }
            other => panic!("expected 403, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_profile_redemption_issues_no_token() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let grant = grant(None, None);
        let form = form_for(&codec, &grant);

        let response = profile_redemption(&store, &codec, &config(), &form)
            .await
            .unwrap();
        assert_eq!(response.me, "https://alice.example/");
        assert_eq!(response.scope, "profile email");

        let record = store
            .token_get_by_code_id(&grant.code_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.is_token);
    }

    fn ticket_payload(exp: i64) -> TicketPayload {
        TicketPayload {
            c: Uuid::new_v4(),
            iss: "https://auth.example.com/".to_string(),
            exp,
            sub: "https://bob.example/".to_string(),
            res: "https://alice.example/feed".to_string(),
            scope: vec!["read".to_string()],
            ident: "alice".to_string(),
            profile: "https://alice.example/".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ticket_introspection_by_hint() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let sealed = codec
            .pack(&ticket_payload(Utc::now().timestamp() + 600))
            .unwrap();

        let form = TokenForm {
            token: Some(sealed.clone()),
            token_hint_type: Some("ticket".to_string()),
            ..Default::default()
        };
        let response = introspect(&store, &codec, &form).await.unwrap();
        assert!(response.active);
        assert_eq!(response.me.as_deref(), Some("https://alice.example/"));
        assert_eq!(response.scope.as_deref(), Some("read"));
        assert_eq!(response.token_type, Some("ticket"));
        assert!(response.client_id.is_none());

        // Without the hint the same string is treated as an access
        // token, which it is not.
        let unhinted = introspect(
            &store,
            &codec,
            &TokenForm {
                token: Some(sealed.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(!unhinted.active);

        // Redemption spends the ticket; introspection then reports it
        // inactive.
        ticket_grant(
            &store,
            &codec,
            &TokenForm {
                grant_type: Some("ticket".to_string()),
                ticket: Some(sealed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let spent = introspect(&store, &codec, &form).await.unwrap();
        assert!(!spent.active);
    }

    #[tokio::test]
    async fn test_expired_ticket_introspection_is_inactive() {
        let store = store().await;
        let codec = EnvelopeCodec::new("test-secret");
        let sealed = codec
            .pack(&ticket_payload(Utc::now().timestamp() - 10))
            .unwrap();

        let form = TokenForm {
            token: Some(sealed),
            token_hint_type: Some("ticket".to_string()),
            ..Default::default()
        };
        let response = introspect(&store, &codec, &form).await.unwrap();
        assert!(!response.active);
    }
}
