//! Authorization state machine.
//!
//! Drives a request from `GET /authorize` through the consent page to a
//! redeemable code. No per-request state is held server-side: the
//! binding between the two steps is a sealed continuation envelope, and
//! the binding between consent and the token endpoint is a sealed code
//! envelope whose `code_id` was fixed when the request was first
//! validated.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::envelope::EnvelopeCodec;
use crate::errors::{EngineError, ErrorAccumulator, OAuthError, ResolvedError};
use crate::fetch::{ClientMetadata, Fetcher, ProfileInfo};
use crate::scopes;
use crate::store::{ScopeDetails, Storage};

/// Query parameters of an authorization request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeParams {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub scope: Option<String>,
    pub me: Option<String>,
}

/// Everything carried from the authorization request into consent.
/// `id` becomes the eventual `code_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Continuation {
    pub id: Uuid,
    pub client_id: String,
    pub client_identifier: Option<ClientMetadata>,
    pub redirect_uri: String,
    pub response_type: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,
    pub profiles: Vec<String>,
    pub requested_scopes: Vec<String>,
    pub authentication_id: String,
}

/// Everything carried from consent into the token endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodeGrant {
    pub code_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    pub client_id: String,
    pub redirect_uri: String,
    pub accepted_scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_lifespan: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_lifespan: Option<i64>,
    pub me: String,
    pub profile: String,
    pub identifier: String,
    /// Epoch seconds when consent was given; bounds code validity.
    pub minted: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_data: Option<serde_json::Value>,
}

/// A scope offered on the consent page
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeChoice {
    pub scope: String,
    pub description: String,
    pub checked: bool,
}

/// Context handed to the consent page renderer
#[derive(Debug, Clone)]
pub struct ConsentContext {
    pub continuation: String,
    pub client_id: String,
    pub client_name: Option<String>,
    pub profiles: Vec<String>,
    pub preselected_me: Option<String>,
    pub scope_choices: Vec<ScopeChoice>,
}

/// Outcome of processing an authorization request
#[derive(Debug)]
pub enum AuthorizeOutcome {
    /// The request is fundamentally unusable; respond 400 with a page.
    BadRequest(Vec<String>),
    /// Errors were collected after the redirect binding was vetted.
    ErrorRedirect(Url),
    /// Render the consent page.
    Consent(Box<ConsentContext>),
}

/// Outcome of processing a consent submission
#[derive(Debug)]
pub enum ConsentOutcome {
    BadRequest(Vec<String>),
    /// Redirect back to the client, carrying either an error or a code.
    Redirect(Url),
}

fn challenge_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("challenge regex"))
}

/// Validate a client identifier URL per the IndieAuth rules.
pub fn validate_client_id(raw: &str) -> Result<Url, String> {
    // The URL parser resolves dot segments, so the raw string is what
    // must be inspected for them.
    if raw.contains("/../") || raw.ends_with("/..") {
        return Err("client_id path must not contain dot segments".to_string());
    }
    let url = Url::parse(raw).map_err(|_| "client_id is not a valid URL".to_string())?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err("client_id scheme must be http or https".to_string());
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err("client_id must not contain userinfo".to_string());
    }
    if url.fragment().is_some() {
        return Err("client_id must not contain a fragment".to_string());
    }
    let Some(host) = url.host_str() else {
        return Err("client_id has no host".to_string());
    };
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        if !v4.is_loopback() {
            return Err("client_id host must not be an IP address".to_string());
        }
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(v6) = bare.parse::<Ipv6Addr>() {
        if !v6.is_loopback() {
            return Err("client_id host must not be an IP address".to_string());
        }
    }
    Ok(url)
}

/// A redirect target is acceptable when it shares scheme, host, and
/// port with the client identifier, or is explicitly advertised by it.
pub fn redirect_uri_allowed(client_id: &Url, redirect_uri: &Url, alternates: &[String]) -> bool {
    let same_origin = client_id.scheme() == redirect_uri.scheme()
        && client_id.host_str() == redirect_uri.host_str()
        && client_id.port_or_known_default() == redirect_uri.port_or_known_default();
    same_origin || alternates.iter().any(|alt| alt == redirect_uri.as_str())
}

/// PKCE challenge methods this server accepts. `SHA256` is the legacy
/// spelling of `S256` and means the same computation.
pub fn challenge_method_valid(method: &str) -> bool {
    method == "S256" || method == "SHA256"
}

pub fn challenge_format_valid(challenge: &str) -> bool {
    challenge_re().is_match(challenge)
}

/// Verify a code verifier against its challenge: base64url of the
/// SHA-256 digest, no padding.
pub fn verify_challenge(method: &str, challenge: &str, verifier: &str) -> bool {
    if !challenge_method_valid(method) {
        return false;
    }
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest) == challenge
}

/// Map a consent lifespan choice to seconds. Anything unrecognized or
/// non-positive means non-expiring.
pub fn parse_lifespan(choice: Option<&str>, custom_seconds: Option<&str>) -> Option<i64> {
    match choice {
        Some("1d") => Some(86_400),
        Some("1w") => Some(604_800),
        Some("1m") => Some(2_678_400),
        Some("custom") => custom_seconds
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .filter(|s| *s > 0),
        _ => None,
    }
}

/// Append error parameters to a redirect target.
fn error_redirect(redirect_uri: &Url, state: Option<&str>, resolved: &ResolvedError) -> Url {
    let mut url = redirect_uri.clone();
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
        pairs.append_pair("error", resolved.error.as_str());
        pairs.append_pair("error_description", &resolved.description());
    }
    url
}

/// Process `GET /authorize` for an authenticated identifier.
#[allow(clippy::too_many_arguments)]
pub async fn authorization_request(
    store: &dyn Storage,
    codec: &EnvelopeCodec,
    fetcher: &Fetcher,
    config: &AppConfig,
    identifier: &str,
    params: &AuthorizeParams,
) -> Result<AuthorizeOutcome, EngineError> {
    let mut errors = ErrorAccumulator::new();

    // client_id and redirect_uri gate everything: without a vetted
    // redirect target there is nowhere safe to send errors.
    let client_id = match params.client_id.as_deref() {
        None => {
            return Ok(AuthorizeOutcome::BadRequest(vec![
                "missing client_id".to_string()
            ]))
        }
        Some(raw) => match validate_client_id(raw) {
            Ok(url) => url,
            Err(description) => return Ok(AuthorizeOutcome::BadRequest(vec![description])),
        },
    };

    let client_metadata = match fetcher.client_metadata(&client_id).await {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            warn!(client_id = %client_id, error = %err, "client identifier fetch failed");
            errors.add(
                OAuthError::InvalidRequest,
                "could not retrieve client identifier",
            );
            None
        }
    };

    let redirect_uri = match params.redirect_uri.as_deref().map(Url::parse) {
        None => {
            return Ok(AuthorizeOutcome::BadRequest(vec![
                "missing redirect_uri".to_string()
            ]))
        }
        Some(Err(_)) => {
            return Ok(AuthorizeOutcome::BadRequest(vec![
                "redirect_uri is not a valid URL".to_string(),
            ]))
        }
        Some(Ok(url)) => url,
    };
    let alternates = client_metadata
        .as_ref()
        .map(|m| m.redirect_uris.as_slice())
        .unwrap_or_default();
    if !redirect_uri_allowed(&client_id, &redirect_uri, alternates) {
        return Ok(AuthorizeOutcome::BadRequest(vec![format!(
            "redirect_uri {redirect_uri} is not valid for client {client_id}"
        )]));
    }

    match params.response_type.as_deref() {
        Some("code") => {}
        _ => errors.add(
            OAuthError::UnsupportedResponseType,
            "response_type must be code",
        ),
    }

    if params.state.is_none() {
        errors.add(OAuthError::InvalidRequest, "missing state");
    }

    let mut code_challenge_method = None;
    let mut code_challenge = None;
    match (
        params.code_challenge_method.as_deref(),
        params.code_challenge.as_deref(),
    ) {
        (Some(method), Some(challenge)) => {
            if !challenge_method_valid(method) {
                errors.add(
                    OAuthError::InvalidRequest,
                    "unsupported code_challenge_method",
                );
            } else if !challenge_format_valid(challenge) {
                errors.add(OAuthError::InvalidRequest, "malformed code_challenge");
            } else {
                code_challenge_method = Some(method.to_string());
                code_challenge = Some(challenge.to_string());
            }
        }
        (None, None) => {
            if config.manager.allow_legacy_non_pkce {
                warn!(client_id = %client_id, "accepting authorization request without PKCE");
            } else {
                errors.add(OAuthError::InvalidRequest, "PKCE parameters are required");
            }
        }
        _ => errors.add(
            OAuthError::InvalidRequest,
            "code_challenge and code_challenge_method must both be provided",
        ),
    }

    let requested_scopes = params
        .scope
        .as_deref()
        .map(scopes::split_scope_string)
        .unwrap_or_default();
    if scopes::email_without_profile(&requested_scopes) {
        errors.add(
            OAuthError::InvalidScope,
            "email scope requires profile scope",
        );
    }

    let profiles_scopes = store.profiles_scopes_by_identifier(identifier).await?;
    if profiles_scopes.profiles.is_empty() {
        errors.add(
            OAuthError::AccessDenied,
            "identifier has no authorizable profiles",
        );
    }

    let me = params.me.as_ref().filter(|me| {
        let known = profiles_scopes.profiles.iter().any(|p| p == *me);
        if !known {
            debug!(me = %me, "requested me is not one of the identifier's profiles");
        }
        known
    });

    if !errors.is_empty() {
        let resolved = errors.resolve().expect("accumulator is non-empty");
        info!(
            client_id = %client_id,
            error = %resolved.error,
            "refusing authorization request"
        );
        return Ok(AuthorizeOutcome::ErrorRedirect(error_redirect(
            &redirect_uri,
            params.state.as_deref(),
            &resolved,
        )));
    }

    let continuation = Continuation {
        id: Uuid::new_v4(),
        client_id: client_id.to_string(),
        client_identifier: client_metadata.clone(),
        redirect_uri: redirect_uri.to_string(),
        response_type: "code".to_string(),
        state: params.state.clone().unwrap_or_default(),
        code_challenge_method,
        code_challenge,
        me: me.cloned(),
        profiles: profiles_scopes.profiles.clone(),
        requested_scopes: requested_scopes.clone(),
        authentication_id: identifier.to_string(),
    };
    let sealed = codec.pack(&continuation)?;

    let scope_choices = scope_choices(
        &requested_scopes,
        &profiles_scopes
            .scope_index
            .iter()
            .map(|(scope, usage)| (scope.clone(), usage.details.clone()))
            .collect::<Vec<_>>(),
    );

    Ok(AuthorizeOutcome::Consent(Box::new(ConsentContext {
        continuation: sealed,
        client_id: client_id.to_string(),
        client_name: client_metadata.and_then(|m| m.name),
        profiles: profiles_scopes.profiles,
        preselected_me: me.cloned(),
        scope_choices,
    })))
}

/// Merge requested scopes with the identifier's default-offered scopes
/// into one checkbox list. Requested scopes come first and pre-checked.
fn scope_choices(requested: &[String], known: &[(String, ScopeDetails)]) -> Vec<ScopeChoice> {
    let mut choices: Vec<ScopeChoice> = requested
        .iter()
        .map(|scope| ScopeChoice {
            scope: scope.clone(),
            description: known
                .iter()
                .find(|(name, _)| name == scope)
                .map(|(_, details)| details.description.clone())
                .unwrap_or_default(),
            checked: true,
        })
        .collect();
    for (scope, details) in known {
        if !choices.iter().any(|c| &c.scope == scope) {
            choices.push(ScopeChoice {
                scope: scope.clone(),
                description: details.description.clone(),
                checked: false,
            });
        }
    }
    for builtin in ["profile", "email"] {
        if !choices.iter().any(|c| c.scope == builtin) {
            choices.push(ScopeChoice {
                scope: builtin.to_string(),
                description: String::new(),
                checked: false,
            });
        }
    }
    choices
}

/// Decoded consent form
#[derive(Debug, Clone, Default)]
pub struct ConsentForm {
    pub session: Option<String>,
    pub accept: Option<String>,
    pub accepted_scopes: Vec<String>,
    pub ad_hoc_scopes: Option<String>,
    pub me: Option<String>,
    pub expires: Option<String>,
    pub expires_seconds: Option<String>,
    pub refresh: Option<String>,
    pub refresh_seconds: Option<String>,
}

impl ConsentForm {
    /// Build from decoded form pairs; repeated `accepted_scopes` keys
    /// accumulate.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut form = ConsentForm::default();
        for (key, value) in pairs {
            match key.as_str() {
                "session" => form.session = Some(value),
                "accept" => form.accept = Some(value),
                "accepted_scopes" | "accepted_scopes[]" => form.accepted_scopes.push(value),
                "ad_hoc_scopes" => form.ad_hoc_scopes = Some(value),
                "me" => form.me = Some(value),
                "expires" => form.expires = Some(value),
                "expires-seconds" => form.expires_seconds = Some(value),
                "refresh" => form.refresh = Some(value),
                "refresh-seconds" => form.refresh_seconds = Some(value),
                other => debug!(field = %other, "ignoring unknown consent field"),
            }
        }
        form
    }
}

/// Process a consent submission into a redirect back to the client.
/// When an authenticated identifier is known it must match the one the
/// continuation was minted for.
pub async fn consent_submission(
    codec: &EnvelopeCodec,
    fetcher: &Fetcher,
    config: &AppConfig,
    authenticated: Option<&str>,
    form: &ConsentForm,
) -> Result<ConsentOutcome, EngineError> {
    let continuation: Continuation = match form
        .session
        .as_deref()
        .and_then(|sealed| codec.unpack(sealed).ok())
    {
        Some(continuation) => continuation,
        None => {
            return Ok(ConsentOutcome::BadRequest(vec![
                "consent session is missing or invalid".to_string(),
            ]))
        }
    };
    if continuation.client_id.is_empty() || continuation.redirect_uri.is_empty() {
        return Ok(ConsentOutcome::BadRequest(vec![
            "consent session lacks client binding".to_string(),
        ]));
    }
    let Ok(redirect_uri) = Url::parse(&continuation.redirect_uri) else {
        return Ok(ConsentOutcome::BadRequest(vec![
            "consent session redirect target is invalid".to_string(),
        ]));
    };
    if let Some(identifier) = authenticated {
        if identifier != continuation.authentication_id {
            return Ok(ConsentOutcome::BadRequest(vec![
                "consent session does not belong to this login".to_string(),
            ]));
        }
    }

    let mut errors = ErrorAccumulator::new();

    if form.accept.as_deref() != Some("true") {
        errors.add(OAuthError::AccessDenied, "operator denied the request");
    }

    let mut accepted = scopes::filter_scopes(&form.accepted_scopes);
    if let Some(ad_hoc) = form.ad_hoc_scopes.as_deref() {
        for scope in scopes::split_scope_string(ad_hoc) {
            if !accepted.contains(&scope) {
                accepted.push(scope);
            }
        }
    }
    if scopes::strip_email_without_profile(&mut accepted) {
        info!("email scope accepted without profile; removed");
    }

    let me = match form.me.as_deref() {
        Some(me) if continuation.profiles.iter().any(|p| p == me) => Some(me.to_string()),
        Some(_) => {
            errors.add(
                OAuthError::InvalidRequest,
                "selected profile does not belong to this identifier",
            );
            None
        }
        None => {
            errors.add(OAuthError::InvalidRequest, "no profile selected");
            None
        }
    };

    let mut profile_data = None;
    if let Some(me) = me.as_deref() {
        match Url::parse(me) {
            Ok(profile_url) => match fetcher.profile(&profile_url).await {
                Ok(info) => profile_data = Some(info),
                Err(err) => {
                    warn!(me = %me, error = %err, "profile fetch failed");
                    errors.add(
                        OAuthError::TemporarilyUnavailable,
                        "profile could not be retrieved",
                    );
                }
            },
            Err(_) => errors.add(OAuthError::InvalidRequest, "selected profile is not a URL"),
        }
    }

    let token_lifespan = parse_lifespan(
        form.expires.as_deref(),
        form.expires_seconds.as_deref(),
    );
    // Refresh only makes sense for an expiring token.
    let refresh_lifespan = token_lifespan.and_then(|_| {
        parse_lifespan(form.refresh.as_deref(), form.refresh_seconds.as_deref())
    });

    if !errors.is_empty() {
        let resolved = errors.resolve().expect("accumulator is non-empty");
        info!(
            client_id = %continuation.client_id,
            error = %resolved.error,
            "consent refused"
        );
        return Ok(ConsentOutcome::Redirect(error_redirect(
            &redirect_uri,
            Some(&continuation.state),
            &resolved,
        )));
    }

    let me = me.expect("validated above");
    let grant = CodeGrant {
        code_id: continuation.id,
        code_challenge_method: continuation.code_challenge_method.clone(),
        code_challenge: continuation.code_challenge.clone(),
        client_id: continuation.client_id.clone(),
        redirect_uri: continuation.redirect_uri.clone(),
        accepted_scopes: accepted,
        token_lifespan,
        refresh_lifespan,
        me: me.clone(),
        profile: me,
        identifier: continuation.authentication_id.clone(),
        minted: Utc::now().timestamp(),
        profile_data: profile_data.as_ref().map(ProfileInfo::to_profile_data),
    };
    let code = codec.pack(&grant)?;

    let mut url = redirect_uri;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", &code);
        pairs.append_pair("state", &continuation.state);
        pairs.append_pair("iss", &config.dingus.self_base_url);
    }
    Ok(ConsentOutcome::Redirect(url))
}
