//! HTTP surface: the axum router and all endpoint handlers.
//!
//! Handlers stay thin; the authorization state machine, token
//! lifecycle, and ticket machinery live in their own modules and are
//! driven from here with the shared application state.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::authn::Authenticator;
use crate::authorize::{
    authorization_request, consent_submission, AuthorizeOutcome, AuthorizeParams, ConsentForm,
    ConsentOutcome,
};
use crate::chores::Chores;
use crate::config::AppConfig;
use crate::envelope::EnvelopeCodec;
use crate::errors::EngineError;
use crate::fetch::Fetcher;
use crate::pages;
use crate::queue::TicketQueue;
use crate::store::Storage;
use crate::ticket::{accept_proffer, mint_ticket, MintError, MintRequest, ProfferError,
    ProfferedTicket};
use crate::token::{
    authorization_code_grant, introspect, no_store, profile_redemption, refresh_token_grant,
    revoke, ticket_grant, userinfo, validate_bearer, TokenError, TokenForm,
};

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Storage>,
    pub codec: Arc<EnvelopeCodec>,
    pub fetcher: Arc<Fetcher>,
    pub queue: Option<Arc<TicketQueue>>,
    pub chores: Arc<Chores>,
    pub authenticator: Arc<Authenticator>,
}

/// Internal failure on an HTML-facing endpoint.
struct PageError(EngineError);

impl<E: Into<EngineError>> From<E> for PageError {
    fn from(err: E) -> Self {
        PageError(err.into())
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "internal failure");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(pages::error_page(
                "Server error",
                &["an internal error occurred".to_string()],
            )),
        )
            .into_response()
    }
}

/// Build the router over the configured paths.
pub fn create_router(state: AppState) -> Router {
    let routes = state.config.route.clone();
    let admin_ticket = format!("{}/ticket", routes.admin);
    let admin_maintenance = format!("{}/maintenance", routes.admin);

    Router::new()
        .route("/", get(landing))
        .route(&routes.metadata, get(metadata))
        .route("/.well-known/oauth-authorization-server", get(metadata))
        .route(
            &routes.authorization,
            get(get_authorize).post(post_authorize),
        )
        .route(&routes.consent, post(post_consent))
        .route(&routes.token, post(post_token))
        .route(&routes.revocation, post(post_revocation))
        .route(&routes.introspection, post(post_introspection))
        .route(&routes.userinfo, post(post_userinfo))
        .route(&routes.ticket, post(post_ticket))
        .route(&routes.healthcheck, get(healthcheck))
        .route(&routes.admin, get(get_admin).post(post_admin))
        .route(&admin_ticket, get(get_admin_ticket).post(post_admin_ticket))
        .route(&admin_maintenance, post(post_admin_maintenance))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 302 Found, as the authorization flow requires (303/307 change verb
/// semantics some clients depend on).
fn found(url: &Url) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(
        header::LOCATION,
        HeaderValue::from_str(url.as_str())
            .unwrap_or_else(|_| HeaderValue::from_static("/")),
    );
    response
}

fn basic_challenge() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"indieauthd\"")],
        Html(pages::error_page(
            "Authentication required",
            &["sign in to continue".to_string()],
        )),
    )
        .into_response()
}

fn bad_request_page(descriptions: &[String]) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Html(pages::error_page("Bad request", descriptions)),
    )
        .into_response()
}

/// Resolve an endpoint path against the advertised base URL.
fn absolute(config: &AppConfig, path: &str) -> String {
    Url::parse(&config.dingus.self_base_url)
        .and_then(|base| base.join(path))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| path.to_string())
}

async fn landing(State(state): State<AppState>) -> Html<String> {
    Html(pages::landing(&state.config.dingus.self_base_url))
}

async fn healthcheck(State(state): State<AppState>) -> Response {
    match state.store.health_check().await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "unhealthy").into_response()
        }
    }
}

async fn metadata(State(state): State<AppState>) -> Response {
    let config = &state.config;
    let routes = &config.route;
    let mut body = serde_json::json!({
        "issuer": config.dingus.self_base_url,
        "authorization_endpoint": absolute(config, &routes.authorization),
        "token_endpoint": absolute(config, &routes.token),
        "introspection_endpoint": absolute(config, &routes.introspection),
        "introspection_endpoint_auth_methods_supported": ["Bearer"],
        "revocation_endpoint": absolute(config, &routes.revocation),
        "revocation_endpoint_auth_methods_supported": ["none"],
        "scopes_supported": ["profile", "email"],
        // Emitted as a bare string for wire compatibility with
        // existing consumers; RFC 8414 expects an array.
        "response_types_supported": "code",
        "grant_types_supported": ["authorization_code", "refresh_token", "ticket"],
        "service_documentation": "https://indieauth.spec.indieweb.org/",
        "code_challenge_methods_supported": ["S256", "SHA256"],
        "authorization_response_iss_parameter_supported": true,
        "userinfo_endpoint": absolute(config, &routes.userinfo),
    });
    if state.queue.is_some() {
        body["ticket_endpoint"] = serde_json::json!(absolute(config, &routes.ticket));
    }
    Json(body).into_response()
}

async fn get_authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> Result<Response, PageError> {
    let Some(identifier) = state.authenticator.authenticate(&headers).await? else {
        return Ok(basic_challenge());
    };

    let outcome = authorization_request(
        state.store.as_ref(),
        &state.codec,
        &state.fetcher,
        &state.config,
        &identifier,
        &params,
    )
    .await?;

    Ok(match outcome {
        AuthorizeOutcome::BadRequest(descriptions) => bad_request_page(&descriptions),
        AuthorizeOutcome::ErrorRedirect(url) => found(&url),
        AuthorizeOutcome::Consent(ctx) => no_store(
            Html(pages::consent_page(&ctx, &state.config.route.consent)).into_response(),
        ),
    })
}

/// Code redemption at the authorization endpoint: a profile-only
/// response with no access token.
async fn post_authorize(
    State(state): State<AppState>,
    Form(form): Form<TokenForm>,
) -> Result<Response, TokenError> {
    let response =
        profile_redemption(state.store.as_ref(), &state.codec, &state.config, &form).await?;
    Ok(no_store(Json(response).into_response()))
}

async fn post_consent(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, PageError> {
    let identifier = state.authenticator.authenticate(&headers).await?;
    if identifier.is_none() && state.config.authenticator.authn_enabled {
        return Ok(basic_challenge());
    }

    let form = ConsentForm::from_pairs(
        url::form_urlencoded::parse(body.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned())),
    );

    let outcome = consent_submission(
        &state.codec,
        &state.fetcher,
        &state.config,
        identifier.as_deref(),
        &form,
    )
    .await?;

    Ok(match outcome {
        ConsentOutcome::BadRequest(descriptions) => bad_request_page(&descriptions),
        ConsentOutcome::Redirect(url) => found(&url),
    })
}

async fn post_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Response {
    let store = state.store.as_ref();
    let codec = &state.codec;

    // Legacy cases are dispatched before grant_type.
    if let Some(authorization) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        return match validate_bearer(store, codec, authorization).await {
            Ok(validation) => no_store(Json(validation).into_response()),
            Err(TokenError::Protocol { status, description, .. })
                if status == StatusCode::UNAUTHORIZED =>
            {
                let challenge = format!(
                    "Bearer, error=\"invalid_token\", error_description=\"{description}\""
                );
                no_store(
                    (
                        StatusCode::UNAUTHORIZED,
                        [(header::WWW_AUTHENTICATE, challenge)],
                    )
                        .into_response(),
                )
            }
            Err(err) => err.into_response(),
        };
    }
    if form.action.as_deref() == Some("revoke") {
        let token = form.token.clone().unwrap_or_default();
        return match revoke(store, codec, &token).await {
            Ok(()) => no_store(StatusCode::OK.into_response()),
            Err(err) => err.into_response(),
        };
    }

    let result = match form.grant_type.as_deref() {
        None | Some("authorization_code") => {
            authorization_code_grant(store, codec, &state.config, &form).await
        }
        Some("refresh_token") => refresh_token_grant(store, codec, &form).await,
        Some("ticket") => ticket_grant(store, codec, &form).await,
        Some(other) => {
            info!(grant_type = %other, "unknown grant type");
            return no_store(
                (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": "invalid_request",
                        "error_description": "unknown grant_type",
                    })),
                )
                    .into_response(),
            );
        }
    };

    match result {
        Ok(response) => no_store((StatusCode::CREATED, Json(response)).into_response()),
        Err(err) => err.into_response(),
    }
}

async fn post_revocation(
    State(state): State<AppState>,
    Form(form): Form<TokenForm>,
) -> Response {
    let token = form.token.unwrap_or_default();
    match revoke(state.store.as_ref(), &state.codec, &token).await {
        Ok(()) => no_store(StatusCode::OK.into_response()),
        Err(err) => err.into_response(),
    }
}

async fn post_introspection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Result<Response, TokenError> {
    let resource = state
        .authenticator
        .authenticate_resource(&headers)
        .await
        .map_err(EngineError::from)?;
    let Some(resource) = resource else {
        return Ok((
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"indieauthd\"")],
        )
            .into_response());
    };
    info!(resource_id = %resource.resource_id, "introspection request");

    let response = introspect(state.store.as_ref(), &state.codec, &form).await?;
    Ok(no_store(Json(response).into_response()))
}

async fn post_userinfo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Result<Response, TokenError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .or(form.token);
    let Some(token) = token else {
        return Ok((StatusCode::BAD_REQUEST, "missing token").into_response());
    };

    let claims = userinfo(state.store.as_ref(), &state.codec, &token).await?;
    Ok(no_store(Json(claims).into_response()))
}

async fn post_ticket(
    State(state): State<AppState>,
    Form(proffer): Form<ProfferedTicket>,
) -> Response {
    let result = accept_proffer(
        state.store.as_ref(),
        state.queue.as_deref(),
        &proffer,
    )
    .await;

    match result {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(ProfferError::QueueUnconfigured) => (
            StatusCode::BAD_REQUEST,
            "ticket proffering is not enabled",
        )
            .into_response(),
        Err(ProfferError::InvalidResource) => {
            (StatusCode::BAD_REQUEST, "resource is not a valid URL").into_response()
        }
        Err(ProfferError::UnknownSubject) => {
            (StatusCode::BAD_REQUEST, "unknown subject").into_response()
        }
        Err(ProfferError::Publish(err)) => {
            warn!(error = %err, "proffer publish failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "queue publish failed").into_response()
        }
        Err(ProfferError::Engine(err)) => {
            warn!(error = %err, "proffer processing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// admin surface

async fn get_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, PageError> {
    let Some(identifier) = state.authenticator.authenticate(&headers).await? else {
        return Ok(basic_challenge());
    };

    let profiles_scopes = state
        .store
        .profiles_scopes_by_identifier(&identifier)
        .await?;
    let tokens = state.store.tokens_get_by_identifier(&identifier).await?;

    Ok(Html(pages::admin_page(
        &state.config.route.admin,
        &profiles_scopes,
        &tokens,
    ))
    .into_response())
}

async fn post_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, PageError> {
    let Some(identifier) = state.authenticator.authenticate(&headers).await? else {
        return Ok(basic_challenge());
    };

    let mut action = None;
    let mut profile = None;
    let mut scopes_field = None;
    let mut scope = None;
    let mut code_id = None;
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        match key.as_ref() {
            "action" => action = Some(value.into_owned()),
            "profile" => profile = Some(value.into_owned()),
            "scopes" => scopes_field = Some(value.into_owned()),
            "scope" => scope = Some(value.into_owned()),
            "code_id" => code_id = Some(value.into_owned()),
            _ => {}
        }
    }

    match action.as_deref() {
        Some("set-scopes") => {
            let Some(profile) = profile else {
                return Ok(bad_request_page(&["missing profile".to_string()]));
            };
            let owned = state
                .store
                .profiles_scopes_by_identifier(&identifier)
                .await?
                .profiles
                .contains(&profile);
            if !owned {
                return Ok(bad_request_page(&["profile not owned".to_string()]));
            }
            let scopes =
                crate::scopes::split_scope_string(scopes_field.as_deref().unwrap_or(""));
            state.store.profile_scopes_set_all(&profile, &scopes).await?;
        }
        Some("add-scope") => {
            let Some(scope) = scope else {
                return Ok(bad_request_page(&["missing scope".to_string()]));
            };
            if let Err(err) = state.store.scope_upsert(&scope, "", "", true).await {
                warn!(error = %err, "scope add failed");
                return Ok(bad_request_page(&["scope was not accepted".to_string()]));
            }
        }
        Some("delete-scope") => {
            let Some(scope) = scope else {
                return Ok(bad_request_page(&["missing scope".to_string()]));
            };
            if !state.store.scope_delete(&scope).await? {
                return Ok(bad_request_page(&[
                    "scope is still referenced".to_string()
                ]));
            }
        }
        Some("revoke") => {
            let parsed = code_id.as_deref().and_then(|raw| Uuid::parse_str(raw).ok());
            let Some(code_id) = parsed else {
                return Ok(bad_request_page(&["missing code identifier".to_string()]));
            };
            // Only the operator's own tokens are reachable here.
            let owned = state
                .store
                .tokens_get_by_identifier(&identifier)
                .await?
                .iter()
                .any(|t| t.code_id == code_id);
            if !owned {
                return Ok(bad_request_page(&["no such token".to_string()]));
            }
            state.store.token_revoke_by_code_id(&code_id).await?;
        }
        _ => return Ok(bad_request_page(&["unknown action".to_string()])),
    }

    // Post-redirect-get back to the admin page.
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SEE_OTHER;
    response.headers_mut().insert(
        header::LOCATION,
        HeaderValue::from_str(&state.config.route.admin)
            .unwrap_or_else(|_| HeaderValue::from_static("/")),
    );
    Ok(response)
}

async fn get_admin_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, PageError> {
    let Some(identifier) = state.authenticator.authenticate(&headers).await? else {
        return Ok(basic_challenge());
    };
    let profiles = state
        .store
        .profiles_scopes_by_identifier(&identifier)
        .await?
        .profiles;
    Ok(Html(pages::admin_ticket_page(
        &state.config.route.admin,
        &profiles,
        None,
    ))
    .into_response())
}

#[derive(serde::Deserialize)]
struct MintForm {
    profile: String,
    resource: String,
    subject: String,
    scopes: String,
}

async fn post_admin_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<MintForm>,
) -> Result<Response, PageError> {
    let Some(identifier) = state.authenticator.authenticate(&headers).await? else {
        return Ok(basic_challenge());
    };

    let request = MintRequest {
        profile: form.profile,
        resource: form.resource,
        subject: form.subject,
        scopes: crate::scopes::split_scope_string(&form.scopes),
    };
    let result = mint_ticket(
        state.store.as_ref(),
        &state.codec,
        &state.fetcher,
        &state.config,
        &identifier,
        &request,
    )
    .await;

    let notice = match result {
        Ok(outcome) if outcome.delivered => {
            format!("ticket delivered to {}", outcome.ticket_endpoint)
        }
        Ok(outcome) => format!(
            "ticket minted but delivery failed: {}",
            outcome.delivery_error.unwrap_or_default()
        ),
        Err(MintError::Engine(err)) => return Err(PageError(err)),
        Err(err) => err.to_string(),
    };

    let profiles = state
        .store
        .profiles_scopes_by_identifier(&identifier)
        .await?
        .profiles;
    Ok(no_store(
        Html(pages::admin_ticket_page(
            &state.config.route.admin,
            &profiles,
            Some(&notice),
        ))
        .into_response(),
    ))
}

async fn post_admin_maintenance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, PageError> {
    if state.authenticator.authenticate(&headers).await?.is_none() {
        return Ok(basic_challenge());
    }

    let tokens_removed = state.chores.clean_tokens(0).await?;
    let scopes_removed = state.chores.clean_scopes(0).await?;
    let tickets_published = state.chores.publish_tickets().await?;
    info!(
        ?tokens_removed,
        ?scopes_removed,
        tickets_published,
        "manual maintenance run"
    );

    Ok(Json(serde_json::json!({
        "tokens_removed": tokens_removed,
        "scopes_removed": scopes_removed,
        "tickets_published": tickets_published,
    }))
    .into_response())
}
