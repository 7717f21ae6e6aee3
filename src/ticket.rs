//! Ticket machinery.
//!
//! Tickets are sealed envelopes proactively delivered to a third
//! party's ticket endpoint; the holder later redeems one at the token
//! endpoint for an access token scoped to a single resource. Proffered
//! tickets arriving from other issuers are queued for the external
//! redeemer.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::envelope::EnvelopeCodec;
use crate::errors::EngineError;
use crate::fetch::{FetchError, Fetcher};
use crate::queue::{QueueError, TicketQueue};
use crate::scopes;
use crate::store::{Storage, StorageError};

/// Sealed ticket payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketPayload {
    /// Becomes the code id of the token row on redemption.
    pub c: Uuid,
    pub iss: String,
    /// Epoch seconds after which the ticket is dead.
    pub exp: i64,
    /// The party the ticket was delivered to.
    pub sub: String,
    /// The resource the eventual token is good for.
    pub res: String,
    pub scope: Vec<String>,
    pub ident: String,
    pub profile: String,
}

/// Operator's minting request from the admin surface
#[derive(Debug, Clone, Default)]
pub struct MintRequest {
    pub profile: String,
    pub resource: String,
    pub subject: String,
    pub scopes: Vec<String>,
}

/// Result of minting: the sealed ticket plus what happened on delivery.
/// Delivery failure does not invalidate the ticket.
#[derive(Debug)]
pub struct MintOutcome {
    pub ticket: String,
    pub ticket_endpoint: String,
    pub delivered: bool,
    pub delivery_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum MintError {
    #[error("profile does not belong to this identifier")]
    ProfileNotOwned,

    #[error("resource is not a valid URL")]
    InvalidResource,

    #[error("subject is not a valid URL")]
    InvalidSubject,

    #[error("subject does not advertise a ticket endpoint")]
    NoTicketEndpoint,

    #[error("at least one action scope is required")]
    NoActionScopes,

    #[error("subject fetch failed: {0}")]
    SubjectFetch(#[from] FetchError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<StorageError> for MintError {
    fn from(err: StorageError) -> Self {
        MintError::Engine(err.into())
    }
}

/// Mint a ticket for a third party and attempt delivery to their
/// ticket endpoint.
pub async fn mint_ticket(
    store: &dyn Storage,
    codec: &EnvelopeCodec,
    fetcher: &Fetcher,
    config: &AppConfig,
    identifier: &str,
    request: &MintRequest,
) -> Result<MintOutcome, MintError> {
    let profiles = store.profiles_scopes_by_identifier(identifier).await?;
    if !profiles.profiles.iter().any(|p| p == &request.profile) {
        return Err(MintError::ProfileNotOwned);
    }

    let resource =
        Url::parse(&request.resource).map_err(|_| MintError::InvalidResource)?;
    let subject = Url::parse(&request.subject).map_err(|_| MintError::InvalidSubject)?;

    let ticket_scopes = scopes::filter_scopes(&request.scopes);
    let has_action = ticket_scopes
        .iter()
        .any(|s| s != "profile" && s != "email");
    if !has_action {
        return Err(MintError::NoActionScopes);
    }

    let subject_info = fetcher.profile(&subject).await?;
    let Some(ticket_endpoint) = subject_info.ticket_endpoint else {
        return Err(MintError::NoTicketEndpoint);
    };

    let payload = TicketPayload {
        c: Uuid::new_v4(),
        iss: config.dingus.self_base_url.clone(),
        exp: Utc::now().timestamp() + config.manager.ticket_lifespan_seconds as i64,
        sub: subject.to_string(),
        res: resource.to_string(),
        scope: ticket_scopes,
        ident: identifier.to_string(),
        profile: request.profile.clone(),
    };
    let ticket = codec.pack(&payload).map_err(EngineError::from)?;

    let delivery = fetcher
        .deliver_ticket(
            &ticket_endpoint,
            &ticket,
            &payload.res,
            &payload.sub,
            &payload.iss,
        )
        .await;

    match &delivery {
        Ok(()) => info!(
            subject = %payload.sub,
            resource = %payload.res,
            "ticket delivered"
        ),
        Err(err) => warn!(
            subject = %payload.sub,
            error = %err,
            "ticket delivery failed"
        ),
    }

    Ok(MintOutcome {
        ticket,
        ticket_endpoint,
        delivered: delivery.is_ok(),
        delivery_error: delivery.err().map(|e| e.to_string()),
    })
}

/// An unsolicited ticket proffered to this server
#[derive(Debug, Clone, Deserialize)]
pub struct ProfferedTicket {
    pub ticket: String,
    pub resource: String,
    pub subject: String,
    #[serde(default)]
    pub iss: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProfferError {
    #[error("no ticket queue is configured")]
    QueueUnconfigured,

    #[error("resource is not a valid URL")]
    InvalidResource,

    #[error("subject is not a profile of this server")]
    UnknownSubject,

    #[error("queue publish failed: {0}")]
    Publish(#[from] QueueError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<StorageError> for ProfferError {
    fn from(err: StorageError) -> Self {
        ProfferError::Engine(err.into())
    }
}

/// Accept a proffered ticket: validate it names one of our profiles and
/// hand it to the queue for the redeemer.
pub async fn accept_proffer(
    store: &dyn Storage,
    queue: Option<&TicketQueue>,
    proffer: &ProfferedTicket,
) -> Result<(), ProfferError> {
    let Some(queue) = queue else {
        return Err(ProfferError::QueueUnconfigured);
    };

    if Url::parse(&proffer.resource).is_err() {
        return Err(ProfferError::InvalidResource);
    }
    if !store.profile_is_valid(&proffer.subject).await? {
        return Err(ProfferError::UnknownSubject);
    }

    queue
        .publish_proffered_ticket(&proffer.ticket, &proffer.resource, &proffer.subject)
        .await?;
    info!(
        subject = %proffer.subject,
        resource = %proffer.resource,
        "proffered ticket queued"
    );
    Ok(())
}
