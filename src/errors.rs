//! OAuth protocol error codes and the severity-ordered accumulator.
//!
//! Authorization requests can fail several validations at once. Each
//! failure is recorded with its protocol error code; the response carries
//! the single highest-severity code while preserving every description.

use serde::Serialize;
use thiserror::Error;

use crate::envelope::EnvelopeError;
use crate::store::StorageError;

/// Internal failures that abort request processing; the HTTP layer
/// renders them as 500s.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// OAuth / IndieAuth protocol error codes, ordered by ascending severity.
///
/// The discriminant order is load-bearing: when multiple errors are
/// recorded against one request, the reported `error` is the variant
/// with the highest discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthError {
    InvalidScope,
    UnsupportedResponseType,
    AccessDenied,
    UnauthorizedClient,
    InvalidGrant,
    InvalidRequest,
    TemporarilyUnavailable,
    ServerError,
}

impl OAuthError {
    /// Wire representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthError::InvalidScope => "invalid_scope",
            OAuthError::UnsupportedResponseType => "unsupported_response_type",
            OAuthError::AccessDenied => "access_denied",
            OAuthError::UnauthorizedClient => "unauthorized_client",
            OAuthError::InvalidGrant => "invalid_grant",
            OAuthError::InvalidRequest => "invalid_request",
            OAuthError::TemporarilyUnavailable => "temporarily_unavailable",
            OAuthError::ServerError => "server_error",
        }
    }
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip characters outside the set RFC 6749 permits in
/// `error_description`: printable ASCII minus `"` and `\`.
pub fn clean_description(raw: &str) -> String {
    raw.chars()
        .filter(|c| {
            let b = *c as u32;
            (0x20..=0x7e).contains(&b) && *c != '"' && *c != '\\'
        })
        .collect()
}

/// Collects protocol errors observed while validating a single request.
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    entries: Vec<(OAuthError, String)>,
}

/// The resolved outcome of an accumulator: the severest code plus every
/// description, ordered by severity then by observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedError {
    pub error: OAuthError,
    pub descriptions: Vec<String>,
}

impl ResolvedError {
    /// Descriptions joined for the `error_description` redirect parameter.
    pub fn description(&self) -> String {
        self.descriptions.join(", ")
    }
}

impl ErrorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error with its human-readable description. The
    /// description is sanitized to the OAuth-permitted character set.
    pub fn add(&mut self, error: OAuthError, description: impl Into<String>) {
        self.entries.push((error, clean_description(&description.into())));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve to the highest-severity code. Descriptions are emitted in
    /// order of severity, ties broken by order of observation; the sort
    /// must therefore be stable.
    pub fn resolve(&self) -> Option<ResolvedError> {
        let error = *self.entries.iter().map(|(e, _)| e).max()?;
        let mut ordered: Vec<(usize, &(OAuthError, String))> =
            self.entries.iter().enumerate().collect();
        ordered.sort_by(|(ai, (ae, _)), (bi, (be, _))| be.cmp(ae).then(ai.cmp(bi)));
        Some(ResolvedError {
            error,
            descriptions: ordered.into_iter().map(|(_, (_, d))| d.clone()).collect(),
        })
    }
}
