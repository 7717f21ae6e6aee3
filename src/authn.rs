//! Operator and resource-server authentication.
//!
//! Resolves the authenticated identifier for a request from HTTP Basic
//! credentials checked against the authentication store. Credential
//! strings carry their algorithm in the prefix: `$argon2…` verifiers
//! are checked locally, the `$PAM$` sentinel marks delegation to a host
//! authenticator this daemon does not perform itself.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{ResourceRecord, Storage, StorageError};

/// Header consulted for the identifier when local authentication is
/// disabled and a front proxy is trusted to have done it.
pub const FORWARDED_IDENTIFIER_HEADER: &str = "x-forwarded-user";

/// Hash a new credential for storage.
pub fn hash_credential(secret: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(secret.as_bytes(), &salt)?
        .to_string())
}

/// Verify a presented secret against a stored credential string.
pub fn verify_credential(stored: &str, presented: &str) -> bool {
    if stored.starts_with("$PAM$") {
        warn!("credential delegates to PAM, which this daemon does not perform");
        return false;
    }
    match PasswordHash::new(stored) {
        Ok(hash) => Argon2::default()
            .verify_password(presented.as_bytes(), &hash)
            .is_ok(),
        Err(err) => {
            warn!(error = %err, "unparseable stored credential");
            false
        }
    }
}

/// Extract username and password from a Basic Authorization header.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Request authenticator bound to the storage engine.
pub struct Authenticator {
    store: Arc<dyn Storage>,
    enabled: bool,
}

impl Authenticator {
    pub fn new(store: Arc<dyn Storage>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Resolve the authenticated identifier for a request, or None when
    /// the request carries no valid operator credentials.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<String>, StorageError> {
        if !self.enabled {
            let forwarded = headers
                .get(FORWARDED_IDENTIFIER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            if forwarded.is_none() {
                debug!("authentication disabled and no forwarded identifier present");
            }
            return Ok(forwarded);
        }

        let Some((identifier, presented)) = basic_credentials(headers) else {
            return Ok(None);
        };

        let Some(auth) = self.store.authentication_get(&identifier).await? else {
            debug!(identifier = %identifier, "unknown identifier");
            return Ok(None);
        };
        let Some(credential) = auth.credential else {
            debug!(identifier = %identifier, "identifier has no credential");
            return Ok(None);
        };

        // Argon2 verification is CPU-bound; keep it off the executor.
        let verified = tokio::task::spawn_blocking(move || {
            verify_credential(&credential, &presented)
        })
        .await
        .unwrap_or(false);

        if !verified {
            debug!(identifier = %identifier, "credential verification failed");
            return Ok(None);
        }

        self.store.authentication_success(&identifier).await?;
        Ok(Some(identifier))
    }

    /// Authenticate a resource server calling the introspection
    /// endpoint: Basic `resource_id:secret` against the resource table.
    pub async fn authenticate_resource(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<ResourceRecord>, StorageError> {
        let Some((id, secret)) = basic_credentials(headers) else {
            return Ok(None);
        };
        let Ok(resource_id) = Uuid::parse_str(&id) else {
            debug!("resource authentication with non-uuid identifier");
            return Ok(None);
        };
        let Some(resource) = self.store.resource_get(&resource_id).await? else {
            return Ok(None);
        };
        if resource.secret != secret {
            debug!(resource_id = %resource_id, "resource secret mismatch");
            return Ok(None);
        }
        Ok(Some(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStorage;
    use axum::http::HeaderValue;

    fn basic_header(user: &str, pass: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let encoded = STANDARD.encode(format!("{user}:{pass}"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_credential("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_credential(&hash, "hunter2"));
        assert!(!verify_credential(&hash, "hunter3"));
    }

    #[test]
    fn test_pam_sentinel_rejected() {
        assert!(!verify_credential("$PAM$", "anything"));
    }

    #[test]
    fn test_garbage_credential_rejected() {
        assert!(!verify_credential("not-a-hash", "anything"));
    }

    #[test]
    fn test_basic_credentials_parsing() {
        let headers = basic_header("alice", "se:cret");
        let (user, pass) = basic_credentials(&headers).unwrap();
        assert_eq!(user, "alice");
        // Everything after the first colon is the password.
        assert_eq!(pass, "se:cret");

        assert!(basic_credentials(&HeaderMap::new()).is_none());

        let mut bearer = HeaderMap::new();
        bearer.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token"),
        );
        assert!(basic_credentials(&bearer).is_none());
    }

    #[tokio::test]
    async fn test_authenticate_against_store() {
        let store = SqliteStorage::connect("sqlite::memory:", "off").await.unwrap();
        store.initialize().await.unwrap();
        let store = Arc::new(store);

        let hash = hash_credential("hunter2").unwrap();
        store
            .authentication_upsert("alice", &hash, None)
            .await
            .unwrap();

        let authn = Authenticator::new(store.clone(), true);

        let ok = authn
            .authenticate(&basic_header("alice", "hunter2"))
            .await
            .unwrap();
        assert_eq!(ok.as_deref(), Some("alice"));

        // Success is recorded.
        let auth = store.authentication_get("alice").await.unwrap().unwrap();
        assert!(auth.last_authentication.is_some());

        let bad = authn
            .authenticate(&basic_header("alice", "wrong"))
            .await
            .unwrap();
        assert!(bad.is_none());

        let unknown = authn
            .authenticate(&basic_header("mallory", "hunter2"))
            .await
            .unwrap();
        assert!(unknown.is_none());
    }

    #[tokio::test]
    async fn test_disabled_authentication_trusts_forwarded_header() {
        let store = SqliteStorage::connect("sqlite::memory:", "off").await.unwrap();
        store.initialize().await.unwrap();
        let authn = Authenticator::new(Arc::new(store), false);

        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_IDENTIFIER_HEADER,
            HeaderValue::from_static("alice"),
        );
        let id = authn.authenticate(&headers).await.unwrap();
        assert_eq!(id.as_deref(), Some("alice"));

        assert!(authn.authenticate(&HeaderMap::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resource_authentication() {
        let store = SqliteStorage::connect("sqlite::memory:", "off").await.unwrap();
        store.initialize().await.unwrap();
        let store = Arc::new(store);

        let id = Uuid::new_v4();
        store.resource_upsert(&id, "s3cret", "feed").await.unwrap();
        let authn = Authenticator::new(store, true);

        let ok = authn
            .authenticate_resource(&basic_header(&id.to_string(), "s3cret"))
            .await
            .unwrap();
        assert!(ok.is_some());

        let bad = authn
            .authenticate_resource(&basic_header(&id.to_string(), "wrong"))
            .await
            .unwrap();
        assert!(bad.is_none());

        let non_uuid = authn
            .authenticate_resource(&basic_header("not-a-uuid", "s3cret"))
            .await
            .unwrap();
        assert!(non_uuid.is_none());
    }
}
