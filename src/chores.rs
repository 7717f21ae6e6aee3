//! Scheduled housekeeping.
//!
//! Three chores run off the request path: expired-token cleanup,
//! orphaned-scope cleanup, and publication of redeemed tickets to the
//! queue. Each reschedules itself after completion, and each consults
//! the almanac so that manual runs and multiple processes do not storm
//! the store. An interval of 0 disables a chore; the admin maintenance
//! endpoint invokes them manually with `at_least_ms = 0`.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::queue::TicketQueue;
use crate::store::{Storage, StorageError};

/// The chore runner, shared between the scheduler and the admin
/// maintenance endpoint.
pub struct Chores {
    store: Arc<dyn Storage>,
    queue: Option<Arc<TicketQueue>>,
    token_cleanup_ms: u64,
    scope_cleanup_ms: u64,
    publish_tickets_ms: u64,
    code_validity_seconds: i64,
}

/// How many pending tickets one publication pass will drain.
const PUBLISH_BATCH: i64 = 50;

impl Chores {
    pub fn new(
        store: Arc<dyn Storage>,
        queue: Option<Arc<TicketQueue>>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            queue,
            token_cleanup_ms: config.chores.token_cleanup_ms,
            scope_cleanup_ms: config.chores.scope_cleanup_ms,
            publish_tickets_ms: config.chores.publish_tickets_ms,
            code_validity_seconds: config.code_validity_seconds(),
        }
    }

    /// Start the periodic tasks for every enabled chore.
    pub fn spawn(self: &Arc<Self>) {
        if self.token_cleanup_ms > 0 {
            let chores = Arc::clone(self);
            tokio::spawn(async move {
                let interval = Duration::from_millis(chores.token_cleanup_ms);
                loop {
                    tokio::time::sleep(interval).await;
                    match chores.clean_tokens(chores.token_cleanup_ms as i64).await {
                        Ok(Some(removed)) => debug!(removed, "token cleanup ran"),
                        Ok(None) => debug!("token cleanup skipped, ran recently"),
                        Err(err) => warn!(error = %err, "token cleanup failed"),
                    }
                }
            });
        }

        if self.scope_cleanup_ms > 0 {
            let chores = Arc::clone(self);
            tokio::spawn(async move {
                let interval = Duration::from_millis(chores.scope_cleanup_ms);
                loop {
                    tokio::time::sleep(interval).await;
                    match chores.clean_scopes(chores.scope_cleanup_ms as i64).await {
                        Ok(Some(removed)) => debug!(removed, "scope cleanup ran"),
                        Ok(None) => debug!("scope cleanup skipped, ran recently"),
                        Err(err) => warn!(error = %err, "scope cleanup failed"),
                    }
                }
            });
        }

        if self.publish_tickets_ms > 0 && self.queue.is_some() {
            let chores = Arc::clone(self);
            tokio::spawn(async move {
                let interval = Duration::from_millis(chores.publish_tickets_ms);
                loop {
                    tokio::time::sleep(interval).await;
                    match chores.publish_tickets().await {
                        Ok(0) => {}
                        Ok(published) => debug!(published, "ticket publication ran"),
                        Err(err) => warn!(error = %err, "ticket publication failed"),
                    }
                }
            });
        }
    }

    /// Remove expired codes and tokens.
    pub async fn clean_tokens(&self, at_least_ms: i64) -> Result<Option<u64>, StorageError> {
        self.store
            .token_cleanup(self.code_validity_seconds, at_least_ms)
            .await
    }

    /// Remove unreferenced ephemeral scopes.
    pub async fn clean_scopes(&self, at_least_ms: i64) -> Result<Option<u64>, StorageError> {
        self.store.scope_cleanup(at_least_ms).await
    }

    /// Publish pending redeemed tickets. A failure on one row is
    /// logged and does not stop the rest of the batch.
    pub async fn publish_tickets(&self) -> Result<usize, StorageError> {
        let Some(queue) = self.queue.as_deref() else {
            debug!("no queue configured, ticket publication idle");
            return Ok(0);
        };

        let pending = self.store.ticket_token_get_unpublished(PUBLISH_BATCH).await?;
        let mut published = 0;
        for row in pending {
            let sent = queue
                .publish_token(
                    &row.ticket,
                    &row.resource,
                    &row.subject,
                    row.iss.as_deref(),
                    &row.token,
                )
                .await;
            match sent {
                Ok(()) => {
                    self.store
                        .ticket_token_published(&row.ticket, &row.resource)
                        .await?;
                    published += 1;
                }
                Err(err) => {
                    warn!(
                        ticket = %row.ticket,
                        resource = %row.resource,
                        error = %err,
                        "ticket publication failed for row"
                    );
                }
            }
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RedeemCodeData, RedeemedTicketData, SqliteStorage};
    use chrono::Utc;
    use uuid::Uuid;

    fn config() -> AppConfig {
        serde_json::from_str(
            r#"{
                "encryption_secret": "s",
                "db": { "connection_string": "sqlite::memory:" },
                "dingus": { "self_base_url": "https://auth.example.com/" }
            }"#,
        )
        .unwrap()
    }

    async fn store() -> Arc<SqliteStorage> {
        let store = SqliteStorage::connect("sqlite::memory:", "off").await.unwrap();
        store.initialize().await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_clean_tokens_runs_and_rate_limits() {
        let store = store().await;
        let chores = Chores::new(store.clone(), None, &config());

        let mut expired = RedeemCodeData {
            code_id: Uuid::new_v4(),
            created: Utc::now() - chrono::Duration::days(2),
            is_token: true,
            client_id: "https://app.example/".to_string(),
            profile: "https://alice.example/".to_string(),
            identifier: "alice".to_string(),
            scopes: vec![],
            lifespan_seconds: Some(60),
            refresh_lifespan_seconds: None,
            profile_data: None,
            resource: None,
        };
        store.redeem_code(&expired).await.unwrap();
        expired.code_id = Uuid::new_v4();
        expired.lifespan_seconds = None;
        store.redeem_code(&expired).await.unwrap();

        // Non-expiring row survives; expired row goes.
        assert_eq!(chores.clean_tokens(0).await.unwrap(), Some(1));
        // Immediately after, a rate-limited run is skipped.
        assert_eq!(chores.clean_tokens(60_000).await.unwrap(), None);
        // A manual run bypasses the almanac.
        assert_eq!(chores.clean_tokens(0).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_publish_without_queue_is_idle() {
        let store = store().await;
        store
            .ticket_redeemed(&RedeemedTicketData {
                ticket: "sealed".to_string(),
                resource: "https://alice.example/feed".to_string(),
                subject: "https://bob.example/".to_string(),
                iss: None,
                token: "token".to_string(),
            })
            .await
            .unwrap();

        let chores = Chores::new(store.clone(), None, &config());
        assert_eq!(chores.publish_tickets().await.unwrap(), 0);
        // The row stays pending for a future run with a queue.
        assert_eq!(store.ticket_token_get_unpublished(10).await.unwrap().len(), 1);
    }
}
