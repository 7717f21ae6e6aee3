//! AMQP publisher for ticket traffic.
//!
//! Two queues: proffered tickets awaiting the external redeemer, and
//! issued-token notices drained by the publication chore. Both are
//! declared durable on connect; publishes wait for broker confirmation.

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Publisher over the configured AMQP broker.
pub struct TicketQueue {
    channel: Channel,
    publish_name: String,
    redeemed_name: String,
}

impl TicketQueue {
    /// Connect, open a channel in confirm mode, and declare both
    /// queues durable.
    pub async fn connect(
        url: &str,
        publish_name: &str,
        redeemed_name: &str,
    ) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let declare = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        channel
            .queue_declare(publish_name, declare, FieldTable::default())
            .await?;
        channel
            .queue_declare(redeemed_name, declare, FieldTable::default())
            .await?;

        info!(
            publish = %publish_name,
            redeemed = %redeemed_name,
            "ticket queues ready"
        );
        Ok(Self {
            channel,
            publish_name: publish_name.to_string(),
            redeemed_name: redeemed_name.to_string(),
        })
    }

    async fn publish(&self, queue: &str, body: &serde_json::Value) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(body)?;
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".to_string().into()),
            )
            .await?;
        confirm.await?;
        debug!(queue = %queue, "message published");
        Ok(())
    }

    /// Hand a proffered ticket to the external redeemer.
    pub async fn publish_proffered_ticket(
        &self,
        ticket: &str,
        resource: &str,
        subject: &str,
    ) -> Result<(), QueueError> {
        self.publish(
            &self.redeemed_name,
            &json!({
                "ticket": ticket,
                "resource": resource,
                "subject": subject,
            }),
        )
        .await
    }

    /// Announce a token issued for a redeemed ticket.
    pub async fn publish_token(
        &self,
        ticket: &str,
        resource: &str,
        subject: &str,
        iss: Option<&str>,
        token: &str,
    ) -> Result<(), QueueError> {
        self.publish(
            &self.publish_name,
            &json!({
                "ticket": ticket,
                "resource": resource,
                "subject": subject,
                "iss": iss,
                "token": token,
            }),
        )
        .await
    }
}

// Publishing against a live broker is covered by deployment smoke
// tests; here we only pin the message shapes.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proffer_message_shape() {
        let body = json!({
            "ticket": "sealed",
            "resource": "https://alice.example/feed",
            "subject": "https://alice.example/",
        });
        let encoded = serde_json::to_vec(&body).unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded["ticket"], "sealed");
        assert_eq!(decoded["subject"], "https://alice.example/");
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::Serialize(
            serde_json::from_str::<serde_json::Value>("not json").unwrap_err(),
        );
        assert!(err.to_string().contains("serialization"));
    }
}
