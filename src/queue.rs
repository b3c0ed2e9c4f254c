//! Notification queue access
//!
//! The controller consumes lifecycle hook notifications from an SQS queue and
//! deletes messages once their event reaches a terminal state. Deleting before
//! the visibility timeout elapses is what prevents redelivery.

use async_trait::async_trait;
use aws_sdk_sqs::Client as SqsClient;

use crate::error::{Result, SentinelError};
use crate::event::QueueMessage;

/// Abstract queue operations consumed by the controller
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Resolve the URL of a queue by name
    async fn queue_url(&self, name: &str) -> Result<String>;

    /// Receive at most one message, long-polling for up to `wait_seconds`
    async fn receive_one(&self, url: &str, wait_seconds: i64) -> Result<Vec<QueueMessage>>;

    /// Delete a message by receipt handle
    async fn delete(&self, url: &str, receipt_handle: &str) -> Result<()>;
}

/// SQS-backed queue implementation
pub struct SqsQueue {
    client: SqsClient,
}

impl SqsQueue {
    /// Create a queue service from an SQS client
    pub fn new(client: SqsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn queue_url(&self, name: &str) -> Result<String> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| {
                SentinelError::queue(format!("failed to resolve url for queue {name}: {e}"))
            })?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| SentinelError::queue(format!("queue {name} has no url")))
    }

    async fn receive_one(&self, url: &str, wait_seconds: i64) -> Result<Vec<QueueMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(url)
            .max_number_of_messages(1)
            .wait_time_seconds(wait_seconds.clamp(0, 20) as i32)
            .send()
            .await
            .map_err(|e| SentinelError::queue(format!("failed to receive messages: {e}")))?;

        Ok(output
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|message| QueueMessage {
                body: message.body.unwrap_or_default(),
                receipt_handle: message.receipt_handle.unwrap_or_default(),
            })
            .collect())
    }

    async fn delete(&self, url: &str, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| SentinelError::queue(format!("failed to delete message: {e}")))?;
        Ok(())
    }
}
