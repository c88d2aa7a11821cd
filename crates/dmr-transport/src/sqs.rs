//! `--sqs-info-uri`: thin wrapper over the AWS SDK. No retry policy of its
//! own — SQS's own visibility timeout and redrive policy own that, the way
//! spec.md §1 scopes message transports out as opaque collaborators.

use crate::{IncomingMessage, MessageSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_sqs::Client;

pub struct SqsSource {
    client: Client,
    queue_url: String,
}

impl SqsSource {
    pub fn new(client: Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }

    pub async fn connect(queue_url: String) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(Client::new(&config), queue_url)
    }
}

#[async_trait]
impl MessageSource for SqsSource {
    async fn receive(&self, max_messages: i64) -> Result<Vec<IncomingMessage>> {
        let max = max_messages.clamp(1, 10) as i32;
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max)
            .send()
            .await
            .context("sqs receive_message failed")?;

        Ok(response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                let receipt_handle = m.receipt_handle?;
                let body = m.body?;
                Some(IncomingMessage { receipt_handle, body })
            })
            .collect())
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .context("sqs delete_message failed")?;
        Ok(())
    }
}
