//! `--rabbit-info-uri` + `--rabbit-info-queue`: thin wrapper over `lapin`.
//! Uses `basic_get` rather than a long-lived consumer so `receive` keeps the
//! same pull-based shape as the other two adapters.

use crate::{IncomingMessage, MessageSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::options::{BasicAckOptions, BasicGetOptions};
use lapin::{Channel, Connection, ConnectionProperties};

pub struct RabbitSource {
    channel: Channel,
    queue: String,
}

impl RabbitSource {
    pub fn new(channel: Channel, queue: String) -> Self {
        Self { channel, queue }
    }

    pub async fn connect(uri: &str, queue: String) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .context("rabbitmq connect failed")?;
        let channel = connection.create_channel().await.context("rabbitmq create_channel failed")?;
        Ok(Self::new(channel, queue))
    }
}

#[async_trait]
impl MessageSource for RabbitSource {
    async fn receive(&self, max_messages: i64) -> Result<Vec<IncomingMessage>> {
        let mut out = Vec::new();
        for _ in 0..max_messages.max(0) {
            let got = self
                .channel
                .basic_get(&self.queue, BasicGetOptions::default())
                .await
                .context("rabbitmq basic_get failed")?;
            let Some(message) = got else { break };
            let delivery = message.delivery;
            let receipt_handle = delivery.delivery_tag.to_string();
            let body = String::from_utf8(delivery.data).context("rabbitmq message body is not valid utf-8")?;
            out.push(IncomingMessage { receipt_handle, body });
        }
        Ok(out)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let delivery_tag: u64 = receipt_handle.parse().context("rabbitmq ack: receipt handle is not a delivery tag")?;
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .context("rabbitmq basic_ack failed")?;
        Ok(())
    }
}
