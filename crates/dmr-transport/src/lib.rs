//! Message-transport consumer contract (spec.md §1: "message transports —
//! specified only by their consumer contract"). The listener and daemon
//! wiring only ever see [`MessageSource`]; which adapter backs it is a
//! runtime choice driven by `--sqs-info-uri` / `--rabbit-info-uri` /
//! `--database-info-queue`.
//!
//! The database-backed adapter is implemented in full, the same way the
//! teacher fully implements its deterministic paper broker while treating
//! the live broker adapters as thin HTTP/wire wrappers. SQS and RabbitMQ are
//! real adapters, not stubs, but carry no retry/backoff logic of their own:
//! a redelivered message is just another call to `receive`.

pub mod db;
#[cfg(feature = "rabbitmq")]
pub mod rabbit;
#[cfg(feature = "sqs")]
pub mod sqs;

use async_trait::async_trait;

/// One undelivered message pulled from the transport, not yet acked.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub receipt_handle: String,
    pub body: String,
}

/// The only surface the listener depends on (spec.md §4.F): pull a batch,
/// ack what was durably processed. A message that is never acked becomes
/// visible again after the transport's own redelivery timeout — this crate
/// does not reimplement that timer.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn receive(&self, max_messages: i64) -> anyhow::Result<Vec<IncomingMessage>>;
    async fn ack(&self, receipt_handle: &str) -> anyhow::Result<()>;
}

pub use db::DbQueueSource;
