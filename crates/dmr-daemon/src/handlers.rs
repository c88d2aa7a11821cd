//! `ActionHandler` implementations wiring the dispatcher's registered
//! actions (spec.md §6 "Registered actions") to the crates that actually do
//! the work. Each handler is a thin adapter: parse params, call the
//! library function, translate its result into success/retry/fatal.

use async_trait::async_trait;
use dmr_db::{Conn, DbPool};
use dmr_dispatcher::{ActionHandler, HandlerError};
use dmr_engine::ResolutionEngine;
use dmr_stats::Stats;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Fixed identity used for the modifier column in the locks table and the
/// queue's `leased_by` column. The dispatcher has no per-call caller
/// identity to plumb through `ActionHandler::handle`.
const WORKER_ID: &str = "dispatcher";

#[derive(Deserialize)]
struct EntityParams {
    #[serde(rename = "ENTITY_ID")]
    entity_id: i64,
}

pub struct RefreshEntityHandler {
    engine: Arc<dyn ResolutionEngine>,
    stats: Arc<Stats>,
}

impl RefreshEntityHandler {
    pub fn new(engine: Arc<dyn ResolutionEngine>, stats: Arc<Stats>) -> Self {
        Self { engine, stats }
    }
}

#[async_trait]
impl ActionHandler for RefreshEntityHandler {
    async fn handle(&self, conn: &mut Conn<'_>, pool: &DbPool, params_json: &str, _multiplicity: i64) -> Result<(), HandlerError> {
        let params: EntityParams = serde_json::from_str(params_json)
            .map_err(|e| HandlerError::Fatal(format!("refresh-entity: malformed params: {e}")))?;

        match dmr_refresh::refresh_entity(conn, pool, self.engine.as_ref(), WORKER_ID, params.entity_id).await {
            Ok(Some(refresh_stats)) => {
                self.stats.record_entity_refreshed(refresh_stats.changed);
                Ok(())
            }
            Ok(None) => {
                debug!(entity_id = params.entity_id, "refresh-entity: lock contended, retrying");
                Err(HandlerError::Retryable("entity lock contended".to_string()))
            }
            Err(e) => Err(HandlerError::Retryable(e.to_string())),
        }
    }
}

#[derive(Deserialize)]
struct ReportKeyParams {
    report_key: String,
}

pub struct UpdateReportHandler {
    stats: Arc<Stats>,
}

impl UpdateReportHandler {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl ActionHandler for UpdateReportHandler {
    async fn handle(&self, conn: &mut Conn<'_>, pool: &DbPool, params_json: &str, _multiplicity: i64) -> Result<(), HandlerError> {
        let params: ReportKeyParams = serde_json::from_str(params_json)
            .map_err(|e| HandlerError::Fatal(format!("update-report: malformed params: {e}")))?;

        match dmr_report::update_report(conn, pool, WORKER_ID, &params.report_key, dmr_report::DEFAULT_BATCH_SIZE).await {
            Ok(Some(_)) => {
                self.stats.record_report_updated();
                Ok(())
            }
            Ok(None) => {
                debug!(report_key = %params.report_key, "update-report: lock contended, retrying");
                Err(HandlerError::Retryable("report lock contended".to_string()))
            }
            Err(e) => Err(HandlerError::Retryable(e.to_string())),
        }
    }
}

/// `process-record`/`handle-interesting`/`handle-notice` carry no further
/// mart-mutation semantics of their own: entity-level convergence is driven
/// entirely by `refresh-entity`, which every `AFFECTED_ENTITIES` entry
/// already schedules. These stay registered (an unregistered action would
/// dead-letter, which is the wrong outcome for a message part the listener
/// is explicitly configured to route) but only record that the part was
/// seen.
pub struct NoopHandler {
    action: &'static str,
    stats: Arc<Stats>,
}

impl NoopHandler {
    pub fn new(action: &'static str, stats: Arc<Stats>) -> Self {
        Self { action, stats }
    }
}

#[async_trait]
impl ActionHandler for NoopHandler {
    async fn handle(&self, _conn: &mut Conn<'_>, _pool: &DbPool, params_json: &str, _multiplicity: i64) -> Result<(), HandlerError> {
        debug!(action = self.action, params = params_json, "no-op handler invoked");
        self.stats.record_message_processed();
        Ok(())
    }
}
