//! Info-message listener (spec.md §4.F): parses one upstream message, maps
//! each recognized part to a configured action, and commits one task per
//! entity/record/notice through the scheduling service.

pub mod parse;

use dmr_db::{queue, Conn, DbPool};
use hex::encode as hex_encode;
use parse::{parse_info_message, InfoMessage};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Uninitialized,
    Available,
    Destroying,
    Destroyed,
}

/// Message-part -> action map (spec.md §4.F). A part with no configured
/// action is silently skipped.
#[derive(Debug, Clone)]
pub struct ActionMap {
    pub record: Option<String>,
    pub affected_entity: Option<String>,
    pub interesting_entity: Option<String>,
    pub notice: Option<String>,
}

impl Default for ActionMap {
    fn default() -> Self {
        Self {
            record: Some("process-record".to_string()),
            affected_entity: Some("refresh-entity".to_string()),
            interesting_entity: Some("handle-interesting".to_string()),
            notice: Some("handle-notice".to_string()),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProcessStats {
    pub tasks_committed: usize,
    pub parts_skipped: usize,
}

pub struct Listener {
    state: Mutex<ListenerState>,
    destroyed: Notify,
    action_map: ActionMap,
}

impl Listener {
    pub fn new(action_map: ActionMap) -> Self {
        Self {
            state: Mutex::new(ListenerState::Uninitialized),
            destroyed: Notify::new(),
            action_map,
        }
    }

    pub async fn state(&self) -> ListenerState {
        *self.state.lock().await
    }

    /// `UNINITIALIZED -> AVAILABLE`. Fails (leaving state `UNINITIALIZED`)
    /// if called from any other state.
    pub async fn init(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if *state != ListenerState::Uninitialized {
            anyhow::bail!("listener init called from state {:?}", *state);
        }
        *state = ListenerState::Available;
        Ok(())
    }

    /// Parse one info message and commit a task per recognized, mapped part.
    /// Rejected outside `AVAILABLE` (spec.md §4.F). All of a message's task
    /// commits land in one transaction that only commits once every part has
    /// been processed (spec.md §4.F: "all inside one database transaction
    /// before acknowledging the message") — the caller should only ack the
    /// transport message once this returns `Ok`.
    pub async fn process(&self, pool: &DbPool, raw_json: &str) -> anyhow::Result<ProcessStats> {
        {
            let state = self.state.lock().await;
            if *state != ListenerState::Available {
                anyhow::bail!("process() rejected: listener is {:?}, not AVAILABLE", *state);
            }
        }

        let message = parse_info_message(raw_json)?;
        let mut tx = pool.begin().await?;
        let stats = self.commit_parts(&mut Conn::Tx(&mut tx), &message).await?;
        tx.commit().await?;
        Ok(stats)
    }

    async fn commit_parts(&self, conn: &mut Conn<'_>, message: &InfoMessage) -> anyhow::Result<ProcessStats> {
        let mut stats = ProcessStats::default();
        let now = dmr_db::now_micros();

        if let (Some(data_source), Some(record_id)) = (&message.data_source, &message.record_id) {
            match &self.action_map.record {
                Some(action) => {
                    let params = serde_json::json!({ "DATA_SOURCE": data_source, "RECORD_ID": record_id });
                    self.commit(conn, action, &params, now).await?;
                    stats.tasks_committed += 1;
                }
                None => stats.parts_skipped += 1,
            }
        }

        for entity in &message.affected_entities {
            match &self.action_map.affected_entity {
                Some(action) => {
                    let params = serde_json::json!({ "ENTITY_ID": entity.entity_id });
                    self.commit(conn, action, &params, now).await?;
                    stats.tasks_committed += 1;
                }
                None => stats.parts_skipped += 1,
            }
        }

        if let Some(interesting) = &message.interesting_entities {
            for entity in &interesting.entities {
                match &self.action_map.interesting_entity {
                    Some(action) => {
                        let params = serde_json::json!({
                            "ENTITY_ID": entity.entity_id,
                            "DEGREES": entity.degrees,
                            "FLAGS": entity.flags,
                            "SAMPLE_RECORDS": entity.sample_records.iter().map(|r| serde_json::json!({
                                "DATA_SOURCE": r.data_source,
                                "RECORD_ID": r.record_id,
                            })).collect::<Vec<_>>(),
                        });
                        self.commit(conn, action, &params, now).await?;
                        stats.tasks_committed += 1;
                    }
                    None => stats.parts_skipped += 1,
                }
            }

            for notice in &interesting.notices {
                match &self.action_map.notice {
                    Some(action) => {
                        if notice.description.as_deref() == Some("") {
                            warn!(code = %notice.code, "notice with empty description");
                        }
                        let params = serde_json::json!({ "CODE": notice.code, "DESCRIPTION": notice.description });
                        self.commit(conn, action, &params, now).await?;
                        stats.tasks_committed += 1;
                    }
                    None => stats.parts_skipped += 1,
                }
            }
        }

        Ok(stats)
    }

    async fn commit(&self, conn: &mut Conn<'_>, action: &str, params: &serde_json::Value, visible_at: i64) -> anyhow::Result<()> {
        let params_json = params.to_string();
        let signature = task_signature(action, &params_json);
        queue::commit_task(conn, &signature, action, &params_json, 1, visible_at).await?;
        debug!(action, signature, "task committed from info message");
        Ok(())
    }

    /// `destroy()` is idempotent: a second caller while one is already in
    /// flight blocks until the first completes, then returns immediately.
    pub async fn destroy(&self) -> anyhow::Result<()> {
        loop {
            let mut state = self.state.lock().await;
            match *state {
                ListenerState::Destroyed => return Ok(()),
                ListenerState::Destroying => {
                    drop(state);
                    self.destroyed.notified().await;
                    continue;
                }
                _ => {
                    *state = ListenerState::Destroying;
                    drop(state);
                    *self.state.lock().await = ListenerState::Destroyed;
                    self.destroyed.notify_waiters();
                    return Ok(());
                }
            }
        }
    }
}

fn task_signature(action: &str, params_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.as_bytes());
    hasher.update([0u8]);
    hasher.update(params_json.as_bytes());
    format!("{action}:{}", hex_encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_db::schema::ensure_schema;

    #[tokio::test]
    async fn process_rejected_before_init() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        let listener = Listener::new(ActionMap::default());
        let result = listener.process(&pool, r#"{"AFFECTED_ENTITIES":[]}"#).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn process_commits_one_task_per_recognized_part() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        let listener = Listener::new(ActionMap::default());
        listener.init().await.unwrap();

        let raw = r#"{
            "DATA_SOURCE": "CUSTOMERS",
            "RECORD_ID": "REC1",
            "AFFECTED_ENTITIES": [{"ENTITY_ID": 100}, {"ENTITY_ID": 200}]
        }"#;
        let stats = listener.process(&pool, raw).await.unwrap();
        assert_eq!(stats.tasks_committed, 3);
        assert_eq!(queue::count_by_status(&pool, queue::STATUS_READY).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unconfigured_part_is_silently_skipped() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        let mut action_map = ActionMap::default();
        action_map.notice = None;
        let listener = Listener::new(action_map);
        listener.init().await.unwrap();

        let raw = r#"{"INTERESTING_ENTITIES": {"ENTITIES": [], "NOTICES": [{"CODE": "X"}]}}"#;
        let stats = listener.process(&pool, raw).await.unwrap();
        assert_eq!(stats.tasks_committed, 0);
        assert_eq!(stats.parts_skipped, 1);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let listener = Listener::new(ActionMap::default());
        listener.init().await.unwrap();
        listener.destroy().await.unwrap();
        listener.destroy().await.unwrap();
        assert_eq!(listener.state().await, ListenerState::Destroyed);
    }

    #[tokio::test]
    async fn process_rejected_after_destroy() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        let listener = Listener::new(ActionMap::default());
        listener.init().await.unwrap();
        listener.destroy().await.unwrap();

        let result = listener.process(&pool, r#"{"AFFECTED_ENTITIES":[]}"#).await;
        assert!(result.is_err());
    }
}
