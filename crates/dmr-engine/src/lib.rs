//! Client adapter for the upstream resolution engine (spec.md's "opaque API
//! returning JSON for an entity id"). `ResolutionEngine` is the seam the
//! entity-refresh handler (`dmr-refresh`) is written against; production
//! wires up [`HttpResolutionEngine`], tests wire up [`FakeResolutionEngine`] —
//! the same split the teacher keeps between a live broker adapter and
//! `mqk-broker-paper`'s deterministic in-memory stand-in.

mod http;
mod parse;

pub use http::HttpResolutionEngine;

use async_trait::async_trait;
use dmr_schemas::EntityResolution;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// The three outcomes of fetching one entity's current resolution
/// (spec.md §4.G step 1).
#[derive(Clone)]
pub enum EngineLookup {
    /// The engine has never heard of this id, or reports it explicitly gone.
    Unknown,
    /// The engine knows the id but it currently has zero records — treated
    /// the same as `Unknown` by the refresh handler, but distinguished here
    /// since the wire representation differs.
    EmptyResolution,
    /// The engine has a live resolution with at least one record.
    Resolved(EntityResolution),
}

#[async_trait]
pub trait ResolutionEngine: Send + Sync {
    async fn fetch_entity(&self, entity_id: dmr_schemas::EntityId) -> anyhow::Result<EngineLookup>;
}

/// Deterministic in-memory resolution engine for tests. Scenarios are wired
/// up by calling [`FakeResolutionEngine::set_resolution`] or
/// [`FakeResolutionEngine::remove_entity`] before invoking the handler under
/// test, mirroring how `mqk-broker-paper`'s `PaperBroker` is seeded directly
/// rather than driven through a network call.
#[derive(Default)]
pub struct FakeResolutionEngine {
    resolutions: Mutex<BTreeMap<dmr_schemas::EntityId, EntityResolution>>,
}

impl FakeResolutionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_resolution(&self, resolution: EntityResolution) {
        self.resolutions.lock().unwrap().insert(resolution.entity_id, resolution);
    }

    pub fn remove_entity(&self, entity_id: dmr_schemas::EntityId) {
        self.resolutions.lock().unwrap().remove(&entity_id);
    }
}

#[async_trait]
impl ResolutionEngine for FakeResolutionEngine {
    async fn fetch_entity(&self, entity_id: dmr_schemas::EntityId) -> anyhow::Result<EngineLookup> {
        let resolutions = self.resolutions.lock().unwrap();
        Ok(match resolutions.get(&entity_id) {
            None => EngineLookup::Unknown,
            Some(r) if r.is_empty() => EngineLookup::EmptyResolution,
            Some(r) => EngineLookup::Resolved(r.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_schemas::{Record, RecordKey};

    #[tokio::test]
    async fn unknown_entity_returns_unknown() {
        let engine = FakeResolutionEngine::new();
        match engine.fetch_entity(999).await.unwrap() {
            EngineLookup::Unknown => {}
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolved_entity_with_records_returns_resolved() {
        let engine = FakeResolutionEngine::new();
        engine.set_resolution(EntityResolution {
            entity_id: 100,
            entity_name: Some("Acme".to_string()),
            records: vec![Record {
                key: RecordKey::new("CUSTOMERS", "REC1"),
                entity_id: 100,
                match_key: None,
                errule_code: None,
                principle: None,
            }],
            relations: vec![],
        });

        match engine.fetch_entity(100).await.unwrap() {
            EngineLookup::Resolved(r) => assert_eq!(r.records.len(), 1),
            other => panic!("expected Resolved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn entity_with_zero_records_is_empty_resolution() {
        let engine = FakeResolutionEngine::new();
        engine.set_resolution(EntityResolution {
            entity_id: 100,
            entity_name: None,
            records: vec![],
            relations: vec![],
        });

        match engine.fetch_entity(100).await.unwrap() {
            EngineLookup::EmptyResolution => {}
            other => panic!("expected EmptyResolution, got {other:?}"),
        }
    }
}

impl std::fmt::Debug for EngineLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineLookup::Unknown => write!(f, "Unknown"),
            EngineLookup::EmptyResolution => write!(f, "EmptyResolution"),
            EngineLookup::Resolved(r) => write!(f, "Resolved(entity_id={})", r.entity_id),
        }
    }
}
