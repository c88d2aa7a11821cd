//! Live HTTP adapter to the resolution engine. Mirrors the shape of the
//! teacher's live broker adapters: a thin `reqwest` client wrapping one
//! upstream call, with the wire parsing kept in its own module.

use crate::parse::{to_entity_resolution, EngineResponse};
use crate::{EngineLookup, ResolutionEngine};
use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

pub struct HttpResolutionEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpResolutionEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ResolutionEngine for HttpResolutionEngine {
    async fn fetch_entity(&self, entity_id: dmr_schemas::EntityId) -> anyhow::Result<EngineLookup> {
        let url = format!("{}/entities/{}", self.base_url.trim_end_matches('/'), entity_id);
        let response = self.client.get(&url).send().await.with_context(|| format!("GET {url} failed"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(entity_id, "engine reports unknown entity");
            return Ok(EngineLookup::Unknown);
        }

        let response = response.error_for_status().with_context(|| format!("GET {url} returned an error status"))?;
        let body: EngineResponse = response.json().await.context("failed to decode engine response body")?;

        Ok(match to_entity_resolution(body) {
            None => EngineLookup::Unknown,
            Some(r) if r.is_empty() => EngineLookup::EmptyResolution,
            Some(r) => EngineLookup::Resolved(r),
        })
    }
}
