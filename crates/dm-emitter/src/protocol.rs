// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Integration protocol v4 payload model and the parsing gate in front of the pipeline.
//!
//! A payload carries the integration metadata and an ordered list of datasets, one per
//! reported entity:
//!
//! ```json
//! {
//!   "protocol_version": "4",
//!   "integration": { "name": "nri-redis", "version": "1.2.0" },
//!   "data": [
//!     {
//!       "common": { "timestamp": 1656581409000, "attributes": { "env": "prod" } },
//!       "entity": { "name": "redis:6379", "type": "RedisInstance", "displayName": "redis" },
//!       "metrics": [ { "name": "redis.clients", "type": "gauge", "value": 12 } ],
//!       "inventory": { "config/maxclients": { "value": 10000 } },
//!       "events": [ { "summary": "restarted", "category": "redis" } ]
//!     }
//!   ]
//! }
//! ```

use crate::entity::EntityKey;
use crate::errors::ParseError;
use crate::feature_flags::{FeatureFlagRetriever, FLAG_PROTOCOL_V4};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Raw event as reported by the integration.
pub type EventData = Map<String, Value>;

/// Fields of a single inventory item.
pub type InventoryItem = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataV4 {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub integration: IntegrationMetadata,
    #[serde(default, rename = "data")]
    pub datasets: Vec<Dataset>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub common: Common,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub entity: EntityFields,
    #[serde(default)]
    pub inventory: BTreeMap<String, InventoryItem>,
    #[serde(default)]
    pub events: Vec<EventData>,
    #[serde(default)]
    pub ignore_entity: bool,
}

impl Dataset {
    pub fn entity_key(&self) -> EntityKey {
        self.entity.key()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Common {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, rename = "interval.ms", skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<i64>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityFields {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub entity_type: String,
    #[serde(default, rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EntityFields {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, rename = "interval.ms", skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<i64>,
}

/// Parses a v4 integration payload.
///
/// Empty input is rejected before the feature flag is consulted, and the flag is
/// consulted before any decoding happens.
pub fn parse_payload_v4(
    raw: &[u8],
    flags: &dyn FeatureFlagRetriever,
) -> Result<DataV4, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::NoContent);
    }

    if flags.get_feature_flag(FLAG_PROTOCOL_V4) != Some(true) {
        return Err(ParseError::ProtocolV4NotEnabled);
    }

    Ok(serde_json::from_slice(raw)?)
}
