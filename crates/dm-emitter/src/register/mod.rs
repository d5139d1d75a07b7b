// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entity registration: the remote service contract and the worker pool driving it.

pub mod http;
pub mod worker;

use crate::entity::{EntityId, EntityKey};
use crate::errors::RegisterError;
use crate::protocol::EntityFields;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Entity descriptor sent to the registration service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(rename = "displayName", default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl RegisterEntity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.name.as_str())
    }

    /// Size of the descriptor once serialized, used to bound batch payloads.
    pub fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(0)
    }
}

impl From<&EntityFields> for RegisterEntity {
    fn from(fields: &EntityFields) -> Self {
        Self {
            name: fields.name.clone(),
            entity_type: fields.entity_type.clone(),
            display_name: fields.display_name.clone(),
            metadata: fields.metadata.clone(),
        }
    }
}

/// Outcome for one entity of a registration batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntityResponse {
    #[serde(rename = "entityId", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    pub key: EntityKey,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl RegisterEntityResponse {
    pub fn registered(key: EntityKey, id: EntityId) -> Self {
        Self {
            name: key.to_string(),
            id: Some(id),
            key,
            err: None,
        }
    }

    pub fn failed(key: EntityKey, reason: impl Into<String>) -> Self {
        Self {
            name: key.to_string(),
            id: None,
            key,
            err: Some(reason.into()),
        }
    }

    /// Identifier assigned to the entity, if registration succeeded.
    pub fn assigned_id(&self) -> Option<EntityId> {
        match (&self.err, self.id) {
            (None, Some(id)) if !id.is_empty() => Some(id),
            _ => None,
        }
    }
}

/// Remote registration service. Partial success is reported per entity, not per call.
#[async_trait]
pub trait RegisterClient: Send + Sync {
    async fn register_batch(
        &self,
        agent_id: EntityId,
        entities: &[RegisterEntity],
    ) -> Result<Vec<RegisterEntityResponse>, RegisterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_entity_from_fields() {
        let fields = EntityFields {
            name: "redis:6379".to_string(),
            entity_type: "RedisInstance".to_string(),
            display_name: String::new(),
            metadata: Map::new(),
        };
        let entity = RegisterEntity::from(&fields);

        assert_eq!(entity.key(), EntityKey::from("redis:6379"));
        assert_eq!(
            serde_json::to_string(&entity).expect("serializable"),
            r#"{"name":"redis:6379","type":"RedisInstance"}"#
        );
        assert_eq!(entity.serialized_len(), 44);
    }

    #[test]
    fn test_assigned_id() {
        let key = EntityKey::from("host-A");
        assert_eq!(
            RegisterEntityResponse::registered(key.clone(), EntityId::new(10)).assigned_id(),
            Some(EntityId::new(10))
        );
        assert_eq!(
            RegisterEntityResponse::failed(key.clone(), "quota").assigned_id(),
            None
        );
        assert_eq!(
            RegisterEntityResponse::registered(key, EntityId::EMPTY).assigned_id(),
            None
        );
    }

    #[test]
    fn test_response_decoding() {
        let raw = r#"[
            {"entityId": 123, "key": "host-A", "name": "host-A"},
            {"key": "host-B", "name": "host-B", "error": "invalid entity type"}
        ]"#;
        let responses: Vec<RegisterEntityResponse> =
            serde_json::from_str(raw).expect("decodable");

        assert_eq!(responses[0].assigned_id(), Some(EntityId::new(123)));
        assert_eq!(responses[1].err.as_deref(), Some("invalid entity type"));
    }
}
