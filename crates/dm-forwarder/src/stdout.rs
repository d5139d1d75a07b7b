// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use dm_emitter::emit::{EventRecord, InventoryDataset, PluginEmitter};
use dm_emitter::entity::{Entity, EntityKey};
use serde_json::{json, Value};
use std::io::Write;
use tracing::error;

/// Writes inventory deltas and events to stdout, one JSON document per line.
#[derive(Debug, Default)]
pub struct StdoutPluginEmitter;

impl StdoutPluginEmitter {
    fn write_line(&self, document: &Value) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{document}") {
            error!(error = %e, "Failed to write to stdout");
        }
    }
}

pub(crate) fn inventory_document(
    plugin_id: &str,
    dataset: &InventoryDataset,
    entity: &Entity,
) -> Value {
    json!({
        "type": "inventory",
        "pluginId": plugin_id,
        "entityKey": entity.key,
        "entityID": entity.id,
        "data": dataset,
    })
}

pub(crate) fn event_document(event: &EventRecord, entity_key: &EntityKey) -> Value {
    json!({
        "type": "event",
        "entityKey": entity_key,
        "event": event,
    })
}

impl PluginEmitter for StdoutPluginEmitter {
    fn emit_inventory(&self, plugin_id: &str, dataset: InventoryDataset, entity: Entity) {
        self.write_line(&inventory_document(plugin_id, &dataset, &entity));
    }

    fn emit_event(&self, event: EventRecord, entity_key: &EntityKey) {
        self.write_line(&event_document(&event, entity_key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_emitter::emit::{build_event, EventOptions};
    use dm_emitter::entity::EntityId;
    use std::collections::BTreeMap;

    #[test]
    fn test_inventory_document() {
        let dataset = vec![BTreeMap::from([
            ("id".to_string(), json!("labels/env")),
            ("value".to_string(), json!("prod")),
        ])];
        let entity = Entity::new(EntityKey::from("host-A"), Some(EntityId::new(3)));

        let doc = inventory_document("integration/nri-redis", &dataset, &entity);

        assert_eq!(doc["type"], "inventory");
        assert_eq!(doc["pluginId"], "integration/nri-redis");
        assert_eq!(doc["entityKey"], "host-A");
        assert_eq!(doc["entityID"], 3);
        assert_eq!(doc["data"][0]["id"], "labels/env");
    }

    #[test]
    fn test_event_document() {
        let Value::Object(raw) = json!({"summary": "restarted"}) else {
            unreachable!()
        };
        let event = build_event(&EventOptions::default(), &raw).expect("valid event");

        let doc = event_document(&event, &EntityKey::from("host-A"));

        assert_eq!(doc["type"], "event");
        assert_eq!(doc["entityKey"], "host-A");
        assert_eq!(doc["event"]["summary"], "restarted");
    }
}
