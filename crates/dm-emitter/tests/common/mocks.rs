// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recording collaborators for end-to-end pipeline tests

use dm_emitter::emit::{EventRecord, InventoryDataset, PluginEmitter};
use dm_emitter::entity::{Entity, EntityKey};
use dm_emitter::errors::SendError;
use dm_emitter::processor::NormalizedMetric;
use dm_emitter::protocol::Common;
use dm_emitter::sender::MetricsSender;
use std::sync::Mutex;

/// Metrics sender keeping every submitted batch in memory
#[derive(Default)]
pub struct MockMetricsSender {
    pub batches: Mutex<Vec<Vec<NormalizedMetric>>>,
}

#[async_trait::async_trait]
impl MetricsSender for MockMetricsSender {
    async fn send_metrics_with_common_attributes(
        &self,
        _common: &Common,
        metrics: Vec<NormalizedMetric>,
    ) -> Result<(), SendError> {
        self.batches.lock().unwrap().push(metrics);
        Ok(())
    }
}

/// Plugin emitter keeping inventory and events in memory
#[derive(Default)]
pub struct MockPluginEmitter {
    pub inventory: Mutex<Vec<(String, InventoryDataset, Entity)>>,
    pub events: Mutex<Vec<(EventRecord, EntityKey)>>,
}

impl PluginEmitter for MockPluginEmitter {
    fn emit_inventory(&self, plugin_id: &str, dataset: InventoryDataset, entity: Entity) {
        self.inventory
            .lock()
            .unwrap()
            .push((plugin_id.to_string(), dataset, entity));
    }

    fn emit_event(&self, event: EventRecord, entity_key: &EntityKey) {
        self.events.lock().unwrap().push((event, entity_key.clone()));
    }
}
