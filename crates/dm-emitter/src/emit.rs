// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Final emission of a dataset once its entity identity is settled.
//!
//! Every dataset goes through three independent steps: inventory, events and metrics.
//! A failure in one step never prevents the others from running.

use crate::entity::{Entity, EntityId, EntityKey};
use crate::errors::{compose_emit_error, EmitError, EventBuildError, SendError};
use crate::fwrequest::{Definition, EntityFwRequest};
use hashbrown::HashMap;
use crate::processor::IntegrationProcessor;
use crate::protocol::{Dataset, EventData, IntegrationMetadata};
use crate::sender::MetricsSender;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_EVENT_TYPE: &str = "InfrastructureEvent";
const DEFAULT_EVENT_CATEGORY: &str = "notifications";

/// One inventory item: its `id` plus arbitrary fields.
pub type InventoryItemData = BTreeMap<String, Value>;

pub type InventoryDataset = Vec<InventoryItemData>;

/// Fully built event, ready to be handed to the event emitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EventRecord(Map<String, Value>);

impl EventRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// Downstream for inventory deltas and events, keyed the way the agent's plugins report.
pub trait PluginEmitter: Send + Sync {
    fn emit_inventory(&self, plugin_id: &str, dataset: InventoryDataset, entity: Entity);
    fn emit_event(&self, event: EventRecord, entity_key: &EntityKey);
}

/// Options shared by every event of one dataset.
#[derive(Debug, Clone, Default)]
pub struct EventOptions {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub entity: Option<Entity>,
    pub integration_user: Option<String>,
}

/// Builds an event record out of a raw integration event and the dataset's shared options.
pub fn build_event(
    options: &EventOptions,
    event: &EventData,
) -> Result<EventRecord, EventBuildError> {
    let summary_ok = matches!(event.get("summary"), Some(Value::String(s)) if !s.is_empty());
    if !summary_ok {
        return Err(EventBuildError::MissingSummary);
    }

    let mut record = Map::new();
    record.insert("eventType".to_string(), DEFAULT_EVENT_TYPE.into());
    record.insert("category".to_string(), DEFAULT_EVENT_CATEGORY.into());

    for (key, value) in event {
        if key != "attributes" {
            record.insert(key.clone(), value.clone());
        }
    }

    if let Some(attributes) = event_attributes(event) {
        for (key, value) in attributes {
            record.insert(format!("attr.{key}"), value.clone());
        }
    }

    for (key, value) in &options.labels {
        record.insert(format!("label.{key}"), Value::String(value.clone()));
    }
    for (key, value) in &options.annotations {
        record.insert(key.clone(), Value::String(value.clone()));
    }

    if let Some(entity) = &options.entity {
        record.insert("entityKey".to_string(), entity.key.to_string().into());
        if let Some(id) = entity.id {
            record.insert("entityID".to_string(), id.value().into());
        }
    }

    if let Some(user) = &options.integration_user {
        record.insert("integrationUser".to_string(), Value::String(user.clone()));
    }

    Ok(EventRecord(record))
}

/// Event specific attributes. Anything other than an object is ignored.
fn event_attributes(event: &EventData) -> Option<&Map<String, Value>> {
    match event.get("attributes") {
        Some(Value::Object(attributes)) => Some(attributes),
        _ => None,
    }
}

/// Builds the inventory delta for a dataset.
pub fn build_inventory_dataset(
    dataset: &Dataset,
    labels: &BTreeMap<String, String>,
    integration_user: &str,
) -> InventoryDataset {
    let entity_key = dataset.entity.name.as_str();
    let mut inventory: InventoryDataset = dataset
        .inventory
        .iter()
        .map(|(key, item)| {
            let mut data = item.clone();
            data.insert("id".to_string(), Value::String(key.clone()));
            data.entry("entityKey".to_string())
                .or_insert_with(|| Value::String(entity_key.to_string()));
            data
        })
        .collect();

    for (key, value) in labels {
        inventory.push(BTreeMap::from([
            ("id".to_string(), Value::String(format!("labels/{key}"))),
            ("value".to_string(), Value::String(value.clone())),
            ("entityKey".to_string(), Value::String(entity_key.to_string())),
        ]));
    }

    if !integration_user.is_empty() {
        inventory.push(BTreeMap::from([
            ("id".to_string(), Value::String("integrationUser".to_string())),
            ("value".to_string(), Value::String(integration_user.to_string())),
            ("entityKey".to_string(), Value::String(entity_key.to_string())),
        ]));
    }

    inventory
}

/// Emits inventory, events and metrics of registered (or identity-less) datasets.
#[derive(Clone)]
pub struct DatasetEmitter {
    plugin_emitter: Arc<dyn PluginEmitter>,
    metrics_sender: Arc<dyn MetricsSender>,
}

impl DatasetEmitter {
    pub fn new(plugin_emitter: Arc<dyn PluginEmitter>, metrics_sender: Arc<dyn MetricsSender>) -> Self {
        Self {
            plugin_emitter,
            metrics_sender,
        }
    }

    /// Emits one dataset. Only a metrics submission failure is reported back; inventory and
    /// event problems are handled in place.
    pub async fn emit_dataset(&self, request: &EntityFwRequest) -> Result<(), SendError> {
        let (labels, annotations) = request.labels_and_extra_annotations();
        let definition = request.definition();
        let plugin_id = definition.plugin_id(&request.integration.name);

        self.emit_inventory(&plugin_id, definition, request.id(), &request.data, &labels);
        self.emit_events(definition, &request.data, &labels, &annotations, request.id());
        emit_metrics(
            self.metrics_sender.as_ref(),
            definition,
            &request.integration,
            &request.data,
            request.id(),
            labels,
            annotations,
        )
        .await
    }

    fn emit_inventory(
        &self,
        plugin_id: &str,
        definition: &Definition,
        entity_id: Option<EntityId>,
        dataset: &Dataset,
        labels: &BTreeMap<String, String>,
    ) {
        if dataset.inventory.is_empty() {
            return;
        }
        let inventory =
            build_inventory_dataset(dataset, labels, &definition.executor_config.user);
        self.plugin_emitter.emit_inventory(
            plugin_id,
            inventory,
            Entity::new(dataset.entity_key(), entity_id),
        );
    }

    fn emit_events(
        &self,
        definition: &Definition,
        dataset: &Dataset,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        entity_id: Option<EntityId>,
    ) {
        if dataset.events.is_empty() {
            return;
        }

        let entity_key = dataset.entity_key();
        let user = &definition.executor_config.user;
        let options = EventOptions {
            labels: labels.clone(),
            annotations: annotations.clone(),
            entity: entity_id
                .filter(|id| !id.is_empty())
                .map(|id| Entity::new(entity_key.clone(), Some(id))),
            integration_user: (!user.is_empty()).then(|| user.clone()),
        };

        for event in &dataset.events {
            match build_event(&options, event) {
                Ok(record) => self.plugin_emitter.emit_event(record, &entity_key),
                Err(e) => {
                    warn!(
                        payload = ?event,
                        error = %e,
                        "discarding event, failed building event data."
                    );
                }
            }
        }
    }
}

async fn emit_metrics(
    sender: &dyn MetricsSender,
    definition: &Definition,
    integration: &IntegrationMetadata,
    dataset: &Dataset,
    entity_id: Option<EntityId>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
) -> Result<(), SendError> {
    let processor = IntegrationProcessor {
        interval: definition.interval,
        labels,
        extra_annotations: annotations,
    };
    let metrics = processor.process_metrics(
        &dataset.metrics,
        &dataset.common,
        &dataset.entity,
        entity_id,
    );
    debug!(
        integration_name = %integration.name,
        metrics = metrics.len(),
        "Sending dataset metrics"
    );

    sender
        .send_metrics_with_common_attributes(&dataset.common, metrics)
        .await
        .map_err(|e| {
            warn!(
                integration_name = %definition.name,
                error = %e,
                permanent = e.is_permanent(),
                "could not send metrics"
            );
            e
        })
}

/// Emission outcome of every dataset of one forward request.
#[derive(Debug)]
pub struct CompletedRequest {
    pub integration_name: String,
    pub datasets: usize,
    pub error: Option<EmitError>,
}

#[derive(Debug, Default)]
struct PendingRequest {
    done: usize,
    errors: Vec<SendError>,
}

/// Collects per dataset results until all datasets of their forward request are emitted.
///
/// Datasets of different requests may complete in any order.
#[derive(Debug, Default)]
pub struct RequestOutcomes {
    pending: HashMap<u64, PendingRequest>,
}

impl RequestOutcomes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of one dataset. Returns the request outcome once its last dataset
    /// is recorded.
    pub fn record(
        &mut self,
        request: &EntityFwRequest,
        result: Result<(), SendError>,
    ) -> Option<CompletedRequest> {
        let origin = request.origin();
        let pending = self.pending.entry(origin.seq).or_default();
        pending.done += 1;
        if let Err(e) = result {
            pending.errors.push(e);
        }
        if pending.done < origin.datasets {
            return None;
        }

        let pending = self.pending.remove(&origin.seq)?;
        Some(CompletedRequest {
            integration_name: request.definition().name.clone(),
            datasets: origin.datasets,
            error: compose_emit_error(&pending.errors, origin.datasets),
        })
    }

    /// Number of requests with datasets still to be emitted.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
