// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the crate's unit tests.

use crate::emit::{EventRecord, InventoryDataset, PluginEmitter};
use crate::entity::{Entity, EntityId, EntityKey};
use crate::errors::{RegisterError, SendError};
use crate::fwrequest::{Definition, EntityFwRequest, ExecutorConfig, RequestMeta};
use crate::protocol::{Common, Dataset, EntityFields, IntegrationMetadata, Metric};
use crate::processor::NormalizedMetric;
use crate::register::{RegisterClient, RegisterEntity, RegisterEntityResponse};
use crate::sender::MetricsSender;
use async_trait::async_trait;
use hashbrown::HashMap;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub(crate) fn definition() -> Definition {
    Definition {
        name: "nri-test".to_string(),
        interval: Duration::from_secs(15),
        executor_config: ExecutorConfig {
            user: "nri-agent".to_string(),
        },
        ..Default::default()
    }
}

pub(crate) fn dataset(entity_name: &str) -> Dataset {
    Dataset {
        entity: EntityFields {
            name: entity_name.to_string(),
            entity_type: "Host".to_string(),
            ..Default::default()
        },
        common: Common::default(),
        metrics: vec![Metric {
            name: "cpu.percent".to_string(),
            metric_type: "gauge".to_string(),
            value: json!(12.5),
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub(crate) fn entity_request(entity_name: &str) -> EntityFwRequest {
    EntityFwRequest::new(
        RequestMeta {
            definition: definition(),
            correlation_id: None,
        },
        IntegrationMetadata {
            name: "nri-test".to_string(),
            version: "1.0.0".to_string(),
        },
        dataset(entity_name),
        None,
    )
}

#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    /// Rejects the named entities, accepts the rest.
    Reject(Vec<&'static str>),
    /// Fails the whole call.
    Error,
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub at: Instant,
    pub agent_id: EntityId,
    pub entities: Vec<RegisterEntity>,
}

/// Registration service double. Calls succeed for every entity unless an outcome was queued.
#[derive(Debug, Default)]
pub(crate) struct MockRegisterClient {
    outcomes: Mutex<VecDeque<Outcome>>,
    calls: Mutex<Vec<RecordedCall>>,
    ids: Mutex<HashMap<String, u64>>,
}

impl MockRegisterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: Outcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Identifier the mock assigns (or assigned) to `name`.
    pub fn id_for(&self, name: &str) -> EntityId {
        let mut ids = self.ids.lock().unwrap();
        let next = ids.len() as u64 + 1000;
        EntityId::new(*ids.entry(name.to_string()).or_insert(next))
    }
}

#[async_trait]
impl RegisterClient for MockRegisterClient {
    async fn register_batch(
        &self,
        agent_id: EntityId,
        entities: &[RegisterEntity],
    ) -> Result<Vec<RegisterEntityResponse>, RegisterError> {
        self.calls.lock().unwrap().push(RecordedCall {
            at: Instant::now(),
            agent_id,
            entities: entities.to_vec(),
        });

        let outcome = self.outcomes.lock().unwrap().pop_front();
        match outcome {
            Some(Outcome::Error) => Err(RegisterError::Status {
                status: 503,
                body: "unavailable".to_string(),
            }),
            Some(Outcome::Reject(rejected)) => Ok(entities
                .iter()
                .map(|e| {
                    if rejected.contains(&e.name.as_str()) {
                        RegisterEntityResponse::failed(e.key(), "rejected")
                    } else {
                        RegisterEntityResponse::registered(e.key(), self.id_for(&e.name))
                    }
                })
                .collect()),
            None => Ok(entities
                .iter()
                .map(|e| RegisterEntityResponse::registered(e.key(), self.id_for(&e.name)))
                .collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SentMetrics {
    pub common: Common,
    pub metrics: Vec<NormalizedMetric>,
}

/// Metrics sender double recording every batch. Fails while `fail_with` is set.
#[derive(Debug, Default)]
pub(crate) struct RecordingMetricsSender {
    pub sent: Mutex<Vec<SentMetrics>>,
    pub fail_with: Mutex<Option<String>>,
    pub notify: Notify,
}

#[async_trait]
impl MetricsSender for RecordingMetricsSender {
    async fn send_metrics_with_common_attributes(
        &self,
        common: &Common,
        metrics: Vec<NormalizedMetric>,
    ) -> Result<(), SendError> {
        if let Some(reason) = self.fail_with.lock().unwrap().clone() {
            return Err(SendError::Destination(reason));
        }
        self.sent.lock().unwrap().push(SentMetrics {
            common: common.clone(),
            metrics,
        });
        self.notify.notify_one();
        Ok(())
    }
}

/// Plugin emitter double recording inventory and events.
#[derive(Debug, Default)]
pub(crate) struct RecordingPluginEmitter {
    pub inventory: Mutex<Vec<(String, InventoryDataset, Entity)>>,
    pub events: Mutex<Vec<(EventRecord, EntityKey)>>,
}

impl PluginEmitter for RecordingPluginEmitter {
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
