// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Normalization of integration metrics before they are handed to the metrics sender.

use crate::entity::EntityId;
use crate::protocol::{Common, EntityFields, Metric};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryValue {
    pub count: f64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MetricKind {
    Gauge {
        value: f64,
    },
    Count {
        value: f64,
        #[serde(rename = "interval.ms")]
        interval_ms: i64,
    },
    Summary {
        value: SummaryValue,
        #[serde(rename = "interval.ms")]
        interval_ms: i64,
    },
    CumulativeCount {
        value: f64,
    },
    CumulativeRate {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedMetric {
    pub name: String,
    #[serde(flatten)]
    pub kind: MetricKind,
    pub attributes: Map<String, Value>,
    pub timestamp: i64,
}

/// Applies the integration's metadata to the metrics of one dataset.
#[derive(Debug, Clone)]
pub struct IntegrationProcessor {
    pub interval: Duration,
    pub labels: BTreeMap<String, String>,
    pub extra_annotations: BTreeMap<String, String>,
}

impl IntegrationProcessor {
    /// Converts protocol metrics into sender metrics. Metrics with an unknown type or a value
    /// of the wrong shape are logged and left out.
    ///
    /// `entity_id` is attached as `entity.id` when the entity identity is known.
    pub fn process_metrics(
        &self,
        metrics: &[Metric],
        common: &Common,
        entity: &EntityFields,
        entity_id: Option<EntityId>,
    ) -> Vec<NormalizedMetric> {
        metrics
            .iter()
            .filter_map(|metric| match self.kind(metric, common) {
                Ok(kind) => Some(NormalizedMetric {
                    name: metric.name.clone(),
                    kind,
                    attributes: self.attributes(metric, entity, entity_id),
                    timestamp: metric
                        .timestamp
                        .or(common.timestamp)
                        .unwrap_or_else(now_millis),
                }),
                Err(reason) => {
                    warn!(
                        metric_name = %metric.name,
                        metric_type = %metric.metric_type,
                        reason,
                        "discarding metric"
                    );
                    None
                }
            })
            .collect()
    }

    fn interval_ms(&self, metric: &Metric, common: &Common) -> i64 {
        metric
            .interval_ms
            .or(common.interval_ms)
            .unwrap_or_else(|| i64::try_from(self.interval.as_millis()).unwrap_or(i64::MAX))
    }

    fn kind(&self, metric: &Metric, common: &Common) -> Result<MetricKind, &'static str> {
        let number = || metric.value.as_f64().ok_or("value is not a number");
        match metric.metric_type.as_str() {
            "gauge" => Ok(MetricKind::Gauge { value: number()? }),
            "count" => Ok(MetricKind::Count {
                value: number()?,
                interval_ms: self.interval_ms(metric, common),
            }),
            "summary" => {
                let value = SummaryValue::deserialize(&metric.value)
                    .map_err(|_| "summary value must have count, sum, min and max")?;
                Ok(MetricKind::Summary {
                    value,
                    interval_ms: self.interval_ms(metric, common),
                })
            }
            "cumulative-count" => Ok(MetricKind::CumulativeCount { value: number()? }),
            "cumulative-rate" => Ok(MetricKind::CumulativeRate { value: number()? }),
            _ => Err("unsupported metric type"),
        }
    }

    fn attributes(
        &self,
        metric: &Metric,
        entity: &EntityFields,
        entity_id: Option<EntityId>,
    ) -> Map<String, Value> {
        let mut attributes = metric.attributes.clone();

        for (key, value) in &self.labels {
            attributes
                .entry(format!("label.{key}"))
                .or_insert_with(|| Value::String(value.clone()));
        }
        for (key, value) in &self.extra_annotations {
            attributes
                .entry(key.clone())
                .or_insert_with(|| Value::String(value.clone()));
        }

        let entity_attributes = [
            ("entity.name", &entity.name),
            ("entity.type", &entity.entity_type),
            ("entity.displayName", &entity.display_name),
        ];
        for (key, value) in entity_attributes {
            if !value.is_empty() {
                attributes
                    .entry(key.to_string())
                    .or_insert_with(|| Value::String(value.clone()));
            }
        }
        if let Some(id) = entity_id.filter(|id| !id.is_empty()) {
            attributes.insert("entity.id".to_string(), id.value().into());
        }

        attributes
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
