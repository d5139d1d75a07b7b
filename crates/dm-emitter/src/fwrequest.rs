// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::entity::{EntityId, EntityKey};
use crate::protocol::{DataV4, Dataset, IntegrationMetadata};
use std::collections::BTreeMap;
use std::time::Duration;

/// Category prefix of the plugin id used for inventory reported by integrations.
const INTEGRATION_PLUGIN_CATEGORY: &str = "integration";

/// Execution settings of the integration that produced a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// OS user the integration runs as, empty when it inherits the agent user.
    pub user: String,
}

/// Static description of a configured integration instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub name: String,
    pub interval: Duration,
    pub labels: BTreeMap<String, String>,
    pub extra_annotations: BTreeMap<String, String>,
    pub executor_config: ExecutorConfig,
}

impl Default for Definition {
    fn default() -> Self {
        Self {
            name: String::new(),
            interval: Duration::from_secs(30),
            labels: BTreeMap::new(),
            extra_annotations: BTreeMap::new(),
            executor_config: ExecutorConfig::default(),
        }
    }
}

impl Definition {
    /// Inventory plugin id for data reported under `integration_name`.
    ///
    /// Falls back to the definition name when the payload did not name itself.
    pub fn plugin_id(&self, integration_name: &str) -> String {
        let name = if integration_name.is_empty() {
            self.name.as_str()
        } else {
            integration_name
        };
        format!("{INTEGRATION_PLUGIN_CATEGORY}/{name}")
    }
}

/// Request scoped metadata travelling with every dataset of a forward request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub definition: Definition,
    pub correlation_id: Option<String>,
}

/// One integration payload submitted to the emitter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardRequest {
    pub meta: RequestMeta,
    pub data: DataV4,
}

impl ForwardRequest {
    pub fn new(definition: Definition, data: DataV4) -> Self {
        Self {
            meta: RequestMeta {
                definition,
                correlation_id: None,
            },
            data,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.meta.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Forward request a dataset was split from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOrigin {
    /// Sequence number assigned by the forward consumer.
    pub seq: u64,
    /// Number of datasets the request carried.
    pub datasets: usize,
}

impl Default for RequestOrigin {
    fn default() -> Self {
        Self {
            seq: 0,
            datasets: 1,
        }
    }
}

/// A single dataset on its way through registration and emission.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFwRequest {
    pub meta: RequestMeta,
    pub integration: IntegrationMetadata,
    pub data: Dataset,
    id: Option<EntityId>,
    origin: RequestOrigin,
}

impl EntityFwRequest {
    pub fn new(
        meta: RequestMeta,
        integration: IntegrationMetadata,
        data: Dataset,
        id: Option<EntityId>,
    ) -> Self {
        Self {
            meta,
            integration,
            data,
            id,
            origin: RequestOrigin::default(),
        }
    }

    pub fn with_origin(mut self, origin: RequestOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn origin(&self) -> RequestOrigin {
        self.origin
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    pub fn registered_with(mut self, id: EntityId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn entity_key(&self) -> EntityKey {
        self.data.entity_key()
    }

    pub fn definition(&self) -> &Definition {
        &self.meta.definition
    }

    /// Labels and extra annotations applied to everything emitted for this dataset.
    pub fn labels_and_extra_annotations(
        &self,
    ) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let definition = self.definition();
        let labels = definition.labels.clone();
        let mut annotations = definition.extra_annotations.clone();
        if let Some(correlation_id) = &self.meta.correlation_id {
            annotations
                .entry("correlationId".to_string())
                .or_insert_with(|| correlation_id.clone());
        }
        (labels, annotations)
    }
}
