// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::entity::EntityId;
use crate::errors::{ConfigError, RegisterError};
use crate::register::{RegisterClient, RegisterEntity, RegisterEntityResponse};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::time::Duration;
use tracing::trace;

const REGISTER_BATCH_PATH: &str = "/identity/v1/register/batch";
const AGENT_ENTITY_ID_HEADER: &str = "X-NRI-Agent-Entity-Id";

/// Registration service client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRegisterClient {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl HttpRegisterClient {
    pub fn new(
        base_url: &str,
        license_key: &str,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "X-License-Key",
            HeaderValue::from_str(license_key)
                .map_err(|_| ConfigError::Invalid("license key is not a valid header".into()))?,
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}{REGISTER_BATCH_PATH}", base_url.trim_end_matches('/')),
            headers,
        })
    }
}

#[async_trait]
impl RegisterClient for HttpRegisterClient {
    async fn register_batch(
        &self,
        agent_id: EntityId,
        entities: &[RegisterEntity],
    ) -> Result<Vec<RegisterEntityResponse>, RegisterError> {
        trace!(agent_id = %agent_id, entities = entities.len(), "Posting register batch");

        let resp = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(AGENT_ENTITY_ID_HEADER, agent_id.to_string())
            .json(entities)
            .send()
            .await
            .map_err(|e| RegisterError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegisterError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| RegisterError::Transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| RegisterError::Decode(e.to_string()))
    }
}
