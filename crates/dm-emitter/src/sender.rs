// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Submission of normalized metrics to the metrics intake.

use crate::errors::{ConfigError, SendError};
use crate::processor::NormalizedMetric;
use crate::protocol::Common;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use std::io::Write;
use std::time::Duration;
use tracing::debug;
use zstd::stream::write::Encoder;

const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[async_trait]
pub trait MetricsSender: Send + Sync {
    /// Sends one dataset's metrics, decorated with the dataset's common block.
    async fn send_metrics_with_common_attributes(
        &self,
        common: &Common,
        metrics: Vec<NormalizedMetric>,
    ) -> Result<(), SendError>;
}

#[derive(Serialize)]
struct MetricsBlock<'a> {
    common: &'a Common,
    metrics: &'a [NormalizedMetric],
}

/// Serializes and compresses a single metrics block into the intake's batch format.
pub(crate) fn encode_payload(
    common: &Common,
    metrics: &[NormalizedMetric],
    compression_level: i32,
) -> Result<Vec<u8>, SendError> {
    let body = serde_json::to_vec(&[MetricsBlock { common, metrics }])
        .map_err(|e| SendError::Payload(e.to_string()))?;
    let mut encoder = Encoder::new(Vec::new(), compression_level)
        .map_err(|e| SendError::Payload(e.to_string()))?;
    encoder
        .write_all(&body)
        .map_err(|e| SendError::Payload(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SendError::Payload(e.to_string()))
}

/// Metrics sender posting zstd-compressed JSON batches.
#[derive(Debug, Clone)]
pub struct HttpMetricsSender {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    compression_level: i32,
}

impl HttpMetricsSender {
    pub fn new(
        url: impl Into<String>,
        license_key: &str,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        headers.insert(
            "Api-Key",
            HeaderValue::from_str(license_key)
                .map_err(|_| ConfigError::Invalid("license key is not a valid header".into()))?,
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            headers,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        })
    }
}

#[async_trait]
impl MetricsSender for HttpMetricsSender {
    async fn send_metrics_with_common_attributes(
        &self,
        common: &Common,
        metrics: Vec<NormalizedMetric>,
    ) -> Result<(), SendError> {
        if metrics.is_empty() {
            return Ok(());
        }

        let body = encode_payload(common, &metrics, self.compression_level)?;
        debug!(
            metrics = metrics.len(),
            bytes = body.len(),
            "Posting metrics payload"
        );

        let resp = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| SendError::Destination(e.to_string()))?;

        match resp.status() {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(()),
            status => Err(SendError::Rejected(status.as_u16())),
        }
    }
}
