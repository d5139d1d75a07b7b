// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::fmt::Display;

/// Terminal failures of the v4 payload gate. Payloads failing here never reach the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("no content to parse")]
    NoContent,
    #[error("integration protocol version 4 is not enabled")]
    ProtocolV4NotEnabled,
    #[error("invalid v4 payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by a registration call as a whole. Per-entity rejections travel
/// inside the response instead.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("register request failed: {0}")]
    Transport(String),
    #[error("register request returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode register response: {0}")]
    Decode(String),
    #[error("agent identity is not available")]
    MissingAgentIdentity,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("failed to prepare metrics payload: {0}")]
    Payload(String),
    #[error("metrics endpoint rejected payload with status {0}")]
    Rejected(u16),
    #[error("metrics endpoint unavailable: {0}")]
    Destination(String),
}

impl SendError {
    /// Rejections in the 4xx range will not succeed on retry.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Payload(_) => true,
            Self::Rejected(code) => (400..500).contains(code),
            Self::Destination(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventBuildError {
    #[error("event summary is missing or empty")]
    MissingSummary,
}

/// Aggregate error describing every dataset of a group that could not be emitted.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EmitError {
    pub failed: usize,
    pub total: usize,
    message: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EmitterError {
    #[error("emitter is shutting down")]
    ShuttingDown,
    #[error("emitter queue is closed")]
    QueueClosed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Builds a single error out of the failures found while emitting `dataset_len` datasets.
///
/// Repeated messages are reported once, in the order they were first seen.
pub fn compose_emit_error<E: Display>(emit_errs: &[E], dataset_len: usize) -> Option<EmitError> {
    if emit_errs.is_empty() {
        return None;
    }

    let mut seen = HashSet::new();
    let reasons: Vec<String> = emit_errs
        .iter()
        .map(ToString::to_string)
        .filter(|msg| seen.insert(msg.clone()))
        .collect();

    Some(EmitError {
        failed: emit_errs.len(),
        total: dataset_len,
        message: format!(
            "{} out of {} datasets could not be emitted. Reasons: {}",
            emit_errs.len(),
            dataset_len,
            reasons.join(",")
        ),
    })
}
