// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters updated by every stage of the pipeline.
#[derive(Debug, Default)]
struct Counters {
    requests_forwarded: AtomicU64,
    datasets_received: AtomicU64,
    entities_registered: AtomicU64,
    registration_failures: AtomicU64,
    datasets_emitted: AtomicU64,
    datasets_failed: AtomicU64,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_forwarded: u64,
    pub datasets_received: u64,
    pub entities_registered: u64,
    pub registration_failures: u64,
    pub datasets_emitted: u64,
    /// Datasets whose metrics could not be submitted.
    pub datasets_failed: u64,
}

impl StatsSnapshot {
    /// Received datasets that have not been emitted or failed yet.
    pub fn datasets_pending(&self) -> u64 {
        self.datasets_received
            .saturating_sub(self.datasets_emitted + self.datasets_failed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    counters: Arc<Counters>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_request_forwarded(&self) {
        self.counters
            .requests_forwarded
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_datasets_received(&self, count: usize) {
        self.counters
            .datasets_received
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_entities_registered(&self, count: usize) {
        self.counters
            .entities_registered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_registration_failures(&self, count: usize) {
        self.counters
            .registration_failures
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_datasets_emitted(&self, count: usize) {
        self.counters
            .datasets_emitted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_datasets_failed(&self, count: usize) {
        self.counters
            .datasets_failed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_forwarded: self.counters.requests_forwarded.load(Ordering::Relaxed),
            datasets_received: self.counters.datasets_received.load(Ordering::Relaxed),
            entities_registered: self.counters.entities_registered.load(Ordering::Relaxed),
            registration_failures: self.counters.registration_failures.load(Ordering::Relaxed),
            datasets_emitted: self.counters.datasets_emitted.load(Ordering::Relaxed),
            datasets_failed: self.counters.datasets_failed.load(Ordering::Relaxed),
        }
    }
}
