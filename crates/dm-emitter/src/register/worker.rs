// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registration worker.
//!
//! Every worker pulls entity requests from the shared to-register queue, groups them into
//! batches and registers each batch with a single remote call:
//!
//! ```text
//!  to-register queue ──> accumulate ──> Pending ──> InFlight ──┬──> Succeeded ──> registered queue
//!                        (count |                      ^       │
//!                         bytes |                      │       └──> FailedAwaitingBackoff
//!                         time)                        └────────────── (shared backoff delay)
//! ```
//!
//! A batch is closed by whichever limit is reached first. Entities the service rejects are
//! retried after the shared backoff delay, for as long as the worker runs; accepted entities
//! are cached and forwarded right away without waiting for their rejected siblings.

use crate::backoff::SharedBackoff;
use crate::entity::{EntityKey, KnownIds};
use crate::errors::RegisterError;
use crate::fwrequest::EntityFwRequest;
use crate::identity::AgentIdentityProvider;
use crate::register::{RegisterClient, RegisterEntity, RegisterEntityResponse};
use crate::stats::PipelineStats;
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
/// Size limit for a register call payload (1MB).
pub const DEFAULT_MAX_BATCH_SIZE_BYTES: usize = 1000 * 1000;
pub const DEFAULT_MAX_BATCH_DURATION: Duration = Duration::from_secs(1);

/// Queue of entity requests shared by all workers of the pool.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<EntityFwRequest>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub max_batch_size: usize,
    pub max_batch_size_bytes: usize,
    pub max_batch_duration: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_size_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
            max_batch_duration: DEFAULT_MAX_BATCH_DURATION,
        }
    }
}

/// Entity request waiting for an identifier, with its pre-computed descriptor.
#[derive(Debug)]
struct PendingEntity {
    request: EntityFwRequest,
    descriptor: RegisterEntity,
    size: usize,
}

impl PendingEntity {
    fn new(request: EntityFwRequest) -> Self {
        let descriptor = RegisterEntity::from(&request.data.entity);
        let size = descriptor.serialized_len();
        Self {
            request,
            descriptor,
            size,
        }
    }
}

#[derive(Debug, Default)]
struct Batch {
    items: Vec<PendingEntity>,
    bytes: usize,
}

impl Batch {
    fn push(&mut self, pending: PendingEntity) {
        self.bytes += pending.size;
        self.items.push(pending);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Lifecycle of one batch inside [`Worker::register`].
#[derive(Debug)]
enum BatchState {
    Pending(Vec<PendingEntity>),
    InFlight(Vec<PendingEntity>),
    FailedAwaitingBackoff {
        retry: Vec<PendingEntity>,
        delay: Duration,
    },
    Succeeded,
}

/// Why batch accumulation stopped.
#[derive(Debug, PartialEq, Eq)]
enum Closed {
    Full,
    Timeout,
    Cancelled,
    QueueClosed,
}

pub struct Worker {
    id: usize,
    agent_identity: AgentIdentityProvider,
    client: Arc<dyn RegisterClient>,
    backoff: SharedBackoff,
    reqs_to_register: SharedReceiver,
    reqs_registered: mpsc::Sender<EntityFwRequest>,
    id_cache: KnownIds,
    config: WorkerConfig,
    stats: PipelineStats,
    // entity that did not fit in the previous batch
    carry_over: Option<PendingEntity>,
}

pub struct WorkerParams {
    pub agent_identity: AgentIdentityProvider,
    pub client: Arc<dyn RegisterClient>,
    pub backoff: SharedBackoff,
    pub reqs_to_register: SharedReceiver,
    pub reqs_registered: mpsc::Sender<EntityFwRequest>,
    pub id_cache: KnownIds,
    pub config: WorkerConfig,
    pub stats: PipelineStats,
}

impl Worker {
    pub fn new(id: usize, params: WorkerParams) -> Self {
        Self {
            id,
            agent_identity: params.agent_identity,
            client: params.client,
            backoff: params.backoff,
            reqs_to_register: params.reqs_to_register,
            reqs_registered: params.reqs_registered,
            id_cache: params.id_cache,
            config: params.config,
            stats: params.stats,
            carry_over: None,
        }
    }

    /// Runs until `cancel` fires or the to-register queue closes. A partially accumulated
    /// batch is submitted once on the way out.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(worker = self.id, "Register worker started");

        loop {
            let (batch, closed) = self.accumulate(&cancel).await;
            if !batch.is_empty() {
                trace!(
                    worker = self.id,
                    entities = batch.len(),
                    bytes = batch.bytes,
                    reason = ?closed,
                    "Register batch closed"
                );
                self.register(batch.items, &cancel).await;
            }
            if matches!(closed, Closed::Cancelled | Closed::QueueClosed) {
                break;
            }
        }

        debug!(worker = self.id, "Register worker stopped");
    }

    async fn accumulate(&mut self, cancel: &CancellationToken) -> (Batch, Closed) {
        let mut batch = Batch::default();
        let mut deadline: Option<Instant> = None;

        if let Some(pending) = self.carry_over.take() {
            batch.push(pending);
            deadline = Some(Instant::now() + self.config.max_batch_duration);
            if self.is_full(&batch) {
                return (batch, Closed::Full);
            }
        }

        loop {
            let timer = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (batch, Closed::Cancelled),
                _ = timer, if deadline.is_some() => return (batch, Closed::Timeout),
                received = recv_shared(&self.reqs_to_register) => received,
            };

            let Some(request) = received else {
                return (batch, Closed::QueueClosed);
            };

            let pending = PendingEntity::new(request);
            if !batch.is_empty() && batch.bytes + pending.size > self.config.max_batch_size_bytes {
                self.carry_over = Some(pending);
                return (batch, Closed::Full);
            }

            batch.push(pending);
            if deadline.is_none() {
                deadline = Some(Instant::now() + self.config.max_batch_duration);
            }
            if self.is_full(&batch) {
                return (batch, Closed::Full);
            }
        }
    }

    fn is_full(&self, batch: &Batch) -> bool {
        batch.len() >= self.config.max_batch_size
            || batch.bytes >= self.config.max_batch_size_bytes
    }

    /// Drives one batch until every entity is registered or the worker is cancelled.
    async fn register(&self, batch: Vec<PendingEntity>, cancel: &CancellationToken) {
        let mut state = BatchState::Pending(batch);
        loop {
            state = match state {
                BatchState::Pending(batch) => BatchState::InFlight(batch),
                BatchState::InFlight(batch) => self.call_register(batch, cancel).await,
                BatchState::FailedAwaitingBackoff { retry, delay } => {
                    if cancel.is_cancelled() {
                        debug!(
                            worker = self.id,
                            entities = retry.len(),
                            "Dropping unregistered entities on shutdown"
                        );
                        return;
                    }
                    debug!(
                        worker = self.id,
                        entities = retry.len(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Retrying entity registration after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => BatchState::InFlight(retry),
                        _ = cancel.cancelled() => {
                            debug!(
                                worker = self.id,
                                entities = retry.len(),
                                "Dropping unregistered entities on shutdown"
                            );
                            return;
                        }
                    }
                }
                BatchState::Succeeded => return,
            };
        }
    }

    async fn call_register(
        &self,
        batch: Vec<PendingEntity>,
        cancel: &CancellationToken,
    ) -> BatchState {
        let responses = match self.agent_identity.get_agent_id().await {
            Some(agent_id) => {
                let descriptors: Vec<RegisterEntity> =
                    batch.iter().map(|p| p.descriptor.clone()).collect();
                self.client.register_batch(agent_id, &descriptors).await
            }
            None => Err(RegisterError::MissingAgentIdentity),
        };

        let responses = match responses {
            Ok(responses) => responses,
            Err(e) => {
                self.stats.on_registration_failures(batch.len());
                let delay = self.backoff.register_error();
                warn!(
                    worker = self.id,
                    entities = batch.len(),
                    error = %e,
                    "Entity registration call failed"
                );
                return BatchState::FailedAwaitingBackoff {
                    retry: batch,
                    delay,
                };
            }
        };

        let outcomes: HashMap<EntityKey, RegisterEntityResponse> = responses
            .into_iter()
            .map(|response| (response.key.clone(), response))
            .collect();

        let mut failed = Vec::new();
        let mut registered = 0;
        for pending in batch {
            let key = pending.descriptor.key();
            let outcome = outcomes.get(&key);
            match outcome.and_then(RegisterEntityResponse::assigned_id) {
                Some(id) => {
                    self.id_cache.put(key, id);
                    registered += 1;
                    self.forward(pending.request.registered_with(id), cancel)
                        .await;
                }
                None => {
                    let reason = outcome
                        .and_then(|o| o.err.as_deref())
                        .unwrap_or("missing from register response");
                    warn!(
                        worker = self.id,
                        entity_key = %key,
                        reason,
                        "Entity registration rejected"
                    );
                    failed.push(pending);
                }
            }
        }
        self.stats.on_entities_registered(registered);

        if failed.is_empty() {
            self.backoff.register_success();
            return BatchState::Succeeded;
        }

        self.stats.on_registration_failures(failed.len());
        BatchState::FailedAwaitingBackoff {
            delay: self.backoff.register_error(),
            retry: failed,
        }
    }

    async fn forward(&self, request: EntityFwRequest, cancel: &CancellationToken) {
        tokio::select! {
            biased;
            result = self.reqs_registered.send(request) => {
                if result.is_err() {
                    debug!(worker = self.id, "Registered queue closed, dropping dataset");
                }
            }
            _ = cancel.cancelled() => {
                debug!(worker = self.id, "Dropping registered dataset on shutdown");
            }
        }
    }
}

async fn recv_shared(rx: &SharedReceiver) -> Option<EntityFwRequest> {
    rx.lock().await.recv().await
}
