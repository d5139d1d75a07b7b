// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point of the dimensional data pipeline.
//!
//! ```text
//!  send() ──► inbound ──► forward consumer ──┬─► registered ──► registered consumer ──► senders
//!                                            │        ▲
//!                                            └─► to-register ──► workers ×N
//! ```
//!
//! The consumers and the worker pool are spawned on the first call to [`Emitter::send`] and
//! stay alive until the lifetime token is cancelled.

use crate::backoff::SharedBackoff;
use crate::config::EmitterConfig;
use crate::emit::{DatasetEmitter, PluginEmitter, RequestOutcomes};
use crate::entity::KnownIds;
use crate::errors::{ConfigError, EmitterError};
use crate::fwrequest::{EntityFwRequest, ForwardRequest, RequestOrigin};
use crate::identity::AgentIdentityProvider;
use crate::register::worker::{SharedReceiver, Worker, WorkerParams};
use crate::register::RegisterClient;
use crate::sender::MetricsSender;
use crate::stats::{PipelineStats, StatsSnapshot};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const STATE_IDLE: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    Idle,
    Starting,
    Running,
}

impl EmitterState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_STARTING => Self::Starting,
            STATE_RUNNING => Self::Running,
            _ => Self::Idle,
        }
    }
}

/// Collaborators and tuning of an [`Emitter`].
pub struct EmitterParams {
    pub config: EmitterConfig,
    pub agent_identity: AgentIdentityProvider,
    pub register_client: Arc<dyn RegisterClient>,
    pub metrics_sender: Arc<dyn MetricsSender>,
    pub plugin_emitter: Arc<dyn PluginEmitter>,
    pub id_cache: KnownIds,
}

/// Receiving ends of the queues, handed over to the background tasks on start.
struct Receivers {
    inbound: mpsc::Receiver<ForwardRequest>,
    to_register: mpsc::Receiver<EntityFwRequest>,
    registered: mpsc::Receiver<EntityFwRequest>,
}

struct Inner {
    state: Arc<AtomicU8>,
    config: EmitterConfig,
    cancel: CancellationToken,
    agent_identity: AgentIdentityProvider,
    register_client: Arc<dyn RegisterClient>,
    dataset_emitter: DatasetEmitter,
    id_cache: KnownIds,
    backoff: SharedBackoff,
    stats: PipelineStats,
    inbound_tx: mpsc::Sender<ForwardRequest>,
    to_register_tx: mpsc::Sender<EntityFwRequest>,
    registered_tx: mpsc::Sender<EntityFwRequest>,
    receivers: Mutex<Option<Receivers>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Accepts forward requests from any number of producers.
///
/// Cloning is cheap, all clones feed the same pipeline.
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<Inner>,
}

impl Emitter {
    pub fn new(params: EmitterParams, cancel: CancellationToken) -> Result<Self, ConfigError> {
        params.config.validate()?;

        let queue_len = params.config.queue_len;
        let (inbound_tx, inbound) = mpsc::channel(queue_len);
        let (to_register_tx, to_register) = mpsc::channel(queue_len);
        let (registered_tx, registered) = mpsc::channel(queue_len);

        Ok(Self {
            inner: Arc::new(Inner {
                state: Arc::new(AtomicU8::new(STATE_IDLE)),
                backoff: SharedBackoff::new(params.config.backoff),
                config: params.config,
                cancel,
                agent_identity: params.agent_identity,
                register_client: params.register_client,
                dataset_emitter: DatasetEmitter::new(params.plugin_emitter, params.metrics_sender),
                id_cache: params.id_cache,
                stats: PipelineStats::new(),
                inbound_tx,
                to_register_tx,
                registered_tx,
                receivers: Mutex::new(Some(Receivers {
                    inbound,
                    to_register,
                    registered,
                })),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Queues a forward request, waiting for room when the inbound queue is full.
    pub async fn send(&self, request: ForwardRequest) -> Result<(), EmitterError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(EmitterError::ShuttingDown);
        }
        self.start();

        let datasets = request.data.datasets.len();
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => Err(EmitterError::ShuttingDown),
            result = inner.inbound_tx.send(request) => {
                result.map_err(|_| EmitterError::QueueClosed)?;
                inner.stats.on_request_forwarded();
                inner.stats.on_datasets_received(datasets);
                Ok(())
            }
        }
    }

    pub fn state(&self) -> EmitterState {
        EmitterState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Identity cache shared with the registration workers.
    pub fn id_cache(&self) -> &KnownIds {
        &self.inner.id_cache
    }

    /// Cancels the pipeline and waits for its tasks to exit. Queued entries are discarded.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Emitter task ended abnormally");
            }
        }
    }

    fn start(&self) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_STARTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let receivers = match inner.receivers.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(receivers) = receivers else {
            error!("Emitter queues were already consumed, pipeline not started");
            inner.state.store(STATE_IDLE, Ordering::Release);
            return;
        };

        let mut tasks = Vec::with_capacity(inner.config.workers + 2);

        let forward = ForwardConsumer {
            inbound: receivers.inbound,
            to_register: inner.to_register_tx.clone(),
            registered: inner.registered_tx.clone(),
            id_cache: inner.id_cache.clone(),
            state: inner.state.clone(),
            next_seq: 0,
        };
        tasks.push(tokio::spawn(forward.run(inner.cancel.clone())));

        let registered = RegisteredConsumer {
            registered: receivers.registered,
            emitter: inner.dataset_emitter.clone(),
            stats: inner.stats.clone(),
            outcomes: RequestOutcomes::new(),
        };
        tasks.push(tokio::spawn(registered.run(inner.cancel.clone())));

        let shared_to_register: SharedReceiver =
            Arc::new(tokio::sync::Mutex::new(receivers.to_register));
        for id in 0..inner.config.workers {
            let worker = Worker::new(
                id,
                WorkerParams {
                    agent_identity: inner.agent_identity.clone(),
                    client: inner.register_client.clone(),
                    backoff: inner.backoff.clone(),
                    reqs_to_register: shared_to_register.clone(),
                    reqs_registered: inner.registered_tx.clone(),
                    id_cache: inner.id_cache.clone(),
                    config: inner.config.batch,
                    stats: inner.stats.clone(),
                },
            );
            tasks.push(tokio::spawn(worker.run(inner.cancel.clone())));
        }

        match inner.tasks.lock() {
            Ok(mut slot) => slot.extend(tasks),
            Err(poisoned) => poisoned.into_inner().extend(tasks),
        }

        // the forward consumer resets the state on exit, never overwrite that
        let _ = inner.state.compare_exchange(
            STATE_STARTING,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug!(workers = inner.config.workers, "Dimensional data emitter started");
    }
}

/// Routes every dataset of inbound requests either to emission or to registration.
struct ForwardConsumer {
    inbound: mpsc::Receiver<ForwardRequest>,
    to_register: mpsc::Sender<EntityFwRequest>,
    registered: mpsc::Sender<EntityFwRequest>,
    id_cache: KnownIds,
    state: Arc<AtomicU8>,
    next_seq: u64,
}

impl ForwardConsumer {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = self.inbound.recv() => request,
            };
            let Some(request) = request else {
                break;
            };
            if !self.route(request, &cancel).await {
                break;
            }
        }

        self.state.store(STATE_IDLE, Ordering::Release);
        debug!("Forward request consumer stopped");
    }

    /// Returns false once the pipeline is going away.
    async fn route(&mut self, request: ForwardRequest, cancel: &CancellationToken) -> bool {
        let origin = RequestOrigin {
            seq: self.next_seq,
            datasets: request.data.datasets.len(),
        };
        self.next_seq = self.next_seq.wrapping_add(1);

        let ForwardRequest { meta, data } = request;
        for dataset in data.datasets {
            let (queue, id) = if dataset.ignore_entity {
                (&self.registered, None)
            } else {
                match self.id_cache.get(&dataset.entity_key()) {
                    Some(id) => (&self.registered, Some(id)),
                    None => (&self.to_register, None),
                }
            };
            let entity_request =
                EntityFwRequest::new(meta.clone(), data.integration.clone(), dataset, id)
                    .with_origin(origin);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                result = queue.send(entity_request) => {
                    if result.is_err() {
                        debug!("Pipeline queue closed, dropping dataset");
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Emits registered datasets, reporting failures once per forward request.
struct RegisteredConsumer {
    registered: mpsc::Receiver<EntityFwRequest>,
    emitter: DatasetEmitter,
    stats: PipelineStats,
    outcomes: RequestOutcomes,
}

impl RegisteredConsumer {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = self.registered.recv() => request,
            };
            let Some(request) = request else {
                break;
            };

            let result = self.emitter.emit_dataset(&request).await;
            match &result {
                Ok(()) => self.stats.on_datasets_emitted(1),
                Err(_) => self.stats.on_datasets_failed(1),
            }

            let Some(completed) = self.outcomes.record(&request, result) else {
                continue;
            };
            if let Some(e) = completed.error {
                warn!(
                    integration_name = %completed.integration_name,
                    datasets = completed.datasets,
                    error = %e,
                    "Failed to emit forward request datasets"
                );
            }
        }
        debug!(
            pending_requests = self.outcomes.in_flight(),
            "Registered request consumer stopped"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, EntityKey};
    use crate::errors::SendError;
    use crate::processor::NormalizedMetric;
    use crate::protocol::{Common, DataV4, Dataset, IntegrationMetadata};
    use crate::test_support::{
        dataset, definition, MockRegisterClient, RecordingMetricsSender, RecordingPluginEmitter,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct Fixture {
        emitter: Emitter,
        client: Arc<MockRegisterClient>,
        sender: Arc<RecordingMetricsSender>,
        plugins: Arc<RecordingPluginEmitter>,
    }

    fn fixture(id_cache: KnownIds) -> Fixture {
        let client = Arc::new(MockRegisterClient::new());
        let sender = Arc::new(RecordingMetricsSender::default());
        let plugins = Arc::new(RecordingPluginEmitter::default());
        let emitter = Emitter::new(
            EmitterParams {
                config: EmitterConfig::default(),
                agent_identity: AgentIdentityProvider::new_from_static_id(EntityId::new(1)),
                register_client: client.clone(),
                metrics_sender: sender.clone(),
                plugin_emitter: plugins.clone(),
                id_cache,
            },
            CancellationToken::new(),
        )
        .unwrap();
        Fixture {
            emitter,
            client,
            sender,
            plugins,
        }
    }

    fn request(datasets: Vec<Dataset>) -> ForwardRequest {
        ForwardRequest::new(
            definition(),
            DataV4 {
                protocol_version: "4".to_string(),
                integration: IntegrationMetadata {
                    name: "nri-test".to_string(),
                    version: "1.0.0".to_string(),
                },
                datasets,
            },
        )
    }

    fn with_event(mut ds: Dataset) -> Dataset {
        let serde_json::Value::Object(event) = json!({"summary": "hello"}) else {
            unreachable!()
        };
        ds.events.push(event);
        ds
    }

    async fn wait_for(what: &str, condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_lazy_start_and_shutdown() {
        let f = fixture(KnownIds::new());
        assert_eq!(f.emitter.state(), EmitterState::Idle);

        let mut ds = dataset("host-A");
        ds.ignore_entity = true;
        f.emitter.send(request(vec![ds])).await.unwrap();
        assert_eq!(f.emitter.state(), EmitterState::Running);

        wait_for("metrics sent", || f.sender.sent.lock().unwrap().len() == 1).await;

        f.emitter.shutdown().await;
        assert_eq!(f.emitter.state(), EmitterState::Idle);
        assert_eq!(
            f.emitter.send(request(vec![])).await,
            Err(EmitterError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn test_ignored_entities_skip_registration() {
        // a cached identifier would end up in the event if the cache were consulted
        let cache = KnownIds::new();
        cache.put(EntityKey::from("host-A"), EntityId::new(55));
        let f = fixture(cache);
        let mut ds = with_event(dataset("host-A"));
        ds.ignore_entity = true;

        f.emitter.send(request(vec![ds])).await.unwrap();

        wait_for("event emitted", || f.plugins.events.lock().unwrap().len() == 1).await;
        wait_for("metrics sent", || f.sender.sent.lock().unwrap().len() == 1).await;
        assert!(f.client.calls().is_empty());
        let events = f.plugins.events.lock().unwrap();
        assert!(events[0].0.get("entityID").is_none());
        assert!(events[0].0.get("entityKey").is_none());
        drop(events);
        let sent = f.sender.sent.lock().unwrap();
        assert!(!sent[0].metrics[0].attributes.contains_key("entity.id"));
        drop(sent);
        f.emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_datasets_are_accounted_per_request() {
        let f = fixture(KnownIds::new());
        *f.sender.fail_with.lock().unwrap() = Some("timeout".to_string());

        let ignored = |name: &str| {
            let mut ds = dataset(name);
            ds.ignore_entity = true;
            ds
        };
        let first = f.emitter.clone();
        let second = f.emitter.clone();
        let (a, b) = tokio::join!(
            first.send(request(vec![ignored("host-A"), ignored("host-B")])),
            second.send(request(vec![ignored("host-C"), ignored("host-D"), ignored("host-E")])),
        );
        a.unwrap();
        b.unwrap();

        wait_for("datasets processed", || {
            f.emitter.stats().datasets_pending() == 0
        })
        .await;
        let stats = f.emitter.stats();
        assert_eq!(stats.requests_forwarded, 2);
        assert_eq!(stats.datasets_received, 5);
        assert_eq!(stats.datasets_failed, 5);
        assert_eq!(stats.datasets_emitted, 0);
        f.emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_correlation_id_reaches_events() {
        let f = fixture(KnownIds::new());
        let mut ds = with_event(dataset("host-A"));
        ds.ignore_entity = true;

        f.emitter
            .send(request(vec![ds]).with_correlation_id("req-42"))
            .await
            .unwrap();

        wait_for("event emitted", || f.plugins.events.lock().unwrap().len() == 1).await;
        let events = f.plugins.events.lock().unwrap();
        assert_eq!(events[0].0.get("correlationId").unwrap(), "req-42");
        drop(events);
        f.emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_registration_then_cache_hit() {
        let f = fixture(KnownIds::new());

        f.emitter
            .send(request(vec![with_event(dataset("host-A"))]))
            .await
            .unwrap();
        wait_for("first event", || f.plugins.events.lock().unwrap().len() == 1).await;
        assert_eq!(f.client.calls().len(), 1);
        let assigned = f.client.id_for("host-A");
        assert_eq!(
            f.emitter.id_cache().get(&EntityKey::from("host-A")),
            Some(assigned)
        );

        f.emitter
            .send(request(vec![with_event(dataset("host-A"))]))
            .await
            .unwrap();
        wait_for("second event", || f.plugins.events.lock().unwrap().len() == 2).await;

        // the second dataset took the cached identifier
        assert_eq!(f.client.calls().len(), 1);
        let events = f.plugins.events.lock().unwrap();
        assert_eq!(events[1].0.get("entityID").unwrap(), assigned.value());

        let stats = f.emitter.stats();
        assert_eq!(stats.requests_forwarded, 2);
        assert_eq!(stats.entities_registered, 1);
        drop(events);
        f.emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_preseeded_cache_bypasses_registration() {
        let cache = KnownIds::new();
        cache.put(EntityKey::from("host-B"), EntityId::new(77));
        let f = fixture(cache);

        f.emitter
            .send(request(vec![with_event(dataset("host-B"))]))
            .await
            .unwrap();

        wait_for("event emitted", || f.plugins.events.lock().unwrap().len() == 1).await;
        assert!(f.client.calls().is_empty());
        let events = f.plugins.events.lock().unwrap();
        assert_eq!(events[0].0.get("entityID").unwrap(), 77);
        drop(events);
        f.emitter.shutdown().await;
    }

    /// Metrics sender holding every call until permits are released.
    struct GatedMetricsSender {
        gate: Semaphore,
    }

    #[async_trait]
    impl MetricsSender for GatedMetricsSender {
        async fn send_metrics_with_common_attributes(
            &self,
            _common: &Common,
            _metrics: Vec<NormalizedMetric>,
        ) -> Result<(), SendError> {
            self.gate.acquire().await.unwrap().forget();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_blocks_while_queues_are_full() {
        let sender = Arc::new(GatedMetricsSender {
            gate: Semaphore::new(0),
        });
        let emitter = Emitter::new(
            EmitterParams {
                config: EmitterConfig {
                    queue_len: 1,
                    ..Default::default()
                },
                agent_identity: AgentIdentityProvider::new_from_static_id(EntityId::new(1)),
                register_client: Arc::new(MockRegisterClient::new()),
                metrics_sender: sender.clone(),
                plugin_emitter: Arc::new(RecordingPluginEmitter::default()),
                id_cache: KnownIds::new(),
            },
            CancellationToken::new(),
        )
        .unwrap();

        let mut blocked = None;
        for i in 0..10 {
            let mut ds = dataset(&format!("host-{i}"));
            ds.ignore_entity = true;
            let emitter = emitter.clone();
            let handle = tokio::spawn(async move { emitter.send(request(vec![ds])).await });
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !handle.is_finished() {
                blocked = Some(handle);
                break;
            }
        }
        let blocked = blocked.expect("send never blocked on a saturated pipeline");

        sender.gate.add_permits(100);
        let result = tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .expect("send unblocked after a drain")
            .unwrap();
        assert_eq!(result, Ok(()));
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = Emitter::new(
            EmitterParams {
                config: EmitterConfig {
                    workers: 0,
                    ..Default::default()
                },
                agent_identity: AgentIdentityProvider::new_from_static_id(EntityId::new(1)),
                register_client: Arc::new(MockRegisterClient::new()),
                metrics_sender: Arc::new(RecordingMetricsSender::default()),
                plugin_emitter: Arc::new(RecordingPluginEmitter::default()),
                id_cache: KnownIds::new(),
            },
            CancellationToken::new(),
        );
        assert!(result.is_err());
    }
}
