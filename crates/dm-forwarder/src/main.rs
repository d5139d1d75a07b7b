// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod stdout;

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use dm_emitter::{
    config::EmitterConfig,
    emitter::{Emitter, EmitterParams},
    entity::KnownIds,
    feature_flags::{FeatureFlagManager, FLAG_PROTOCOL_V4},
    fwrequest::{Definition, ExecutorConfig, ForwardRequest},
    identity::AgentIdentityProvider,
    protocol::parse_payload_v4,
    register::http::HttpRegisterClient,
    sender::HttpMetricsSender,
};

use crate::config::ForwarderConfig;
use crate::stdout::StdoutPluginEmitter;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Gives queued datasets a chance to be emitted once input is exhausted.
async fn wait_for_drain(emitter: &Emitter) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        let pending = emitter.stats().datasets_pending();
        if pending == 0 {
            return;
        }
        if Instant::now() >= deadline {
            warn!(pending, "Datasets still pending at shutdown");
            return;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

#[tokio::main]
pub async fn main() {
    let config = match ForwarderConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let emitter_config = match EmitterConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading emitter config: {e}");
            return;
        }
    };

    let register_client = match HttpRegisterClient::new(
        &config.identity_url,
        &config.license_key,
        config.request_timeout,
    ) {
        Ok(client) => client,
        Err(e) => {
            error!("Error creating register client: {e}");
            return;
        }
    };
    let metrics_sender = match HttpMetricsSender::new(
        config.metrics_url.as_str(),
        &config.license_key,
        config.request_timeout,
    ) {
        Ok(sender) => sender,
        Err(e) => {
            error!("Error creating metrics sender: {e}");
            return;
        }
    };

    let cancel = CancellationToken::new();
    let emitter = match Emitter::new(
        EmitterParams {
            config: emitter_config,
            agent_identity: AgentIdentityProvider::new_from_static_id(config.agent_id),
            register_client: Arc::new(register_client),
            metrics_sender: Arc::new(metrics_sender),
            plugin_emitter: Arc::new(StdoutPluginEmitter),
            id_cache: KnownIds::new(),
        },
        cancel.clone(),
    ) {
        Ok(emitter) => emitter,
        Err(e) => {
            error!("Error creating emitter: {e}");
            return;
        }
    };

    let flags = FeatureFlagManager::new([(FLAG_PROTOCOL_V4, config.protocol_v4_enabled)]);
    let definition = Definition {
        name: config.integration_name.clone(),
        interval: config.integration_interval,
        executor_config: ExecutorConfig {
            user: config.integration_user.clone(),
        },
        ..Default::default()
    };

    info!(
        integration_name = %definition.name,
        "Forwarding integration payloads from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                interrupted = true;
                break;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("End of input");
                break;
            }
            Err(e) => {
                error!("Failed reading stdin: {e}");
                break;
            }
        };

        let data = match parse_payload_v4(line.trim().as_bytes(), &flags) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Discarding integration payload");
                continue;
            }
        };

        if let Err(e) = emitter
            .send(ForwardRequest::new(definition.clone(), data))
            .await
        {
            error!("Failed to forward payload: {e}");
            break;
        }
    }

    if !interrupted {
        wait_for_drain(&emitter).await;
    }

    let stats = emitter.stats();
    emitter.shutdown().await;
    info!(
        requests = stats.requests_forwarded,
        datasets = stats.datasets_received,
        registered = stats.entities_registered,
        emitted = stats.datasets_emitted,
        failed = stats.datasets_failed,
        "Forwarder stopped"
    );
}
