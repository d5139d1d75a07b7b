// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::entity::EntityId;
use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};
use tokio::sync::OnceCell;

pub type AgentIdResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<EntityId>> + Send>> + Send + Sync>;

/// Source of the agent's own entity id, sent along with every registration call.
///
/// The agent usually registers itself asynchronously at startup, so the dynamic variant
/// defers resolution until the first registration batch needs it. A resolver returning
/// `None` is asked again on the next call.
#[derive(Clone)]
pub enum AgentIdentityProvider {
    Static(EntityId),
    Dynamic {
        resolver_fn: AgentIdResolverFn,
        agent_id: Arc<OnceCell<EntityId>>,
    },
}

impl AgentIdentityProvider {
    pub fn new_from_resolver(resolver_fn: AgentIdResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            agent_id: Arc::new(OnceCell::new()),
        }
    }

    pub fn new_from_static_id(agent_id: EntityId) -> Self {
        Self::Static(agent_id)
    }

    pub async fn get_agent_id(&self) -> Option<EntityId> {
        match self {
            Self::Static(agent_id) => Some(*agent_id),
            Self::Dynamic {
                resolver_fn,
                agent_id,
            } => agent_id
                .get_or_try_init(|| async { (resolver_fn)().await.ok_or(()) })
                .await
                .ok()
                .copied(),
        }
    }
}

impl Debug for AgentIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AgentIdentityProvider")
    }
}
